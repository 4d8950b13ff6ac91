// db/queue.rs - Durable write-ahead request queue with fingerprint dedup

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

/// Allowed HTTP methods for queued requests
pub const ALLOWED_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS", "POST", "PUT", "PATCH", "DELETE"];

/// Status lifecycle of a queued request
///
/// `Completed` and `Failed` are terminal; the only sanctioned re-entry is
/// `completed -> pending` when conflict resolution decides the local copy
/// wins and the request must be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    /// Parse a stored status, rejecting anything outside the closed set.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(Error::Database(format!(
                "Unknown request status in sync_queue: {}",
                other
            ))),
        }
    }
}

/// A row of the durable request queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: i64,
    pub method: String,
    pub url: String,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub request_hash: String,
    pub status: RequestStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_version: Option<String>,
}

/// Raw row shape before status validation
#[derive(sqlx::FromRow)]
struct QueuedRequestRow {
    id: i64,
    method: String,
    url: String,
    headers: Option<String>,
    body: Option<String>,
    request_hash: String,
    status: String,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    error_message: Option<String>,
    resource_id: Option<String>,
    resource_type: Option<String>,
    resource_version: Option<String>,
}

impl TryFrom<QueuedRequestRow> for QueuedRequest {
    type Error = Error;

    fn try_from(row: QueuedRequestRow) -> Result<Self> {
        Ok(QueuedRequest {
            id: row.id,
            method: row.method,
            url: row.url,
            headers: row.headers,
            body: row.body,
            request_hash: row.request_hash,
            status: RequestStatus::parse(&row.status)?,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            error_message: row.error_message,
            resource_id: row.resource_id,
            resource_type: row.resource_type,
            resource_version: row.resource_version,
        })
    }
}

/// Outcome of an enqueue call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enqueued {
    pub id: i64,
    /// True when an identical request was already queued and its id was
    /// returned instead of inserting a new row.
    pub deduplicated: bool,
}

/// Queue statistics grouped by status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Compute the content fingerprint of a request.
///
/// The digest is SHA-256 over `METHOD:URL:BODY` (empty string when the body
/// is absent), rendered as lowercase hex. The same content must hash the
/// same everywhere, so the method is normalized to uppercase and nothing
/// else is touched.
pub fn fingerprint(method: &str, url: &str, body: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_uppercase().as_bytes());
    hasher.update(b":");
    hasher.update(url.as_bytes());
    hasher.update(b":");
    hasher.update(body.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

const SELECT_COLUMNS: &str = "id, method, url, headers, body, request_hash, status, retry_count, \
     next_retry_at, created_at, updated_at, error_message, resource_id, resource_type, resource_version";

/// Durable FIFO request queue backed by the sync_queue table
#[derive(Clone)]
pub struct RequestQueue {
    pool: SqlitePool,
}

impl RequestQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue a request, deduplicating on the content fingerprint.
    ///
    /// A uniqueness clash is an expected outcome: the existing row's id is
    /// returned and nothing is modified.
    pub async fn enqueue(
        &self,
        method: &str,
        url: &str,
        headers: Option<&str>,
        body: Option<&str>,
    ) -> Result<Enqueued> {
        let method = method.to_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(Error::InvalidInput(format!(
                "Unsupported HTTP method: {}",
                method
            )));
        }

        let hash = fingerprint(&method, url, body);
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO sync_queue (method, url, headers, body, request_hash, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
            ON CONFLICT(request_hash) DO NOTHING
            "#,
        )
        .bind(&method)
        .bind(url)
        .bind(headers)
        .bind(body)
        .bind(&hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            let id = result.last_insert_rowid();
            tracing::debug!("Enqueued {} {} as request {}", method, url, id);
            return Ok(Enqueued {
                id,
                deduplicated: false,
            });
        }

        // The in-memory dedup fast path lives upstream; the unique
        // constraint is authoritative, so look the winner up here.
        let (existing_id,): (i64,) =
            sqlx::query_as("SELECT id FROM sync_queue WHERE request_hash = ?")
                .bind(&hash)
                .fetch_one(&self.pool)
                .await?;

        tracing::debug!(
            "Deduplicated {} {} onto existing request {}",
            method,
            url,
            existing_id
        );

        Ok(Enqueued {
            id: existing_id,
            deduplicated: true,
        })
    }

    /// Fetch up to `limit` pending requests whose retry time has come,
    /// oldest first.
    pub async fn ready_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueuedRequest>> {
        let rows: Vec<QueuedRequestRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM sync_queue
            WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY created_at ASC
            LIMIT ?
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueuedRequest::try_from).collect()
    }

    /// Look a request up by id.
    pub async fn by_id(&self, id: i64) -> Result<Option<QueuedRequest>> {
        let row: Option<QueuedRequestRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM sync_queue WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(QueuedRequest::try_from).transpose()
    }

    /// Set the status of a request, recording an optional error message.
    pub async fn update_status(
        &self,
        id: i64,
        status: RequestStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = ?, error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bump the retry counter. retry_count only ever grows here; the
    /// explicit operator reset is the one sanctioned decrease.
    pub async fn increment_retry(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET retry_count = retry_count + 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Schedule the next attempt `delay_ms` from now.
    pub async fn set_next_retry(&self, id: i64, delay_ms: u64) -> Result<()> {
        let next = Utc::now() + Duration::milliseconds(delay_ms as i64);

        sqlx::query(
            r#"
            UPDATE sync_queue
            SET next_retry_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(next)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Counts grouped by status, plus the age marker of the oldest
    /// pending request.
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match RequestStatus::parse(&status)? {
                RequestStatus::Pending => stats.pending = count,
                RequestStatus::Processing => stats.processing = count,
                RequestStatus::Completed => stats.completed = count,
                RequestStatus::Failed => stats.failed = count,
            }
        }

        stats.oldest_pending = sqlx::query_scalar(
            "SELECT created_at FROM sync_queue WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(stats)
    }

    /// Operator listing, newest first, optionally filtered by status.
    pub async fn list(
        &self,
        limit: i64,
        status: Option<RequestStatus>,
    ) -> Result<Vec<QueuedRequest>> {
        let rows: Vec<QueuedRequestRow> = match status {
            Some(status) => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {SELECT_COLUMNS} FROM sync_queue
                    WHERE status = ?
                    ORDER BY created_at DESC
                    LIMIT ?
                    "#
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {SELECT_COLUMNS} FROM sync_queue
                    ORDER BY created_at DESC
                    LIMIT ?
                    "#
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(QueuedRequest::try_from).collect()
    }

    /// Remove a request outright.
    pub async fn remove(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("No queued request with id {}", id)));
        }

        tracing::debug!("Removed queued request {}", id);
        Ok(())
    }

    /// Put a request back in rotation immediately, optionally zeroing its
    /// retry counter.
    ///
    /// Completed requests are off limits: the only sanctioned
    /// completed-to-pending transition belongs to conflict resolution.
    pub async fn retry_now(&self, id: i64, reset_retry_count: bool) -> Result<()> {
        let current = self
            .by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No queued request with id {}", id)))?;

        if current.status == RequestStatus::Completed {
            return Err(Error::Validation(format!(
                "Request {} already completed; it cannot be retried",
                id
            )));
        }

        let sql = if reset_retry_count {
            r#"
            UPDATE sync_queue
            SET status = 'pending', next_retry_at = NULL, retry_count = 0,
                error_message = NULL, updated_at = ?
            WHERE id = ? AND status != 'completed'
            "#
        } else {
            r#"
            UPDATE sync_queue
            SET status = 'pending', next_retry_at = NULL, error_message = NULL, updated_at = ?
            WHERE id = ? AND status != 'completed'
            "#
        };

        sqlx::query(sql)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        tracing::info!("Request {} queued for immediate retry", id);
        Ok(())
    }

    /// Return rows stranded in `processing` by an unclean exit to
    /// `pending` so the next drain picks them up.
    pub async fn recover_stale_processing(&self) -> Result<i64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'pending', updated_at = ?
            WHERE status = 'processing'
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected() as i64;
        if recovered > 0 {
            tracing::warn!("Recovered {} requests stuck in processing", recovered);
        }
        Ok(recovered)
    }

    /// Reset every failed request for another round of attempts.
    pub async fn retry_all_failed(&self) -> Result<i64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'pending', retry_count = 0, next_retry_at = NULL,
                error_message = NULL, updated_at = ?
            WHERE status = 'failed'
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let updated = result.rows_affected() as i64;
        tracing::info!("Reset {} failed requests for retry", updated);
        Ok(updated)
    }

    /// Drop every failed request (manual intervention).
    pub async fn clear_failed(&self) -> Result<i64> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE status = 'failed'")
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as i64;
        tracing::info!("Cleared {} failed requests", deleted);
        Ok(deleted)
    }

    /// Retention sweep: remove rows created before the threshold.
    pub async fn sweep(&self, older_than: DateTime<Utc>) -> Result<i64> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE created_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as i64;
        if deleted > 0 {
            tracing::info!("Swept {} requests older than {}", deleted, older_than);
        }
        Ok(deleted)
    }
}
