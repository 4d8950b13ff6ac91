// db/conflicts.rs - Conflict records and resolution state

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// How a conflict was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    VersionMismatch,
    ModifiedConflict,
    DeleteConflict,
}

impl ConflictType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::VersionMismatch => "version_mismatch",
            ConflictType::ModifiedConflict => "modified_conflict",
            ConflictType::DeleteConflict => "delete_conflict",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "version_mismatch" => Ok(ConflictType::VersionMismatch),
            "modified_conflict" => Ok(ConflictType::ModifiedConflict),
            "delete_conflict" => Ok(ConflictType::DeleteConflict),
            other => Err(Error::Database(format!(
                "Unknown conflict type in conflict_log: {}",
                other
            ))),
        }
    }
}

/// Resolution state of a conflict record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Pending,
    LocalWins,
    ServerWins,
    Manual,
    Skip,
    Rejected,
}

impl ResolutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStatus::Pending => "pending",
            ResolutionStatus::LocalWins => "local_wins",
            ResolutionStatus::ServerWins => "server_wins",
            ResolutionStatus::Manual => "manual",
            ResolutionStatus::Skip => "skip",
            ResolutionStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ResolutionStatus::Pending),
            "local_wins" => Ok(ResolutionStatus::LocalWins),
            "server_wins" => Ok(ResolutionStatus::ServerWins),
            "manual" => Ok(ResolutionStatus::Manual),
            "skip" => Ok(ResolutionStatus::Skip),
            "rejected" => Ok(ResolutionStatus::Rejected),
            other => Err(Error::Database(format!(
                "Unknown resolution status in conflict_log: {}",
                other
            ))),
        }
    }

    /// Resolutions an operator may apply by hand.
    pub fn parse_manual(s: &str) -> Result<Self> {
        match s {
            "local_wins" | "server_wins" | "manual" | "skip" => Self::parse(s),
            other => Err(Error::Validation(format!(
                "Invalid resolution: {} (expected local_wins, server_wins, manual or skip)",
                other
            ))),
        }
    }
}

/// One detected conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub local_request_id: Option<i64>,
    pub local_data: Option<String>,
    pub server_data: Option<String>,
    pub server_version: Option<String>,
    pub conflict_type: ConflictType,
    pub resolution_status: ResolutionStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    id: i64,
    resource_id: Option<String>,
    resource_type: Option<String>,
    local_request_id: Option<i64>,
    local_data: Option<String>,
    server_data: Option<String>,
    server_version: Option<String>,
    conflict_type: String,
    resolution_status: String,
    resolved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ConflictRow> for ConflictRecord {
    type Error = Error;

    fn try_from(row: ConflictRow) -> Result<Self> {
        Ok(ConflictRecord {
            id: row.id,
            resource_id: row.resource_id,
            resource_type: row.resource_type,
            local_request_id: row.local_request_id,
            local_data: row.local_data,
            server_data: row.server_data,
            server_version: row.server_version,
            conflict_type: ConflictType::parse(&row.conflict_type)?,
            resolution_status: ResolutionStatus::parse(&row.resolution_status)?,
            resolved_at: row.resolved_at,
            created_at: row.created_at,
        })
    }
}

/// Parameters for recording a new conflict
#[derive(Debug, Clone, Default)]
pub struct NewConflict {
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub local_request_id: Option<i64>,
    pub local_data: Option<String>,
    pub server_data: Option<String>,
    pub server_version: Option<String>,
}

/// Counts grouped by resolution status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictStats {
    pub pending: i64,
    pub resolved: i64,
}

const SELECT_COLUMNS: &str = "id, resource_id, resource_type, local_request_id, local_data, \
     server_data, server_version, conflict_type, resolution_status, resolved_at, created_at";

/// Conflict store backed by the conflict_log table
#[derive(Clone)]
pub struct ConflictStore {
    pool: SqlitePool,
}

impl ConflictStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a detected conflict, returning its id.
    pub async fn record(&self, conflict: NewConflict, kind: ConflictType) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO conflict_log
                (resource_id, resource_type, local_request_id, local_data,
                 server_data, server_version, conflict_type, resolution_status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&conflict.resource_id)
        .bind(&conflict.resource_type)
        .bind(conflict.local_request_id)
        .bind(&conflict.local_data)
        .bind(&conflict.server_data)
        .bind(&conflict.server_version)
        .bind(kind.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        tracing::info!(
            "Recorded {} conflict {} for {:?}/{:?}",
            kind.as_str(),
            id,
            conflict.resource_type,
            conflict.resource_id
        );

        Ok(id)
    }

    /// Unresolved conflicts, oldest first.
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM conflict_log
            WHERE resolution_status = 'pending'
            ORDER BY created_at ASC
            LIMIT ?
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRecord::try_from).collect()
    }

    pub async fn by_id(&self, id: i64) -> Result<Option<ConflictRecord>> {
        let row: Option<ConflictRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM conflict_log WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(ConflictRecord::try_from).transpose()
    }

    /// Resolve a conflict and apply the effect to the originating request,
    /// atomically.
    ///
    /// The conflict row and the back-referenced queue row transition inside
    /// one transaction: a half-resolved conflict is never observable. A
    /// conflict that is already resolved is left untouched and `false` is
    /// returned, which makes repeated resolution calls no-ops.
    ///
    /// `local_wins` puts the request back to `pending` with its retry count
    /// intact; every other resolution marks it `completed`.
    pub async fn resolve(&self, id: i64, resolution: ResolutionStatus) -> Result<bool> {
        if resolution == ResolutionStatus::Pending {
            return Err(Error::Validation(
                "Cannot resolve a conflict back to pending".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let row: Option<(String, Option<i64>)> = sqlx::query_as(
            "SELECT resolution_status, local_request_id FROM conflict_log WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let (current_status, local_request_id) = match row {
            Some((status, request_id)) => (ResolutionStatus::parse(&status)?, request_id),
            None => return Err(Error::NotFound(format!("No conflict with id {}", id))),
        };

        if current_status != ResolutionStatus::Pending {
            // Already adjudicated; resolved_at and status stay as they are.
            tracing::debug!(
                "Conflict {} already resolved as {}, ignoring {}",
                id,
                current_status.as_str(),
                resolution.as_str()
            );
            return Ok(false);
        }

        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE conflict_log
            SET resolution_status = ?, resolved_at = ?
            WHERE id = ? AND resolution_status = 'pending'
            "#,
        )
        .bind(resolution.as_str())
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if let Some(request_id) = local_request_id {
            if resolution == ResolutionStatus::LocalWins {
                // Replay the local write: back to pending, retry schedule
                // cleared, retry_count retained.
                sqlx::query(
                    r#"
                    UPDATE sync_queue
                    SET status = 'pending', next_retry_at = NULL, error_message = NULL, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(now)
                .bind(request_id)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    r#"
                    UPDATE sync_queue
                    SET status = 'completed', error_message = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(format!("Resolved: {}", resolution.as_str()))
                .bind(now)
                .bind(request_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        tracing::info!("Conflict {} resolved as {}", id, resolution.as_str());
        Ok(true)
    }

    /// Counts of pending vs adjudicated conflicts.
    pub async fn stats(&self) -> Result<ConflictStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT resolution_status, COUNT(*) FROM conflict_log GROUP BY resolution_status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = ConflictStats::default();
        for (status, count) in rows {
            match ResolutionStatus::parse(&status)? {
                ResolutionStatus::Pending => stats.pending += count,
                _ => stats.resolved += count,
            }
        }

        Ok(stats)
    }
}
