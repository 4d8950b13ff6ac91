// db/sync_log.rs - Append-only per-request event log

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// Events the engine records while draining the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Completed,
    Conflict,
    RetryScheduled,
    Failed,
}

impl LogEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LogEvent::Completed => "completed",
            LogEvent::Conflict => "conflict",
            LogEvent::RetryScheduled => "retry_scheduled",
            LogEvent::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(LogEvent::Completed),
            "conflict" => Ok(LogEvent::Conflict),
            "retry_scheduled" => Ok(LogEvent::RetryScheduled),
            "failed" => Ok(LogEvent::Failed),
            other => Err(Error::Database(format!(
                "Unknown event type in sync_log: {}",
                other
            ))),
        }
    }
}

/// A recorded sync event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub queue_id: Option<i64>,
    pub event_type: LogEvent,
    pub message: Option<String>,
    pub meta: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    queue_id: Option<i64>,
    event_type: String,
    message: Option<String>,
    meta: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for LogEntry {
    type Error = Error;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(LogEntry {
            id: row.id,
            queue_id: row.queue_id,
            event_type: LogEvent::parse(&row.event_type)?,
            message: row.message,
            meta: row.meta,
            created_at: row.created_at,
        })
    }
}

/// Writer/reader for the sync_log table
#[derive(Clone)]
pub struct SyncLog {
    pool: SqlitePool,
}

impl SyncLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event row.
    pub async fn append(
        &self,
        queue_id: Option<i64>,
        event: LogEvent,
        message: Option<&str>,
        meta: Option<&serde_json::Value>,
    ) -> Result<()> {
        let meta_text = meta.map(|m| m.to_string());

        sqlx::query(
            r#"
            INSERT INTO sync_log (queue_id, event_type, message, meta, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(queue_id)
        .bind(event.as_str())
        .bind(message)
        .bind(meta_text)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Events for one queued request, oldest first.
    pub async fn for_request(&self, queue_id: i64) -> Result<Vec<LogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(
            r#"
            SELECT id, queue_id, event_type, message, meta, created_at
            FROM sync_log
            WHERE queue_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LogEntry::try_from).collect()
    }

    /// Most recent events across all requests.
    pub async fn recent(&self, limit: i64) -> Result<Vec<LogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(
            r#"
            SELECT id, queue_id, event_type, message, meta, created_at
            FROM sync_log
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LogEntry::try_from).collect()
    }
}
