// db/metadata.rs - Durable key/value metadata for the engine

use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Key under which the engine records the end of the last successful drain.
pub const LAST_SYNC_TIME: &str = "last_sync_time";

/// Key/value metadata backed by the sync_metadata table.
///
/// The sync engine is the single writer; anything else only reads.
#[derive(Clone)]
pub struct SyncMetadata {
    pool: SqlitePool,
}

impl SyncMetadata {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a value.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM sync_metadata WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }

    /// Record the completion time of a drain.
    pub async fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.set(LAST_SYNC_TIME, &at.to_rfc3339()).await
    }

    /// The last recorded drain time, if any. A malformed stored value reads
    /// as absent rather than failing the caller.
    pub async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = self.get(LAST_SYNC_TIME).await?;

        Ok(raw
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_set_get_upsert() {
        let db = Database::in_memory().await.unwrap();
        let metadata = SyncMetadata::new(db.pool);

        assert!(metadata.get("missing").await.unwrap().is_none());

        metadata.set("k", "v1").await.unwrap();
        metadata.set("k", "v2").await.unwrap();
        assert_eq!(metadata.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_last_sync_time_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let metadata = SyncMetadata::new(db.pool);

        assert!(metadata.last_sync_time().await.unwrap().is_none());

        let now = Utc::now();
        metadata.set_last_sync_time(now).await.unwrap();
        let read = metadata.last_sync_time().await.unwrap().unwrap();
        assert_eq!(read.timestamp_millis(), now.timestamp_millis());

        // Garbage reads as absent
        metadata.set(LAST_SYNC_TIME, "not-a-date").await.unwrap();
        assert!(metadata.last_sync_time().await.unwrap().is_none());
    }
}
