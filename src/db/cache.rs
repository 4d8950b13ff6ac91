// db/cache.rs - Hash-keyed cache of successful read responses

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// A cached response body for an idempotent read
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CachedResponse {
    pub request_hash: String,
    pub response_data: Option<String>,
    pub cached_at: DateTime<Utc>,
}

/// Response cache keyed by request fingerprint.
///
/// One row per fingerprint; a fresh put replaces whatever was there.
#[derive(Clone)]
pub struct ResponseCache {
    pool: SqlitePool,
}

impl ResponseCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a response body, replacing any prior entry for the fingerprint.
    pub async fn put(&self, request_hash: &str, body: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO request_cache (request_hash, response_data, cached_at)
            VALUES (?, ?, ?)
            ON CONFLICT(request_hash) DO UPDATE SET
                response_data = excluded.response_data,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(request_hash)
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch the cached body for a fingerprint, if any.
    pub async fn get(&self, request_hash: &str) -> Result<Option<CachedResponse>> {
        let row = sqlx::query_as::<_, CachedResponse>(
            "SELECT request_hash, response_data, cached_at FROM request_cache WHERE request_hash = ?",
        )
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Drop a single entry.
    pub async fn remove(&self, request_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM request_cache WHERE request_hash = ?")
            .bind(request_hash)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Remove entries cached before the threshold.
    pub async fn sweep(&self, older_than: DateTime<Utc>) -> Result<i64> {
        let result = sqlx::query("DELETE FROM request_cache WHERE cached_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Duration;

    async fn cache() -> ResponseCache {
        let db = Database::in_memory().await.unwrap();
        ResponseCache::new(db.pool)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let cache = cache().await;

        assert!(cache.get("abc").await.unwrap().is_none());

        cache.put("abc", r#"{"items":[]}"#).await.unwrap();
        let hit = cache.get("abc").await.unwrap().unwrap();
        assert_eq!(hit.response_data.as_deref(), Some(r#"{"items":[]}"#));
    }

    #[tokio::test]
    async fn test_put_replaces_prior_entry() {
        let cache = cache().await;

        cache.put("abc", "old").await.unwrap();
        cache.put("abc", "new").await.unwrap();

        // Reads never see anything older than the latest write
        let hit = cache.get("abc").await.unwrap().unwrap();
        assert_eq!(hit.response_data.as_deref(), Some("new"));

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM request_cache")
            .fetch_one(&cache.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_sweep_and_remove() {
        let cache = cache().await;

        cache.put("old", "x").await.unwrap();
        cache.put("new", "y").await.unwrap();
        sqlx::query("UPDATE request_cache SET cached_at = ? WHERE request_hash = 'old'")
            .bind(Utc::now() - Duration::days(10))
            .execute(&cache.pool)
            .await
            .unwrap();

        assert_eq!(cache.sweep(Utc::now() - Duration::days(7)).await.unwrap(), 1);
        assert!(cache.get("old").await.unwrap().is_none());

        cache.remove("new").await.unwrap();
        assert!(cache.get("new").await.unwrap().is_none());
    }
}
