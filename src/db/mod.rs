// db/mod.rs - Database module with SQLx integration

pub mod cache;
pub mod conflicts;
pub mod metadata;
pub mod migrations;
pub mod queue;
pub mod sync_log;

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database abstraction with connection pooling
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Create new database connection with migrations
    ///
    /// Uses WAL mode for better concurrency and enforces foreign keys.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}", db_path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            // Enable Write-Ahead Logging for better concurrency
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // Enable foreign key constraints
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        // Run migrations
        migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// Open the database at the default per-user data location.
    pub async fn open_default() -> Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| crate::Error::Config("Failed to resolve user data dir".to_string()))?
            .join("syncbridge");

        tokio::fs::create_dir_all(&data_dir).await?;

        Self::open(&data_dir.join("syncbridge.db")).await
    }

    /// In-memory database for tests.
    ///
    /// A single connection is required: each `:memory:` connection gets its
    /// own private database, so a larger pool would see empty schemas.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// Execute health check query
    pub async fn health_check(&self) -> Result<bool> {
        let result: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;

        Ok(result.0 == 1)
    }
}

// Ensure pool is Send + Sync for cross-thread sharing
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_all() {
        assert_send_sync::<Database>();
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_health_check() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.health_check().await.unwrap());
    }
}
