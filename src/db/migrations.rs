// db/migrations.rs - Database schema migrations

use crate::Result;
use sqlx::SqlitePool;

/// Run all database migrations
///
/// Migrations are idempotent and safe to run multiple times. Legacy table
/// names from older installs are renamed before any versioned DDL runs so
/// that the CREATE statements below never race a stale schema.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    // Create the migration ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    rename_legacy_tables(pool).await?;

    // Run migrations in order
    run_if_needed(pool, 1, "create_sync_queue_table").await?;
    run_if_needed(pool, 2, "create_request_cache_table").await?;
    run_if_needed(pool, 3, "create_conflict_log_table").await?;
    run_if_needed(pool, 4, "create_sync_log_table").await?;
    run_if_needed(pool, 5, "create_sync_metadata_table").await?;
    run_if_needed(pool, 6, "create_indices").await?;

    Ok(())
}

/// Rename tables carried over from pre-1.0 installs to the canonical names.
///
/// Must run before the versioned DDL: `CREATE TABLE IF NOT EXISTS` on the
/// canonical name would otherwise create an empty twin next to the legacy
/// data.
async fn rename_legacy_tables(pool: &SqlitePool) -> Result<()> {
    rename_if_present(pool, "offline_requests", "sync_queue").await?;
    rename_if_present(pool, "sync_conflicts", "conflict_log").await?;
    Ok(())
}

async fn rename_if_present(pool: &SqlitePool, legacy: &str, canonical: &str) -> Result<()> {
    let legacy_exists: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(legacy)
    .fetch_one(pool)
    .await?;

    if legacy_exists.0 == 0 {
        return Ok(());
    }

    let canonical_exists: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(canonical)
    .fetch_one(pool)
    .await?;

    if canonical_exists.0 > 0 {
        // Both present: the canonical table is authoritative, the legacy one
        // is dead weight from an interrupted upgrade.
        tracing::warn!("Dropping stale legacy table {} ({} exists)", legacy, canonical);
        sqlx::query(&format!("DROP TABLE {}", legacy))
            .execute(pool)
            .await?;
        return Ok(());
    }

    tracing::info!("Renaming legacy table {} to {}", legacy, canonical);
    sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", legacy, canonical))
        .execute(pool)
        .await?;

    Ok(())
}

/// Check if migration is needed and run the appropriate SQL
async fn run_if_needed(pool: &SqlitePool, version: i32, name: &str) -> Result<()> {
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_migrations WHERE version = ?")
        .bind(version)
        .fetch_one(pool)
        .await?;

    if exists.0 == 0 {
        tracing::info!("Running migration {}: {}", version, name);

        match version {
            1 => create_sync_queue_table(pool).await?,
            2 => create_request_cache_table(pool).await?,
            3 => create_conflict_log_table(pool).await?,
            4 => create_sync_log_table(pool).await?,
            5 => create_sync_metadata_table(pool).await?,
            6 => create_indices(pool).await?,
            _ => {
                return Err(crate::Error::Config(format!(
                    "Unknown migration version: {}",
                    version
                )))
            }
        }

        sqlx::query("INSERT INTO schema_migrations (version) VALUES (?)")
            .bind(version)
            .execute(pool)
            .await?;

        tracing::info!("Migration {} completed", version);
    }

    Ok(())
}

/// Migration 1: Create the durable request queue
async fn create_sync_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            method TEXT NOT NULL CHECK(method IN ('GET', 'HEAD', 'OPTIONS', 'POST', 'PUT', 'PATCH', 'DELETE')),
            url TEXT NOT NULL,
            headers TEXT,
            body TEXT,
            request_hash TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'processing', 'completed', 'failed')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            error_message TEXT,
            resource_id TEXT,
            resource_type TEXT,
            resource_version TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 2: Create the response cache for idempotent reads
async fn create_request_cache_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_cache (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_hash TEXT NOT NULL UNIQUE,
            response_data TEXT,
            cached_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 3: Create the conflict log
async fn create_conflict_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conflict_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_id TEXT,
            resource_type TEXT,
            local_request_id INTEGER REFERENCES sync_queue(id),
            local_data TEXT,
            server_data TEXT,
            server_version TEXT,
            conflict_type TEXT NOT NULL CHECK(conflict_type IN ('version_mismatch', 'modified_conflict', 'delete_conflict')),
            resolution_status TEXT NOT NULL DEFAULT 'pending' CHECK(resolution_status IN ('pending', 'local_wins', 'server_wins', 'manual', 'skip', 'rejected')),
            resolved_at TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 4: Create the per-request event log
async fn create_sync_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_id INTEGER REFERENCES sync_queue(id),
            event_type TEXT NOT NULL,
            message TEXT,
            meta TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 5: Create the key/value metadata table
async fn create_sync_metadata_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 6: Create performance indices
async fn create_indices(pool: &SqlitePool) -> Result<()> {
    // Queue scans by status and by readiness
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status
        ON sync_queue(status)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sync_queue_url
        ON sync_queue(url)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sync_queue_next_retry
        ON sync_queue(next_retry_at)
        WHERE status = 'pending'
        "#,
    )
    .execute(pool)
    .await?;

    // Conflict lookups by resource and by resolution state
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_conflict_log_resource
        ON conflict_log(resource_id, resource_type)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_conflict_log_resolution
        ON conflict_log(resolution_status)
        "#,
    )
    .execute(pool)
    .await?;

    // Sync log lookups by originating request
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sync_log_queue
        ON sync_log(queue_id, created_at)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
