// state.rs - Explicit context object wiring the components together

use crate::config::SyncConfig;
use crate::credentials::{CredentialStore, MemoryStore};
use crate::db::cache::ResponseCache;
use crate::db::conflicts::ConflictStore;
use crate::db::metadata::SyncMetadata;
use crate::db::queue::RequestQueue;
use crate::db::sync_log::SyncLog;
use crate::db::Database;
use crate::engine::resolver::HookRegistry;
use crate::events::EventBus;
use crate::Result;
use std::sync::Arc;

/// Everything the components share, created once and passed by reference.
///
/// There are no module-level singletons: tests build a context over an
/// in-memory database, hosts build one over the real file.
#[derive(Clone)]
pub struct SyncContext {
    pub db: Arc<Database>,
    pub config: SyncConfig,
    pub queue: RequestQueue,
    pub cache: ResponseCache,
    pub conflicts: ConflictStore,
    pub metadata: SyncMetadata,
    pub sync_log: SyncLog,
    pub bus: EventBus,
    pub hooks: Arc<HookRegistry>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl SyncContext {
    /// Build a context over an already-opened database.
    pub fn new(db: Database, config: SyncConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        let pool = db.pool.clone();

        Self {
            db: Arc::new(db),
            config,
            queue: RequestQueue::new(pool.clone()),
            cache: ResponseCache::new(pool.clone()),
            conflicts: ConflictStore::new(pool.clone()),
            metadata: SyncMetadata::new(pool.clone()),
            sync_log: SyncLog::new(pool),
            bus: EventBus::default(),
            hooks: Arc::new(HookRegistry::new()),
            credentials,
        }
    }

    /// Context over a throwaway in-memory database with in-memory
    /// credentials. The workhorse constructor for tests.
    pub async fn in_memory(config: SyncConfig) -> Result<Self> {
        let db = Database::in_memory().await?;
        Ok(Self::new(db, config, Arc::new(MemoryStore::new())))
    }
}
