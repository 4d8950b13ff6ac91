// events.rs - Typed event bus for engine state and drain progress

use crate::db::queue::QueueStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Engine states observable on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Failed,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Failed => "failed",
        }
    }
}

/// Events published while the engine runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncEvent {
    SyncStateChanged {
        state: SyncState,
        stats: QueueStats,
        last_sync_time: Option<DateTime<Utc>>,
    },
    SyncProgress {
        processed: usize,
        total: usize,
        success: usize,
        failure: usize,
        conflict: usize,
    },
}

/// Broadcast bus for sync events.
///
/// Dispatch is fire-and-forget: publishing never blocks, publishing with no
/// subscribers is fine, and a slow subscriber lags (loses old events)
/// rather than stalling the drain.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to whoever is listening.
    pub fn publish(&self, event: SyncEvent) {
        // Err means no receivers; that is not a failure.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
