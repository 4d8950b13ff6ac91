// engine/mod.rs - The sync engine: periodic drain loop and state machine

pub mod backoff;
pub mod resolver;

use crate::config::SyncConfig;
use crate::db::metadata::SyncMetadata;
use crate::db::queue::{QueueStats, QueuedRequest, RequestQueue, RequestStatus};
use crate::db::sync_log::{LogEvent, SyncLog};
use crate::events::{EventBus, SyncEvent, SyncState};
use crate::http::interceptor::{headers_from_row, Interceptor};
use crate::state::SyncContext;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use resolver::ConflictResolver;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Counters for one drain
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DrainSummary {
    pub processed: usize,
    pub success: usize,
    pub failure: usize,
    pub conflict: usize,
}

/// Snapshot for the operator's sync-status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub is_processing: bool,
    pub stats: QueueStats,
    pub last_sync_time: Option<DateTime<Utc>>,
}

enum Processed {
    Success,
    Conflict,
    Failure,
}

struct Inner {
    config: SyncConfig,
    queue: RequestQueue,
    metadata: SyncMetadata,
    sync_log: SyncLog,
    interceptor: Interceptor,
    resolver: ConflictResolver,
    bus: EventBus,
    state: RwLock<SyncState>,
    is_processing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Releases the drain latch even when a batch errors out mid-flight.
struct LatchGuard<'a>(&'a AtomicBool);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains the durable request queue against the remote service.
///
/// One drain runs at a time (the `is_processing` latch); a periodic tick
/// triggers drains while the engine is started, and `force_sync` triggers
/// one on demand. Status rows are only ever mutated here and in the
/// conflict resolver.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(context: &SyncContext, interceptor: Interceptor) -> Self {
        let resolver = ConflictResolver::new(context.conflicts.clone(), context.hooks.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config: context.config.clone(),
                queue: context.queue.clone(),
                metadata: context.metadata.clone(),
                sync_log: context.sync_log.clone(),
                interceptor,
                resolver,
                bus: context.bus.clone(),
                state: RwLock::new(SyncState::Idle),
                is_processing: AtomicBool::new(false),
                shutdown_tx,
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.inner.resolver
    }

    pub async fn state(&self) -> SyncState {
        *self.inner.state.read().await
    }

    pub fn is_processing(&self) -> bool {
        self.inner.is_processing.load(Ordering::Acquire)
    }

    /// State, queue stats and last drain time in one snapshot.
    pub async fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            state: self.state().await,
            is_processing: self.is_processing(),
            stats: self.inner.queue.stats().await?,
            last_sync_time: self.inner.metadata.last_sync_time().await?,
        })
    }

    /// Start the periodic tick. Idempotent: a second call while running is
    /// a no-op.
    pub async fn start(&self) {
        let mut ticker = self.inner.ticker.lock().await;
        if ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        // A previous process may have died mid-drain
        if let Err(e) = self.inner.queue.recover_stale_processing().await {
            tracing::warn!("Stale-processing recovery failed: {}", e);
        }

        self.inner.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let engine = self.clone();

        tracing::info!(
            "Sync engine started (tick every {}ms, batch size {})",
            self.inner.config.tick_interval_ms,
            self.inner.config.batch_size
        );

        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                engine.inner.config.tick_interval_ms,
            ));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = engine.drain().await {
                            tracing::error!("Drain failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            tracing::debug!("Sync engine tick loop exited");
        }));
    }

    /// Cancel the periodic tick. A drain already in flight runs to
    /// completion; nothing new starts.
    pub async fn stop(&self) {
        self.inner.shutdown_tx.send_replace(true);
        self.set_state(SyncState::Idle).await;
        tracing::info!("Sync engine stopped");
    }

    /// Orderly stop: cancel the tick, wait (bounded) for any in-flight
    /// drain, then persist metadata no matter what.
    ///
    /// Status transitions happen as whole units inside the drain, so
    /// returning while a drain is still running never leaves a request in
    /// a half-written state; the row simply keeps its current status for
    /// the next process start.
    pub async fn safe_shutdown(&self) -> Result<()> {
        self.stop().await;

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.inner.config.safe_shutdown_timeout_ms);

        while self.is_processing() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if self.is_processing() {
            tracing::warn!("Safe shutdown timed out with a drain still in flight");
        }

        self.inner.metadata.set_last_sync_time(Utc::now()).await?;

        if let Some(handle) = self.inner.ticker.lock().await.take() {
            handle.abort();
        }

        tracing::info!("Safe shutdown complete");
        Ok(())
    }

    /// Trigger one drain immediately. Returns `None` when skipped because
    /// another drain holds the latch or the interceptor reports offline.
    pub async fn force_sync(&self) -> Result<Option<DrainSummary>> {
        self.drain().await
    }

    /// One execution of the batch-processing routine.
    async fn drain(&self) -> Result<Option<DrainSummary>> {
        if self
            .inner
            .is_processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Drain already in flight, skipping tick");
            return Ok(None);
        }
        let _latch = LatchGuard(&self.inner.is_processing);

        if !self.inner.interceptor.is_online() {
            tracing::debug!("Offline, skipping tick");
            return Ok(None);
        }

        match self.drain_batch().await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                // A database failure aborts the whole batch; stay failed
                // until a later tick gets through.
                self.set_state(SyncState::Failed).await;
                Err(e)
            }
        }
    }

    async fn drain_batch(&self) -> Result<Option<DrainSummary>> {
        let batch = self
            .inner
            .queue
            .ready_for_retry(Utc::now(), self.inner.config.batch_size)
            .await?;

        if batch.is_empty() {
            // Nothing ready; a previously syncing or failed engine settles
            // back to idle.
            self.set_state(SyncState::Idle).await;
            return Ok(None);
        }

        self.set_state(SyncState::Syncing).await;

        let total = batch.len();
        let mut summary = DrainSummary::default();

        for entry in batch {
            match self.process_entry(&entry).await? {
                Processed::Success => summary.success += 1,
                Processed::Conflict => summary.conflict += 1,
                Processed::Failure => summary.failure += 1,
            }
            summary.processed += 1;

            self.inner.bus.publish(SyncEvent::SyncProgress {
                processed: summary.processed,
                total,
                success: summary.success,
                failure: summary.failure,
                conflict: summary.conflict,
            });
        }

        self.inner.metadata.set_last_sync_time(Utc::now()).await?;

        let remaining = self.inner.queue.ready_for_retry(Utc::now(), 1).await?;
        if remaining.is_empty() {
            self.set_state(SyncState::Idle).await;
        }

        tracing::info!(
            "Drain finished: {} processed, {} ok, {} failed, {} conflicts",
            summary.processed,
            summary.success,
            summary.failure,
            summary.conflict
        );

        Ok(Some(summary))
    }

    /// Replay one queued request and settle its row.
    async fn process_entry(&self, entry: &QueuedRequest) -> Result<Processed> {
        self.inner
            .queue
            .update_status(entry.id, RequestStatus::Processing, None)
            .await?;

        let headers = match headers_from_row(entry.headers.as_deref()) {
            Ok(headers) => headers,
            Err(e) => {
                // A row with unreadable headers would poison every future
                // batch; fail it instead of retrying.
                let message = format!("Unreadable stored headers: {}", e);
                self.inner
                    .queue
                    .update_status(entry.id, RequestStatus::Failed, Some(&message))
                    .await?;
                self.log(entry.id, LogEvent::Failed, &message).await;
                return Ok(Processed::Failure);
            }
        };

        let sent = self
            .inner
            .interceptor
            .forward(&entry.method, &entry.url, &headers, entry.body.as_deref())
            .await;

        match sent {
            Ok(response) if response.is_success() => {
                self.inner
                    .queue
                    .update_status(entry.id, RequestStatus::Completed, None)
                    .await?;
                self.log(
                    entry.id,
                    LogEvent::Completed,
                    &format!("{} {} -> {}", entry.method, entry.url, response.status),
                )
                .await;
                Ok(Processed::Success)
            }
            Ok(response) if resolver::is_conflict_response(response.status, &response.body) => {
                // Conflicts are neither successes nor failures and do not
                // burn a retry.
                let conflict_id = self.inner.resolver.handle_conflict(entry, &response).await?;
                self.log(
                    entry.id,
                    LogEvent::Conflict,
                    &format!("status {} recorded as conflict {}", response.status, conflict_id),
                )
                .await;
                Ok(Processed::Conflict)
            }
            Ok(response) => {
                self.schedule_retry(entry, &format!("status {}", response.status), Some(response.status))
                    .await
            }
            Err(Error::Network(reason)) => self.schedule_retry(entry, &reason, None).await,
            Err(e) if matches!(e, Error::Database(_)) => Err(e),
            Err(e) => {
                // Malformed stored method, bad credential state and the
                // like cannot improve with retries.
                let message = e.to_string();
                self.inner
                    .queue
                    .update_status(entry.id, RequestStatus::Failed, Some(&message))
                    .await?;
                self.log(entry.id, LogEvent::Failed, &message).await;
                Ok(Processed::Failure)
            }
        }
    }

    /// Retry accounting: schedule the next attempt with capped exponential
    /// backoff, or fail the request once its retries are spent.
    async fn schedule_retry(
        &self,
        entry: &QueuedRequest,
        reason: &str,
        status: Option<u16>,
    ) -> Result<Processed> {
        if entry.retry_count >= self.inner.config.max_retries {
            let message = match status {
                Some(code) => format!("Max retries exceeded (status {})", code),
                None => format!("Max retries exceeded ({})", reason),
            };
            self.inner
                .queue
                .update_status(entry.id, RequestStatus::Failed, Some(&message))
                .await?;
            self.log(entry.id, LogEvent::Failed, &message).await;
            return Ok(Processed::Failure);
        }

        let delay_ms = backoff::delay_ms(
            entry.retry_count,
            self.inner.config.base_retry_delay_ms,
            self.inner.config.max_retry_delay_ms,
        );

        self.inner.queue.increment_retry(entry.id).await?;
        self.inner.queue.set_next_retry(entry.id, delay_ms).await?;
        self.inner
            .queue
            .update_status(entry.id, RequestStatus::Pending, Some(reason))
            .await?;

        let message = format!("attempt {} failed ({}), retry in {}ms", entry.retry_count + 1, reason, delay_ms);
        if let Err(e) = self
            .inner
            .sync_log
            .append(
                Some(entry.id),
                LogEvent::RetryScheduled,
                Some(&message),
                Some(&serde_json::json!({
                    "delay_ms": delay_ms,
                    "retry_count": entry.retry_count + 1,
                })),
            )
            .await
        {
            tracing::warn!("Failed to append sync_log entry: {}", e);
        }

        tracing::debug!("Request {}: {}", entry.id, message);
        Ok(Processed::Failure)
    }

    async fn set_state(&self, new_state: SyncState) {
        {
            let mut state = self.inner.state.write().await;
            if *state == new_state {
                return;
            }
            tracing::info!("Sync state: {} -> {}", state.as_str(), new_state.as_str());
            *state = new_state;
        }

        // Best-effort snapshot for the event payload; a failed stats read
        // must not take the state change down with it.
        let stats = self.inner.queue.stats().await.unwrap_or_default();
        let last_sync_time = self.inner.metadata.last_sync_time().await.unwrap_or(None);

        self.inner.bus.publish(SyncEvent::SyncStateChanged {
            state: new_state,
            stats,
            last_sync_time,
        });
    }

    /// Sync-log append that never fails the drain.
    async fn log(&self, queue_id: i64, event: LogEvent, message: &str) {
        if let Err(e) = self
            .inner
            .sync_log
            .append(Some(queue_id), event, Some(message), None)
            .await
        {
            tracing::warn!("Failed to append sync_log entry: {}", e);
        }
    }
}
