// service.rs - Operator API surface over the assembled components

use crate::db::conflicts::ConflictRecord;
use crate::db::queue::{QueueStats, QueuedRequest, RequestStatus};
use crate::db::sync_log::LogEntry;
use crate::engine::resolver::ConflictHook;
use crate::engine::{DrainSummary, SyncEngine, SyncStatus};
use crate::events::SyncEvent;
use crate::http::client::Transport;
use crate::http::interceptor::{InterceptOutcome, Interceptor, RequestOptions};
use crate::state::SyncContext;
use crate::{Error, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One façade over the whole engine, intended for whatever transport the
/// host wires it to (CLI, RPC, a debug console).
///
/// Construction wires the interceptor and engine onto a [`SyncContext`];
/// everything else is thin delegation plus input validation.
#[derive(Clone)]
pub struct SyncService {
    context: SyncContext,
    interceptor: Interceptor,
    engine: SyncEngine,
}

impl SyncService {
    pub fn new(context: SyncContext, transport: Arc<dyn Transport>) -> Self {
        let interceptor = Interceptor::new(
            transport,
            context.queue.clone(),
            context.cache.clone(),
            context.credentials.clone(),
        );
        let engine = SyncEngine::new(&context, interceptor.clone());

        Self {
            context,
            interceptor,
            engine,
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Execute an application request through the interceptor.
    pub async fn execute(
        &self,
        method: &str,
        url: &str,
        options: RequestOptions,
    ) -> Result<InterceptOutcome> {
        self.interceptor.execute(method, url, options).await
    }

    // ------------------------------------------------------------------
    // Engine lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&self) {
        self.engine.start().await;
    }

    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    pub async fn safe_shutdown(&self) -> Result<()> {
        self.engine.safe_shutdown().await
    }

    /// Trigger a drain right now; `None` means it was skipped (busy or
    /// offline).
    pub async fn force_sync(&self) -> Result<Option<DrainSummary>> {
        self.engine.force_sync().await
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        self.engine.status().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.context.bus.subscribe()
    }

    // ------------------------------------------------------------------
    // Connectivity and credentials
    // ------------------------------------------------------------------

    pub fn set_online(&self, online: bool) {
        self.interceptor.set_online(online);
    }

    pub fn is_online(&self) -> bool {
        self.interceptor.is_online()
    }

    pub fn set_credential(&self, token: &str) -> Result<()> {
        self.context.credentials.set_token(token)
    }

    pub fn get_credential(&self) -> Result<Option<String>> {
        self.context.credentials.get_token()
    }

    pub fn clear_credential(&self) -> Result<()> {
        self.context.credentials.clear_token()
    }

    // ------------------------------------------------------------------
    // Queue administration
    // ------------------------------------------------------------------

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.context.queue.stats().await
    }

    /// List queued requests, newest first. `status` accepts the lowercase
    /// status names and rejects anything else.
    pub async fn list_queue(
        &self,
        limit: i64,
        status: Option<&str>,
    ) -> Result<Vec<QueuedRequest>> {
        let status = status
            .map(|s| {
                RequestStatus::parse(s).map_err(|_| {
                    Error::Validation(format!(
                        "Invalid status filter: {} (expected pending, processing, completed or failed)",
                        s
                    ))
                })
            })
            .transpose()?;

        self.context.queue.list(limit, status).await
    }

    pub async fn remove_request(&self, id: i64) -> Result<()> {
        self.context.queue.remove(id).await
    }

    pub async fn retry_request(&self, id: i64, reset_retry_count: bool) -> Result<()> {
        self.context.queue.retry_now(id, reset_retry_count).await
    }

    pub async fn retry_all_failed(&self) -> Result<i64> {
        self.context.queue.retry_all_failed().await
    }

    pub async fn clear_failed(&self) -> Result<i64> {
        self.context.queue.clear_failed().await
    }

    /// Retention sweep of queue rows and cache entries older than
    /// `age_days` (the configured default when `None`).
    pub async fn sweep(&self, age_days: Option<i64>) -> Result<i64> {
        let days = age_days.unwrap_or(self.context.config.sweep_age_days);
        if days < 0 {
            return Err(Error::Validation(format!(
                "Sweep age must be non-negative, got {}",
                days
            )));
        }

        let threshold = Utc::now() - Duration::days(days);
        let swept_requests = self.context.queue.sweep(threshold).await?;
        let swept_cache = self.context.cache.sweep(threshold).await?;

        tracing::info!(
            "Sweep removed {} requests and {} cache entries older than {} days",
            swept_requests,
            swept_cache,
            days
        );

        Ok(swept_requests)
    }

    /// Recent sync-log entries for one request, oldest first.
    pub async fn request_history(&self, id: i64) -> Result<Vec<LogEntry>> {
        self.context.sync_log.for_request(id).await
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    pub async fn pending_conflicts(&self, limit: i64) -> Result<Vec<ConflictRecord>> {
        self.context.conflicts.list_pending(limit).await
    }

    /// Adjudicate a conflict by hand. Returns false when the conflict had
    /// already been resolved (the call is then a no-op).
    pub async fn resolve_conflict(&self, id: i64, resolution: &str) -> Result<bool> {
        self.engine.resolver().resolve_manually(id, resolution).await
    }

    pub fn register_hook(&self, resource_type: &str, hook: ConflictHook) {
        self.context.hooks.register(resource_type, hook);
    }

    pub fn unregister_hook(&self, resource_type: &str) {
        self.context.hooks.unregister(resource_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::conflicts::ResolutionStatus;
    use crate::http::client::{OutboundRequest, TransportResponse};
    use async_trait::async_trait;

    /// Transport that always answers 200 with an empty object.
    struct OkTransport;

    #[async_trait]
    impl Transport for OkTransport {
        async fn send(&self, _request: &OutboundRequest) -> Result<TransportResponse> {
            Ok(TransportResponse {
                status: 200,
                body: "{}".to_string(),
            })
        }
    }

    async fn service() -> SyncService {
        let context = SyncContext::in_memory(SyncConfig::default()).await.unwrap();
        SyncService::new(context, Arc::new(OkTransport))
    }

    #[tokio::test]
    async fn test_offline_write_then_forced_drain() {
        let service = service().await;

        service.set_online(false);
        assert!(!service.is_online());

        let outcome = service
            .execute(
                "POST",
                "/api/items",
                RequestOptions {
                    body: Some(r#"{"a":1}"#.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let queue_id = match outcome {
            InterceptOutcome::Queued { queue_id, .. } => queue_id,
            other => panic!("unexpected outcome: {:?}", other),
        };

        assert_eq!(service.queue_stats().await.unwrap().pending, 1);

        service.set_online(true);
        let summary = service.force_sync().await.unwrap().unwrap();
        assert_eq!(summary.success, 1);

        let history = service.request_history(queue_id).await.unwrap();
        assert_eq!(history.len(), 1);

        let status = service.sync_status().await.unwrap();
        assert_eq!(status.stats.completed, 1);
        assert!(status.last_sync_time.is_some());
        assert!(!status.is_processing);
    }

    #[tokio::test]
    async fn test_list_queue_rejects_bad_filter() {
        let service = service().await;
        assert!(matches!(
            service.list_queue(10, Some("exploded")).await,
            Err(Error::Validation(_))
        ));
        assert!(service.list_queue(10, Some("pending")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credential_roundtrip() {
        let service = service().await;
        assert!(service.get_credential().unwrap().is_none());

        service.set_credential("tok").unwrap();
        assert_eq!(service.get_credential().unwrap().as_deref(), Some("tok"));

        service.clear_credential().unwrap();
        assert!(service.get_credential().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_validation_and_defaults() {
        let service = service().await;
        assert!(matches!(
            service.sweep(Some(-1)).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(service.sweep(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_manual_conflict_resolution_via_service() {
        let service = service().await;

        service.set_online(false);
        let outcome = service
            .execute(
                "PUT",
                "/api/customers/42",
                RequestOptions {
                    body: Some("{}".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let queue_id = match outcome {
            InterceptOutcome::Queued { queue_id, .. } => queue_id,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let conflict_id = service
            .context
            .conflicts
            .record(
                crate::db::conflicts::NewConflict {
                    local_request_id: Some(queue_id),
                    ..Default::default()
                },
                crate::db::conflicts::ConflictType::VersionMismatch,
            )
            .await
            .unwrap();

        let pending = service.pending_conflicts(10).await.unwrap();
        assert_eq!(pending.len(), 1);

        assert!(service.resolve_conflict(conflict_id, "local_wins").await.unwrap());
        let record = service
            .context
            .conflicts
            .by_id(conflict_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.resolution_status, ResolutionStatus::LocalWins);

        let row = service.context.queue.by_id(queue_id).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_queue_admin_surface() {
        let service = service().await;
        service.set_online(false);

        for i in 0..3 {
            service
                .execute(
                    "POST",
                    &format!("/api/items/{}", i),
                    RequestOptions {
                        body: Some("{}".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let listed = service.list_queue(10, None).await.unwrap();
        assert_eq!(listed.len(), 3);

        service.remove_request(listed[0].id).await.unwrap();
        assert_eq!(service.queue_stats().await.unwrap().pending, 2);
        assert!(matches!(
            service.remove_request(listed[0].id).await,
            Err(Error::NotFound(_))
        ));

        // Fail one by hand, then exercise the failed-row admin ops
        service
            .context
            .queue
            .update_status(listed[1].id, RequestStatus::Failed, Some("x"))
            .await
            .unwrap();
        assert_eq!(service.retry_all_failed().await.unwrap(), 1);
        assert_eq!(service.clear_failed().await.unwrap(), 0);
        service.retry_request(listed[1].id, true).await.unwrap();
    }
}
