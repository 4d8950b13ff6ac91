// engine/resolver.rs - Conflict detection, last-write-wins, hooks, manual adjudication

use crate::db::conflicts::{ConflictStore, ConflictType, NewConflict, ResolutionStatus};
use crate::db::queue::QueuedRequest;
use crate::http::client::TransportResponse;
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// What a hook sees about a detected conflict
#[derive(Debug, Clone)]
pub struct ConflictData {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub conflict_type: ConflictType,
    pub local_data: Value,
    pub server_data: Value,
}

/// Caller-supplied resolution policy for one resource type.
///
/// Returning `Some(resolution)` settles the conflict and skips the default
/// policy; `None` defers to last-write-wins; an error is logged and also
/// falls through to last-write-wins.
pub type ConflictHook =
    Arc<dyn Fn(i64, &ConflictData) -> Result<Option<ResolutionStatus>> + Send + Sync>;

/// Thread-safe resource_type -> hook mapping, latest registration wins.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<String, ConflictHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource_type: &str, hook: ConflictHook) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.insert(resource_type.to_string(), hook);
            tracing::debug!("Registered conflict hook for {}", resource_type);
        }
    }

    pub fn unregister(&self, resource_type: &str) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.remove(resource_type);
            tracing::debug!("Unregistered conflict hook for {}", resource_type);
        }
    }

    fn get(&self, resource_type: &str) -> Option<ConflictHook> {
        self.hooks
            .read()
            .ok()
            .and_then(|hooks| hooks.get(resource_type).cloned())
    }
}

/// Whether a response marks a version conflict rather than a plain failure.
///
/// The 400-with-"modified" match mirrors how the remote service words its
/// precondition failures. It is deliberately isolated here; swap this
/// predicate if that wording ever becomes configurable.
pub fn is_conflict_response(status: u16, body: &str) -> bool {
    matches!(status, 409 | 412) || (status == 400 && body.contains("modified"))
}

fn classify(status: u16) -> ConflictType {
    match status {
        409 | 412 => ConflictType::VersionMismatch,
        _ => ConflictType::ModifiedConflict,
    }
}

/// Pull `(resource_type, resource_id)` out of a request URL: the last two
/// path segments, with the local body's `name`/`id` fields as fallback.
fn extract_resource(url: &str, local: &Value) -> (Option<String>, Option<String>) {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url);
    let segments: Vec<&str> = path
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let mut resource_id = segments.last().map(|s| s.to_string());
    let mut resource_type = segments
        .len()
        .checked_sub(2)
        .and_then(|i| segments.get(i))
        .map(|s| s.to_string());

    if resource_id.is_none() {
        resource_id = json_string(local, "id");
    }
    if resource_type.is_none() {
        resource_type = json_string(local, "name");
    }

    (resource_type, resource_id)
}

fn json_string(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// `modified` (or `updated_at`) timestamp of a JSON document, if parseable.
fn modified_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    ["modified", "updated_at"]
        .iter()
        .find_map(|key| value.get(*key))
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Last-write-wins: the larger `modified` timestamp takes the round; ties
/// and missing or unparseable timestamps go to the server.
fn last_write_wins(local: &Value, server: &Value) -> ResolutionStatus {
    match (modified_timestamp(local), modified_timestamp(server)) {
        (Some(local_ts), Some(server_ts)) if local_ts > server_ts => ResolutionStatus::LocalWins,
        _ => ResolutionStatus::ServerWins,
    }
}

/// Detects conflicts from responses, records them, and drives them through
/// the hook / last-write-wins pipeline.
#[derive(Clone)]
pub struct ConflictResolver {
    conflicts: ConflictStore,
    hooks: Arc<HookRegistry>,
}

impl ConflictResolver {
    pub fn new(conflicts: ConflictStore, hooks: Arc<HookRegistry>) -> Self {
        Self { conflicts, hooks }
    }

    /// Record and resolve a conflict detected while replaying `request`.
    ///
    /// Returns the conflict id. The originating request's status is updated
    /// as a side effect of resolution (back to pending on local_wins,
    /// completed otherwise); a hook that declines or fails leaves the
    /// decision to last-write-wins.
    pub async fn handle_conflict(
        &self,
        request: &QueuedRequest,
        response: &TransportResponse,
    ) -> Result<i64> {
        // Unparseable local payloads degrade to an empty document
        let local_data: Value = request
            .body
            .as_deref()
            .and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or(Value::Null);
        let server_data: Value = serde_json::from_str(&response.body).unwrap_or(Value::Null);

        let conflict_type = classify(response.status);
        let (mut resource_type, mut resource_id) = extract_resource(&request.url, &local_data);
        if resource_type.is_none() {
            resource_type = request.resource_type.clone();
        }
        if resource_id.is_none() {
            resource_id = request.resource_id.clone();
        }
        let server_version = json_string(&server_data, "version");

        let conflict_id = self
            .conflicts
            .record(
                NewConflict {
                    resource_id: resource_id.clone(),
                    resource_type: resource_type.clone(),
                    local_request_id: Some(request.id),
                    local_data: Some(local_data.to_string()),
                    server_data: Some(server_data.to_string()),
                    server_version,
                },
                conflict_type,
            )
            .await?;

        let data = ConflictData {
            resource_type: resource_type.clone(),
            resource_id,
            conflict_type,
            local_data,
            server_data,
        };

        let resolution = self
            .run_hook(conflict_id, &data)
            .unwrap_or_else(|| last_write_wins(&data.local_data, &data.server_data));

        self.conflicts.resolve(conflict_id, resolution).await?;

        Ok(conflict_id)
    }

    /// Give a registered hook first say. `None` means no hook, the hook
    /// declined, or the hook failed.
    fn run_hook(&self, conflict_id: i64, data: &ConflictData) -> Option<ResolutionStatus> {
        let resource_type = data.resource_type.as_deref()?;
        let hook = self.hooks.get(resource_type)?;

        match hook(conflict_id, data) {
            Ok(Some(ResolutionStatus::Pending)) => {
                tracing::warn!(
                    "Hook for {} returned pending for conflict {}, falling back",
                    resource_type,
                    conflict_id
                );
                None
            }
            Ok(Some(resolution)) => {
                tracing::info!(
                    "Hook for {} resolved conflict {} as {}",
                    resource_type,
                    conflict_id,
                    resolution.as_str()
                );
                Some(resolution)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    "Hook for {} failed on conflict {}: {}, falling back to last-write-wins",
                    resource_type,
                    conflict_id,
                    e
                );
                None
            }
        }
    }

    /// Operator adjudication of a pending conflict.
    ///
    /// Validates the resolution value, errors on unknown ids, and is a
    /// no-op when the conflict was already resolved.
    pub async fn resolve_manually(&self, conflict_id: i64, resolution: &str) -> Result<bool> {
        let resolution = ResolutionStatus::parse_manual(resolution)?;
        self.conflicts.resolve(conflict_id, resolution).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queue::{RequestQueue, RequestStatus};
    use crate::db::Database;
    use crate::Error;

    fn response(status: u16, body: &str) -> TransportResponse {
        TransportResponse {
            status,
            body: body.to_string(),
        }
    }

    async fn fixture() -> (ConflictResolver, ConflictStore, RequestQueue, Arc<HookRegistry>) {
        let db = Database::in_memory().await.unwrap();
        let conflicts = ConflictStore::new(db.pool.clone());
        let queue = RequestQueue::new(db.pool);
        let hooks = Arc::new(HookRegistry::new());
        let resolver = ConflictResolver::new(conflicts.clone(), hooks.clone());
        (resolver, conflicts, queue, hooks)
    }

    async fn queued(queue: &RequestQueue, url: &str, body: &str) -> QueuedRequest {
        let entry = queue.enqueue("PUT", url, None, Some(body)).await.unwrap();
        queue.by_id(entry.id).await.unwrap().unwrap()
    }

    #[test]
    fn test_conflict_detection() {
        assert!(is_conflict_response(409, ""));
        assert!(is_conflict_response(412, "precondition failed"));
        assert!(is_conflict_response(400, "resource was modified by another client"));
        assert!(!is_conflict_response(400, "missing field"));
        assert!(!is_conflict_response(500, "modified"));
        assert!(!is_conflict_response(200, ""));
    }

    #[test]
    fn test_extract_resource_from_url() {
        let empty = Value::Null;

        assert_eq!(
            extract_resource("/api/customers/42", &empty),
            (Some("customers".to_string()), Some("42".to_string()))
        );
        assert_eq!(
            extract_resource("https://api.example.com/v1/invoices/inv-9?full=1", &empty),
            (Some("invoices".to_string()), Some("inv-9".to_string()))
        );

        // Too few segments: the body fields fill the gaps
        let body = serde_json::json!({"id": 7, "name": "items"});
        assert_eq!(
            extract_resource("/items", &body),
            (Some("items".to_string()), Some("items".to_string()))
        );
        assert_eq!(
            extract_resource("", &body),
            (Some("items".to_string()), Some("7".to_string()))
        );
    }

    #[test]
    fn test_last_write_wins_policy() {
        let newer = serde_json::json!({"modified": "2024-01-15T12:00:00Z"});
        let older = serde_json::json!({"modified": "2024-01-15T10:00:00Z"});
        let undated = serde_json::json!({});

        assert_eq!(last_write_wins(&newer, &older), ResolutionStatus::LocalWins);
        assert_eq!(last_write_wins(&older, &newer), ResolutionStatus::ServerWins);
        // Ties and missing timestamps favor the server
        assert_eq!(last_write_wins(&newer, &newer), ResolutionStatus::ServerWins);
        assert_eq!(last_write_wins(&undated, &older), ResolutionStatus::ServerWins);
        assert_eq!(last_write_wins(&newer, &undated), ResolutionStatus::ServerWins);

        // updated_at works as the timestamp field too
        let via_updated_at = serde_json::json!({"updated_at": "2024-01-15T12:00:00Z"});
        assert_eq!(
            last_write_wins(&via_updated_at, &older),
            ResolutionStatus::LocalWins
        );
    }

    #[tokio::test]
    async fn test_conflict_lww_local_wins_requeues_request() {
        let (resolver, conflicts, queue, _) = fixture().await;

        let request = queued(
            &queue,
            "/api/customers/42",
            r#"{"modified":"2024-01-15T12:00:00Z"}"#,
        )
        .await;

        let conflict_id = resolver
            .handle_conflict(
                &request,
                &response(409, r#"{"modified":"2024-01-15T10:00:00Z"}"#),
            )
            .await
            .unwrap();

        let record = conflicts.by_id(conflict_id).await.unwrap().unwrap();
        assert_eq!(record.resolution_status, ResolutionStatus::LocalWins);
        assert_eq!(record.conflict_type, ConflictType::VersionMismatch);
        assert_eq!(record.resource_type.as_deref(), Some("customers"));
        assert_eq!(record.resource_id.as_deref(), Some("42"));
        assert_eq!(record.local_request_id, Some(request.id));

        // The originating request went back to pending for replay
        let replayed = queue.by_id(request.id).await.unwrap().unwrap();
        assert_eq!(replayed.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_conflict_lww_server_wins_completes_request() {
        let (resolver, conflicts, queue, _) = fixture().await;

        let request = queued(
            &queue,
            "/api/customers/42",
            r#"{"modified":"2024-01-15T10:00:00Z"}"#,
        )
        .await;

        let conflict_id = resolver
            .handle_conflict(
                &request,
                &response(412, r#"{"modified":"2024-01-15T12:00:00Z","version":"v7"}"#),
            )
            .await
            .unwrap();

        let record = conflicts.by_id(conflict_id).await.unwrap().unwrap();
        assert_eq!(record.resolution_status, ResolutionStatus::ServerWins);
        assert_eq!(record.server_version.as_deref(), Some("v7"));

        let finished = queue.by_id(request.id).await.unwrap().unwrap();
        assert_eq!(finished.status, RequestStatus::Completed);
        assert_eq!(
            finished.error_message.as_deref(),
            Some("Resolved: server_wins")
        );
    }

    #[tokio::test]
    async fn test_unparseable_local_body_degrades_to_server_wins() {
        let (resolver, conflicts, queue, _) = fixture().await;

        let request = queued(&queue, "/api/customers/42", "definitely not json").await;
        let conflict_id = resolver
            .handle_conflict(&request, &response(409, "{}"))
            .await
            .unwrap();

        let record = conflicts.by_id(conflict_id).await.unwrap().unwrap();
        assert_eq!(record.resolution_status, ResolutionStatus::ServerWins);
        assert_eq!(record.local_data.as_deref(), Some("null"));
    }

    #[tokio::test]
    async fn test_400_modified_classifies_as_modified_conflict() {
        let (resolver, conflicts, queue, _) = fixture().await;

        let request = queued(&queue, "/api/items/1", "{}").await;
        let conflict_id = resolver
            .handle_conflict(&request, &response(400, "record modified upstream"))
            .await
            .unwrap();

        let record = conflicts.by_id(conflict_id).await.unwrap().unwrap();
        assert_eq!(record.conflict_type, ConflictType::ModifiedConflict);
    }

    #[tokio::test]
    async fn test_hook_overrides_default_policy() {
        let (resolver, conflicts, queue, hooks) = fixture().await;

        hooks.register(
            "customers",
            Arc::new(|_, _| Ok(Some(ResolutionStatus::LocalWins))),
        );

        // LWW alone would say server_wins (no timestamps); the hook says otherwise
        let request = queued(&queue, "/api/customers/42", "{}").await;
        let conflict_id = resolver
            .handle_conflict(&request, &response(409, "{}"))
            .await
            .unwrap();

        let record = conflicts.by_id(conflict_id).await.unwrap().unwrap();
        assert_eq!(record.resolution_status, ResolutionStatus::LocalWins);

        let replayed = queue.by_id(request.id).await.unwrap().unwrap();
        assert_eq!(replayed.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_failing_hook_falls_through_to_lww() {
        let (resolver, conflicts, queue, hooks) = fixture().await;

        hooks.register(
            "customers",
            Arc::new(|_, _| Err(Error::Sync("hook exploded".to_string()))),
        );

        let request = queued(&queue, "/api/customers/42", "{}").await;
        let conflict_id = resolver
            .handle_conflict(&request, &response(409, "{}"))
            .await
            .unwrap();

        let record = conflicts.by_id(conflict_id).await.unwrap().unwrap();
        assert_eq!(record.resolution_status, ResolutionStatus::ServerWins);
    }

    #[tokio::test]
    async fn test_hook_registration_latest_wins_and_unregister() {
        let (resolver, conflicts, queue, hooks) = fixture().await;

        hooks.register(
            "customers",
            Arc::new(|_, _| Ok(Some(ResolutionStatus::Skip))),
        );
        hooks.register(
            "customers",
            Arc::new(|_, _| Ok(Some(ResolutionStatus::LocalWins))),
        );

        let request = queued(&queue, "/api/customers/1", "{}").await;
        let conflict_id = resolver
            .handle_conflict(&request, &response(409, "{}"))
            .await
            .unwrap();
        let record = conflicts.by_id(conflict_id).await.unwrap().unwrap();
        assert_eq!(record.resolution_status, ResolutionStatus::LocalWins);

        hooks.unregister("customers");
        let request = queued(&queue, "/api/customers/2", "{}").await;
        let conflict_id = resolver
            .handle_conflict(&request, &response(409, "{}"))
            .await
            .unwrap();
        let record = conflicts.by_id(conflict_id).await.unwrap().unwrap();
        assert_eq!(record.resolution_status, ResolutionStatus::ServerWins);
    }

    #[tokio::test]
    async fn test_resolve_manually_validates_and_is_idempotent() {
        let (resolver, conflicts, queue, _) = fixture().await;

        let request = queued(&queue, "/api/customers/42", "{}").await;
        let conflict_id = conflicts
            .record(
                NewConflict {
                    local_request_id: Some(request.id),
                    ..Default::default()
                },
                ConflictType::VersionMismatch,
            )
            .await
            .unwrap();

        assert!(matches!(
            resolver.resolve_manually(conflict_id, "ascend").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            resolver.resolve_manually(9999, "skip").await,
            Err(Error::NotFound(_))
        ));

        assert!(resolver.resolve_manually(conflict_id, "skip").await.unwrap());
        // Second application of the same value is a no-op
        assert!(!resolver.resolve_manually(conflict_id, "skip").await.unwrap());

        let finished = queue.by_id(request.id).await.unwrap().unwrap();
        assert_eq!(finished.status, RequestStatus::Completed);
        assert_eq!(finished.error_message.as_deref(), Some("Resolved: skip"));
    }
}
