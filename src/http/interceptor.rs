// http/interceptor.rs - Routes requests to the network, the cache, or the queue

use crate::credentials::CredentialStore;
use crate::db::cache::ResponseCache;
use crate::db::queue::{fingerprint, RequestQueue};
use crate::http::client::{OutboundRequest, Transport, TransportResponse};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Caller-supplied request parts beyond method and URL
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// What happened to an intercepted request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum InterceptOutcome {
    /// The request reached the remote service; here is its response.
    Passthrough { status: u16, body: String },
    /// Offline (or unreachable), but a cached response exists.
    Cached { status: u16, data: String, cached: bool },
    /// A mutating request was parked in the durable queue.
    Queued {
        status: u16,
        queue_id: i64,
        queued: bool,
    },
}

fn is_idempotent(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "OPTIONS")
}

fn is_mutating(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH" | "DELETE")
}

/// The boundary between the client application and everything else.
///
/// Reads are served from the network when possible and the response cache
/// when not; writes go to the network when online and into the queue when
/// offline or when the attempt dies with a network-class error.
#[derive(Clone)]
pub struct Interceptor {
    transport: Arc<dyn Transport>,
    queue: RequestQueue,
    cache: ResponseCache,
    credentials: Arc<dyn CredentialStore>,
    online: Arc<AtomicBool>,
}

impl Interceptor {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: RequestQueue,
        cache: ResponseCache,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            transport,
            queue,
            cache,
            credentials,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Online state as reported by the host. It steers routing; it does not
    /// by itself stop anyone from attempting the network and catching the
    /// error.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::AcqRel);
        if was != online {
            tracing::info!("Connectivity changed: online={}", online);
        }
    }

    /// Send a request over the transport with the bearer token attached.
    ///
    /// Authorization is injected here, immediately before the send, so the
    /// token never rides along into the durable queue. The sync engine
    /// drains queued entries through this same path.
    pub async fn forward(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> Result<TransportResponse> {
        let mut headers = headers.clone();
        if let Some(token) = self.credentials.get_token()? {
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        }

        let request = OutboundRequest {
            method: method.to_string(),
            url: url.to_string(),
            headers,
            body: body.map(|b| b.to_string()),
        };

        self.transport.send(&request).await
    }

    /// Classify and execute a request from the client application.
    pub async fn execute(
        &self,
        method: &str,
        url: &str,
        options: RequestOptions,
    ) -> Result<InterceptOutcome> {
        let method = method.to_uppercase();
        let hash = fingerprint(&method, url, options.body.as_deref());

        if is_idempotent(&method) {
            return self.execute_read(&method, url, &options, &hash).await;
        }

        if is_mutating(&method) {
            return self.execute_write(&method, url, &options, &hash).await;
        }

        Err(Error::InvalidInput(format!(
            "Unsupported HTTP method: {}",
            method
        )))
    }

    async fn execute_read(
        &self,
        method: &str,
        url: &str,
        options: &RequestOptions,
        hash: &str,
    ) -> Result<InterceptOutcome> {
        if !self.is_online() {
            return self.cached_or_offline_error(method, url, hash).await;
        }

        match self
            .forward(method, url, &options.headers, options.body.as_deref())
            .await
        {
            Ok(response) => {
                if response.is_success() {
                    self.cache.put(hash, &response.body).await?;
                }
                Ok(InterceptOutcome::Passthrough {
                    status: response.status,
                    body: response.body,
                })
            }
            // The attempt died before producing a response; a cached copy
            // beats surfacing the transport error.
            Err(Error::Network(reason)) => {
                tracing::debug!("Read fell back to cache: {}", reason);
                self.cached_or_offline_error(method, url, hash).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cached_or_offline_error(
        &self,
        method: &str,
        url: &str,
        hash: &str,
    ) -> Result<InterceptOutcome> {
        match self.cache.get(hash).await? {
            Some(hit) => Ok(InterceptOutcome::Cached {
                status: 200,
                data: hit.response_data.unwrap_or_default(),
                cached: true,
            }),
            None => Err(Error::Network(format!(
                "Offline and no cached response for {} {}",
                method, url
            ))),
        }
    }

    async fn execute_write(
        &self,
        method: &str,
        url: &str,
        options: &RequestOptions,
        _hash: &str,
    ) -> Result<InterceptOutcome> {
        if self.is_online() {
            match self
                .forward(method, url, &options.headers, options.body.as_deref())
                .await
            {
                Ok(response) => {
                    return Ok(InterceptOutcome::Passthrough {
                        status: response.status,
                        body: response.body,
                    })
                }
                Err(Error::Network(reason)) => {
                    tracing::warn!("Write attempt failed, queueing: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }

        let headers_text = if options.headers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&options.headers)?)
        };

        let enqueued = self
            .queue
            .enqueue(method, url, headers_text.as_deref(), options.body.as_deref())
            .await?;

        Ok(InterceptOutcome::Queued {
            status: 202,
            queue_id: enqueued.id,
            queued: true,
        })
    }
}

/// Decode the serialized header mapping stored on a queue row.
pub fn headers_from_row(raw: Option<&str>) -> Result<HashMap<String, String>> {
    match raw {
        Some(text) if !text.is_empty() => Ok(serde_json::from_str(text)?),
        _ => Ok(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryStore;
    use crate::db::queue::RequestStatus;
    use crate::db::Database;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted transport: pops one canned result per send, records sends.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<TransportResponse>>>,
        seen: Mutex<Vec<OutboundRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<TransportResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<OutboundRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse> {
            self.seen.lock().unwrap().push(request.clone());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(Error::Network("script exhausted".to_string()));
            }
            script.remove(0)
        }
    }

    fn ok(status: u16, body: &str) -> Result<TransportResponse> {
        Ok(TransportResponse {
            status,
            body: body.to_string(),
        })
    }

    async fn interceptor_with(
        script: Vec<Result<TransportResponse>>,
    ) -> (Interceptor, Arc<ScriptedTransport>, RequestQueue, ResponseCache) {
        let db = Database::in_memory().await.unwrap();
        let queue = RequestQueue::new(db.pool.clone());
        let cache = ResponseCache::new(db.pool.clone());
        let transport = ScriptedTransport::new(script);
        let interceptor = Interceptor::new(
            transport.clone(),
            queue.clone(),
            cache.clone(),
            Arc::new(MemoryStore::with_token("tok-123")),
        );
        (interceptor, transport, queue, cache)
    }

    #[tokio::test]
    async fn test_online_read_passes_through_and_caches() {
        let (interceptor, transport, _, cache) =
            interceptor_with(vec![ok(200, r#"{"items":[1]}"#)]).await;

        let outcome = interceptor
            .execute("GET", "/api/items", RequestOptions::default())
            .await
            .unwrap();

        match outcome {
            InterceptOutcome::Passthrough { status, body } => {
                assert_eq!(status, 200);
                assert_eq!(body, r#"{"items":[1]}"#);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The body landed in the cache under the request fingerprint
        let hash = fingerprint("GET", "/api/items", None);
        assert!(cache.get(&hash).await.unwrap().is_some());

        // The bearer token rode along on the wire
        let sent = transport.requests();
        assert_eq!(sent[0].headers.get("Authorization").unwrap(), "Bearer tok-123");
    }

    #[tokio::test]
    async fn test_offline_read_hits_cache() {
        let (interceptor, transport, _, cache) = interceptor_with(vec![]).await;

        let hash = fingerprint("GET", "/api/items", None);
        cache.put(&hash, r#"{"items":[2]}"#).await.unwrap();
        interceptor.set_online(false);

        let outcome = interceptor
            .execute("GET", "/api/items", RequestOptions::default())
            .await
            .unwrap();

        match outcome {
            InterceptOutcome::Cached { status, data, cached } => {
                assert_eq!(status, 200);
                assert_eq!(data, r#"{"items":[2]}"#);
                assert!(cached);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Nothing touched the network
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_offline_read_without_cache_is_an_error() {
        let (interceptor, _, _, _) = interceptor_with(vec![]).await;
        interceptor.set_online(false);

        let err = interceptor
            .execute("GET", "/api/items", RequestOptions::default())
            .await;
        assert!(matches!(err, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_read_falls_back_to_cache_on_transport_error() {
        let (interceptor, _, _, cache) =
            interceptor_with(vec![Err(Error::Network("connection refused".to_string()))]).await;

        let hash = fingerprint("GET", "/api/items", None);
        cache.put(&hash, "stale-but-served").await.unwrap();

        let outcome = interceptor
            .execute("GET", "/api/items", RequestOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, InterceptOutcome::Cached { .. }));
    }

    #[tokio::test]
    async fn test_offline_write_queues() {
        let (interceptor, transport, queue, _) = interceptor_with(vec![]).await;
        interceptor.set_online(false);

        let outcome = interceptor
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
            InterceptOutcome::Queued { status, queue_id, queued } => {
                assert_eq!(status, 202);
                assert!(queued);
                queue_id
            }
            other => panic!("unexpected outcome: {:?}", other),
        };

        let row = queue.by_id(queue_id).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Pending);
        assert_eq!(row.body.as_deref(), Some(r#"{"a":1}"#));
        // The token is never persisted with the queued request
        assert!(row.headers.is_none());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_online_write_failure_queues() {
        let (interceptor, _, queue, _) =
            interceptor_with(vec![Err(Error::Network("timeout".to_string()))]).await;

        let outcome = interceptor
            .execute(
                "PUT",
                "/api/items/1",
                RequestOptions {
                    body: Some(r#"{"a":2}"#.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(matches!(outcome, InterceptOutcome::Queued { .. }));
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_online_write_non_2xx_is_passthrough() {
        let (interceptor, _, queue, _) = interceptor_with(vec![ok(409, "conflict")]).await;

        let outcome = interceptor
            .execute(
                "PUT",
                "/api/items/1",
                RequestOptions {
                    body: Some(r#"{"a":2}"#.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // HTTP-level failures are the caller's (or the engine's) problem,
        // not a reason to queue.
        match outcome {
            InterceptOutcome::Passthrough { status, .. } => assert_eq!(status, 409),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(queue.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_offline_writes_dedup_onto_one_row() {
        let (interceptor, _, queue, _) = interceptor_with(vec![]).await;
        interceptor.set_online(false);

        let options = RequestOptions {
            body: Some(r#"{"a":1}"#.to_string()),
            ..Default::default()
        };

        let first = interceptor
            .execute("POST", "/api/items", options.clone())
            .await
            .unwrap();
        let second = interceptor
            .execute("POST", "/api/items", options)
            .await
            .unwrap();

        match (first, second) {
            (
                InterceptOutcome::Queued { queue_id: a, .. },
                InterceptOutcome::Queued { queue_id: b, .. },
            ) => assert_eq!(a, b),
            other => panic!("unexpected outcomes: {:?}", other),
        }
        assert_eq!(queue.stats().await.unwrap().total(), 1);
    }

    #[test]
    fn test_headers_from_row() {
        assert!(headers_from_row(None).unwrap().is_empty());
        assert!(headers_from_row(Some("")).unwrap().is_empty());

        let parsed = headers_from_row(Some(r#"{"X-A":"1"}"#)).unwrap();
        assert_eq!(parsed.get("X-A").unwrap(), "1");

        assert!(headers_from_row(Some("not json")).is_err());
    }
}
