//! Request dispatcher.
//!
//! The single entry point every application feature calls. Per call it
//! decides between network, cache, and the offline queue:
//!
//! | condition                               | behavior                      |
//! |-----------------------------------------|-------------------------------|
//! | read, fresh cache entry                 | cached value                  |
//! | online (any verb)                       | transmit                      |
//! | read, transmission failed               | cache hit, else typed empty   |
//! | write, offline or transmission failed   | enqueue + optimistic result   |
//!
//! Transport errors never escape to callers; every read resolves to a
//! value the UI can render. The one surfaced error is a write that can be
//! neither sent nor durably queued.

use reqwest::Method;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::config::{EngineConfig, ResponseShape};
use crate::connectivity::ConnectivityMonitor;
use crate::error::RequestError;
use crate::events::{EngineEvent, EventBus};
use crate::queue::{MutationVerb, QueueStore};
use crate::transport::{OutboundRequest, Transport};

/// Operation requested by a feature. Reads are cacheable; the three write
/// verbs are queueable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Read,
    Create,
    Update,
    Delete,
}

impl Verb {
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read)
    }

    pub fn http_method(&self) -> Method {
        match self {
            Self::Read => Method::GET,
            Self::Create => Method::POST,
            Self::Update => Method::PUT,
            Self::Delete => Method::DELETE,
        }
    }

    fn mutation_verb(&self) -> Option<MutationVerb> {
        match self {
            Self::Read => None,
            Self::Create => Some(MutationVerb::Create),
            Self::Update => Some(MutationVerb::Update),
            Self::Delete => Some(MutationVerb::Delete),
        }
    }
}

pub struct Dispatcher {
    config: Arc<EngineConfig>,
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    queue: Arc<QueueStore>,
    connectivity: Arc<ConnectivityMonitor>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        config: Arc<EngineConfig>,
        transport: Arc<dyn Transport>,
        cache: Arc<ResponseCache>,
        queue: Arc<QueueStore>,
        connectivity: Arc<ConnectivityMonitor>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            transport,
            cache,
            queue,
            connectivity,
            events,
        }
    }

    /// Issue a request against a resource path. `query` only affects
    /// reads (it is part of the cache signature); `payload` only affects
    /// writes.
    pub async fn request(
        &self,
        resource: &str,
        verb: Verb,
        payload: Option<Value>,
        query: &[(String, String)],
    ) -> Result<Value, RequestError> {
        let cache_key = ResponseCache::key_for(verb.http_method().as_str(), resource, query);
        let online = self.connectivity.is_online();

        // Reads are served from cache while the entry is fresh, online or
        // not: a repeat of an identical call within the TTL must not cost
        // a network round trip.
        if verb.is_read() {
            if let Some(cached) = self.cache.get(&cache_key) {
                debug!(resource, "serving read from cache");
                return Ok(cached);
            }
        }

        if online {
            let mut outbound = OutboundRequest::new(verb.http_method(), resource);
            outbound.query = query.to_vec();
            outbound.body = payload.clone();

            match self.transport.send(&outbound).await {
                Ok(value) => {
                    if verb.is_read() {
                        self.cache.put(&cache_key, value.clone());
                    } else {
                        // A confirmed local write invalidates the family the
                        // same way a remote change event does; otherwise a
                        // create followed by a list-read serves stale data.
                        self.cache.invalidate_family(&self.config.family_for(resource));
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(resource, error = %e, "online request failed, falling back");
                }
            }
        }

        if verb.is_read() {
            if let Some(cached) = self.cache.get(&cache_key) {
                return Ok(cached);
            }
            // The UI must render something; an unreachable backend turns
            // into the resource's typed empty value.
            return Ok(empty_value(self.config.shape_for(resource)));
        }

        self.enqueue_offline_write(resource, verb, payload)
    }

    /// Queue a write for later replay and hand back an optimistic result
    /// so the UI can proceed without waiting for the backend.
    fn enqueue_offline_write(
        &self,
        resource: &str,
        verb: Verb,
        payload: Option<Value>,
    ) -> Result<Value, RequestError> {
        // Reads never reach this path.
        let mutation_verb = verb.mutation_verb().unwrap_or(MutationVerb::Create);

        let mutation = self
            .queue
            .enqueue(resource, mutation_verb, payload.clone())
            .map_err(RequestError::QueueUnavailable)?;

        self.events.emit(EngineEvent::MutationQueued {
            id: mutation.id.clone(),
            resource: resource.to_string(),
        });
        debug!(resource, id = %mutation.id, "write queued for sync");

        Ok(optimistic_result(payload))
    }
}

/// Typed empty value for a read that cannot be served at all.
fn empty_value(shape: ResponseShape) -> Value {
    match shape {
        ResponseShape::Collection => json!([]),
        ResponseShape::Singleton => json!({}),
    }
}

/// The submitted payload merged with a synthetic identifier and the
/// marker flags the UI uses to badge not-yet-confirmed records.
fn optimistic_result(payload: Option<Value>) -> Value {
    let mut map = match payload {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
        None => {
            let mut map = Map::new();
            map.insert("success".to_string(), json!(true));
            map
        }
    };
    // Updates and deletes already carry their real identifier; only a
    // create gets a temporary one.
    map.entry("id".to_string())
        .or_insert_with(|| json!(format!("temp-{}", Uuid::new_v4())));
    map.insert("pendingSync".to_string(), json!(true));
    map.insert("offline".to_string(), json!(true));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::db::{self, DbState};
    use crate::error::TransportError;

    /// Transport double: serves scripted results and counts calls.
    struct StubTransport {
        calls: AtomicUsize,
        responses: Mutex<Vec<Result<Value, TransportError>>>,
    }

    impl StubTransport {
        fn new(responses: Vec<Result<Value, TransportError>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                responses: Mutex::new(responses),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn send(&self, _request: &OutboundRequest) -> Result<Value, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(TransportError::NoBackend)
            } else {
                responses.remove(0)
            }
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    fn test_dispatcher(
        online: bool,
        transport: Arc<StubTransport>,
    ) -> (Dispatcher, Arc<QueueStore>, Arc<ResponseCache>, EventBus) {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        db::run_migrations_for_test(&conn);
        let queue = Arc::new(QueueStore::new(Arc::new(DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        })));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(3600), 100));
        let events = EventBus::new();
        let config = Arc::new(EngineConfig::single_backend(
            "https://api.example.test",
            "/tmp",
        ));
        let connectivity = Arc::new(ConnectivityMonitor::new(online, events.clone()));
        let dispatcher = Dispatcher::new(
            config,
            transport,
            Arc::clone(&cache),
            Arc::clone(&queue),
            connectivity,
            events.clone(),
        );
        (dispatcher, queue, cache, events)
    }

    #[tokio::test]
    async fn test_online_read_caches_and_second_call_skips_network() {
        let suppliers = json!([{ "id": 1, "name": "X" }]);
        let transport = Arc::new(StubTransport::new(vec![Ok(suppliers.clone())]));
        let (dispatcher, _queue, _cache, _events) = test_dispatcher(true, Arc::clone(&transport));

        let first = dispatcher
            .request("/api/suppliers", Verb::Read, None, &[])
            .await
            .unwrap();
        assert_eq!(first, suppliers);
        assert_eq!(transport.call_count(), 1);

        // Identical call within the TTL is served from cache.
        let second = dispatcher
            .request("/api/suppliers", Verb::Read, None, &[])
            .await
            .unwrap();
        assert_eq!(second, suppliers);
        assert_eq!(transport.call_count(), 1);

        // A different query signature is a different entry.
        let third = dispatcher
            .request(
                "/api/suppliers",
                Verb::Read,
                None,
                &[("dateRange".to_string(), "week".to_string())],
            )
            .await
            .unwrap();
        assert_eq!(third, json!([]));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_offline_read_hits_cache_without_network() {
        let transport = Arc::new(StubTransport::new(vec![]));
        let (dispatcher, _queue, cache, _events) = test_dispatcher(false, Arc::clone(&transport));

        cache.put("GET /api/bills", json!([{ "id": 9 }]));
        let result = dispatcher
            .request("/api/bills", Verb::Read, None, &[])
            .await
            .unwrap();
        assert_eq!(result, json!([{ "id": 9 }]));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_read_returns_typed_empty_value() {
        let transport = Arc::new(StubTransport::new(vec![Err(TransportError::Timeout(
            "https://api.example.test".into(),
        ))]));
        let (dispatcher, _queue, _cache, _events) = test_dispatcher(true, Arc::clone(&transport));

        let collection = dispatcher
            .request("/api/transactions", Verb::Read, None, &[])
            .await
            .unwrap();
        assert_eq!(collection, json!([]));

        let singleton = dispatcher
            .request("/api/dashboard", Verb::Read, None, &[])
            .await
            .unwrap();
        assert_eq!(singleton, json!({}));
    }

    #[tokio::test]
    async fn test_offline_create_returns_optimistic_result_and_queues() {
        let transport = Arc::new(StubTransport::new(vec![]));
        let (dispatcher, queue, _cache, events) = test_dispatcher(false, Arc::clone(&transport));
        let mut rx = events.subscribe();

        let result = dispatcher
            .request(
                "/api/transactions",
                Verb::Create,
                Some(json!({ "customerName": "A", "amount": 100 })),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(result["customerName"], json!("A"));
        assert_eq!(result["amount"], json!(100));
        assert_eq!(result["pendingSync"], json!(true));
        assert!(result["id"].as_str().unwrap().starts_with("temp-"));
        assert_eq!(transport.call_count(), 0);

        let due = queue.peek_due().unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].resource, "/api/transactions");
        assert_eq!(due[0].verb, MutationVerb::Create);

        match rx.try_recv().unwrap() {
            EngineEvent::MutationQueued { resource, .. } => {
                assert_eq!(resource, "/api/transactions");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_online_write_enqueues_without_inline_retry() {
        let transport = Arc::new(StubTransport::new(vec![Err(TransportError::Connect(
            "https://api.example.test".into(),
        ))]));
        let (dispatcher, queue, _cache, _events) = test_dispatcher(true, Arc::clone(&transport));

        let result = dispatcher
            .request(
                "/api/suppliers/7",
                Verb::Update,
                Some(json!({ "id": 7, "name": "Updated" })),
                &[],
            )
            .await
            .unwrap();

        // Attempted once online, then queued; no inline retry.
        assert_eq!(transport.call_count(), 1);
        assert_eq!(result["pendingSync"], json!(true));
        // An update keeps its real identifier.
        assert_eq!(result["id"], json!(7));

        let due = queue.peek_due().unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].verb, MutationVerb::Update);
        assert_eq!(due[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_successful_write_invalidates_resource_family() {
        let transport = Arc::new(StubTransport::new(vec![Ok(json!({ "id": 3 }))]));
        let (dispatcher, _queue, cache, _events) = test_dispatcher(true, Arc::clone(&transport));

        cache.put("GET /api/expenditures", json!([{ "id": 1 }]));
        cache.put("GET /api/suppliers", json!([{ "id": 2 }]));

        dispatcher
            .request(
                "/api/expenditures",
                Verb::Create,
                Some(json!({ "amount": 5 })),
                &[],
            )
            .await
            .unwrap();

        assert!(cache.get("GET /api/expenditures").is_none());
        assert!(cache.get("GET /api/suppliers").is_some());
    }

    #[tokio::test]
    async fn test_offline_delete_without_payload_gets_success_marker() {
        let transport = Arc::new(StubTransport::new(vec![]));
        let (dispatcher, queue, _cache, _events) = test_dispatcher(false, Arc::clone(&transport));

        let result = dispatcher
            .request("/api/bills/12", Verb::Delete, None, &[])
            .await
            .unwrap();

        assert_eq!(result["success"], json!(true));
        assert_eq!(result["pendingSync"], json!(true));
        assert_eq!(queue.peek_due().unwrap().len(), 1);
        assert_eq!(queue.peek_due().unwrap()[0].payload, None);
    }
}
