//! Live update listener.
//!
//! Long-lived subscription to the backend's push feed so that mutations
//! confirmed remotely (by this client or any other) invalidate cached
//! reads without polling. The feed is newline-delimited JSON over a
//! streaming GET; each event names a resource family and optionally a
//! record id. The listener only invalidates; the next read through the
//! dispatcher misses cache and repopulates.
//!
//! Everything here is best-effort: connect failures and dropped streams
//! reconnect forever with capped exponential backoff and are never
//! surfaced as errors to the rest of the app.

use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::session::SessionStore;
use crate::transport::normalize_backend_url;

const EVENTS_PATH: &str = "/api/events";

pub struct LiveUpdateListener {
    config: Arc<EngineConfig>,
    cache: Arc<ResponseCache>,
    session: Arc<SessionStore>,
    events: EventBus,
}

impl LiveUpdateListener {
    pub fn new(
        config: Arc<EngineConfig>,
        cache: Arc<ResponseCache>,
        session: Arc<SessionStore>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            cache,
            session,
            events,
        }
    }

    /// Spawn the subscription loop against the primary backend.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let listener = Arc::clone(self);
        tokio::spawn(async move {
            let Some(backend) = listener.config.backends.first() else {
                warn!("no backend configured, live updates disabled");
                return;
            };
            let feed_url = format!("{}{EVENTS_PATH}", normalize_backend_url(&backend.url));

            // No overall timeout: the stream is meant to stay open.
            let client = match Client::builder()
                .connect_timeout(listener.config.request_timeout)
                .build()
            {
                Ok(c) => c,
                Err(e) => {
                    warn!("cannot build live update client: {e}");
                    return;
                }
            };

            info!(url = %feed_url, "live update listener started");
            let mut backoff = listener.config.live_reconnect_base;

            loop {
                if cancel.is_cancelled() {
                    break;
                }

                match listener.run_stream(&client, &feed_url, &cancel).await {
                    StreamOutcome::Cancelled => break,
                    StreamOutcome::Connected => {
                        // The subscription worked until the server or the
                        // network dropped it; start the backoff ladder over.
                        backoff = listener.config.live_reconnect_base;
                    }
                    StreamOutcome::Failed(reason) => {
                        debug!(%reason, "live update connection failed");
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(listener.config.live_reconnect_max);
            }
            info!("live update listener stopped");
        })
    }

    async fn run_stream(
        &self,
        client: &Client,
        feed_url: &str,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let mut request = client.get(feed_url).header("ngrok-skip-browser-warning", "true");
        if let Some(token) = self.session.token() {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            result = request.send() => match result {
                Ok(r) => r,
                Err(e) => return StreamOutcome::Failed(e.to_string()),
            }
        };
        if !response.status().is_success() {
            return StreamOutcome::Failed(format!("HTTP {}", response.status().as_u16()));
        }

        debug!("live update stream connected");
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return StreamOutcome::Cancelled,
                next = stream.next() => next,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(newline) = buffer.find('\n') {
                        let line = buffer[..newline].trim().to_string();
                        buffer.drain(..=newline);
                        if !line.is_empty() {
                            self.handle_event_line(&line);
                        }
                    }
                }
                Some(Err(e)) => {
                    // A mid-stream drop still counts as a successful
                    // connection for backoff purposes.
                    debug!("live update stream dropped: {e}");
                    return StreamOutcome::Connected;
                }
                None => {
                    // Server closed the stream cleanly.
                    return StreamOutcome::Connected;
                }
            }
        }
    }

    /// One feed line: `{"resource": "transactions", "event": "updated",
    /// "id": "..."}`. Only the resource family matters for invalidation.
    fn handle_event_line(&self, line: &str) {
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(%line, "ignoring malformed feed line: {e}");
                return;
            }
        };
        let Some(resource) = parsed.get("resource").and_then(Value::as_str) else {
            return;
        };

        let family = if resource.starts_with('/') {
            self.config.family_for(resource)
        } else {
            format!("/api/{resource}")
        };

        let removed = self.cache.invalidate_family(&family);
        debug!(
            family = %family,
            removed,
            event = parsed.get("event").and_then(|v| v.as_str()).unwrap_or("change"),
            "remote change received"
        );
        self.events.emit(EngineEvent::RemoteChange { resource: family });
    }
}

enum StreamOutcome {
    /// Shutdown requested.
    Cancelled,
    /// A connection was established (events may or may not have arrived).
    Connected,
    /// Could not connect or the server rejected the subscription.
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn test_listener() -> (Arc<LiveUpdateListener>, Arc<ResponseCache>, EventBus) {
        let config = Arc::new(EngineConfig::single_backend(
            "https://api.example.test",
            "/tmp",
        ));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(3600), 100));
        let events = EventBus::new();
        let listener = Arc::new(LiveUpdateListener::new(
            config,
            Arc::clone(&cache),
            Arc::new(SessionStore::new("pixel-nest-live-test")),
            events.clone(),
        ));
        (listener, cache, events)
    }

    #[test]
    fn test_event_line_invalidates_named_family() {
        let (listener, cache, events) = test_listener();
        let mut rx = events.subscribe();

        cache.put("GET /api/transactions", json!([{ "id": 1 }]));
        cache.put("GET /api/transactions?dateRange=week", json!([{ "id": 2 }]));
        cache.put("GET /api/bills", json!([{ "id": 3 }]));

        listener.handle_event_line(
            r#"{"resource": "transactions", "event": "created", "id": "t-9"}"#,
        );

        assert!(cache.get("GET /api/transactions").is_none());
        assert!(cache.get("GET /api/transactions?dateRange=week").is_none());
        assert!(cache.get("GET /api/bills").is_some());

        match rx.try_recv().unwrap() {
            EngineEvent::RemoteChange { resource } => assert_eq!(resource, "/api/transactions"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_line_accepts_full_paths() {
        let (listener, cache, _events) = test_listener();
        cache.put("GET /api/suppliers/7", json!({ "id": 7 }));
        listener.handle_event_line(r#"{"resource": "/api/suppliers/7", "event": "updated"}"#);
        assert!(cache.get("GET /api/suppliers/7").is_none());
    }

    #[test]
    fn test_malformed_lines_are_ignored() {
        let (listener, cache, events) = test_listener();
        let mut rx = events.subscribe();

        cache.put("GET /api/bills", json!([1]));
        listener.handle_event_line("not json at all");
        listener.handle_event_line(r#"{"event": "created"}"#);

        assert!(cache.get("GET /api/bills").is_some());
        assert!(rx.try_recv().is_err());
    }
}
