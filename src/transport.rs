//! Network transport.
//!
//! One transmission path shared by the dispatcher (live calls) and the
//! sync engine (queue replay), behind a trait so tests inject scripted
//! doubles. The HTTP implementation wraps reqwest: bearer-token auth from
//! the session store, fixed headers the backend requires, per-call
//! timeout, and normalized failure mapping: a non-2xx status is a
//! failure value, never a panic or a raw error chain.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{BackendEndpoint, BackendStrategy, EngineConfig};
use crate::error::{status_message, TransportError};
use crate::session::SessionStore;

/// Backends exposed through ngrok tunnels serve an interstitial page
/// instead of the API unless this header is present.
const HEADER_SKIP_TUNNEL_WARNING: &str = "ngrok-skip-browser-warning";

/// A fully described outgoing request, independent of any HTTP client.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl OutboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }
}

/// Reachability report for diagnostics and onboarding screens.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemStatus {
    pub reachable: bool,
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The transmission seam between the engine and the network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transmit one request and return the parsed JSON body (`Null` for
    /// empty responses). Every failure mode maps to a `TransportError`.
    async fn send(&self, request: &OutboundRequest) -> Result<Value, TransportError>;

    /// Lightweight reachability check against the backend's `/health`.
    /// Never errors; an unreachable backend is simply `false`.
    async fn probe(&self) -> bool;

    /// Name of the backend currently in use, for status surfaces.
    fn current_backend(&self) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise a backend base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

pub struct HttpTransport {
    client: Client,
    probe_client: Client,
    backends: Vec<BackendEndpoint>,
    strategy: BackendStrategy,
    /// Index into `backends` pinned by the last successful health ranking.
    pinned: Mutex<Option<usize>>,
    session: Arc<SessionStore>,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig, session: Arc<SessionStore>) -> Result<Self, TransportError> {
        let mut backends: Vec<BackendEndpoint> = config
            .backends
            .iter()
            .map(|b| BackendEndpoint {
                url: normalize_backend_url(&b.url),
                name: b.name.clone(),
                priority: b.priority,
            })
            .collect();
        backends.sort_by_key(|b| b.priority);
        if backends.is_empty() {
            return Err(TransportError::NoBackend);
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let probe_client = Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            client,
            probe_client,
            backends,
            strategy: config.strategy,
            pinned: Mutex::new(None),
            session,
        })
    }

    fn pinned_index(&self) -> Option<usize> {
        self.pinned.lock().ok().and_then(|guard| *guard)
    }

    fn pin(&self, index: Option<usize>) {
        if let Ok(mut guard) = self.pinned.lock() {
            *guard = index;
        }
    }

    async fn probe_backend(&self, backend: &BackendEndpoint) -> bool {
        let health_url = format!("{}/health", backend.url);
        match self
            .probe_client
            .get(&health_url)
            .header(HEADER_SKIP_TUNNEL_WARNING, "true")
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Pick the backend for the next request. `Fixed` always uses the
    /// first endpoint; `HealthRanked` keeps the pinned endpoint until a
    /// connection failure unpins it, then re-probes in priority order.
    async fn select_backend(&self) -> Result<BackendEndpoint, TransportError> {
        match self.strategy {
            BackendStrategy::Fixed => Ok(self.backends[0].clone()),
            BackendStrategy::HealthRanked => {
                if let Some(index) = self.pinned_index() {
                    return Ok(self.backends[index].clone());
                }
                for (index, backend) in self.backends.iter().enumerate() {
                    if self.probe_backend(backend).await {
                        info!(backend = %backend.name, "backend selected by health ranking");
                        self.pin(Some(index));
                        return Ok(backend.clone());
                    }
                }
                Err(TransportError::NoBackend)
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<Value, TransportError> {
        let backend = self.select_backend().await?;
        let url = format!("{}{}", backend.url, request.path);

        let mut req = self
            .client
            .request(request.method.clone(), &url)
            .header("Content-Type", "application/json")
            .header(HEADER_SKIP_TUNNEL_WARNING, "true");

        if !request.query.is_empty() {
            req = req.query(&request.query);
        }
        if let Some(token) = self.session.token() {
            req = req.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        debug!(method = %request.method, path = %request.path, backend = %backend.name, "transmitting");

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                // A dead connection may mean this backend is gone; unpin so
                // the next call re-ranks.
                self.pin(None);
                return Err(TransportError::from_reqwest(&backend.url, &e));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(error_from_response(status, resp).await);
        }

        let body_text = resp.text().await.unwrap_or_default();
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| TransportError::InvalidBody(e.to_string()))
    }

    async fn probe(&self) -> bool {
        match self.select_backend().await {
            Ok(backend) => {
                let healthy = self.probe_backend(&backend).await;
                if !healthy {
                    self.pin(None);
                }
                healthy
            }
            Err(_) => false,
        }
    }

    fn current_backend(&self) -> Option<String> {
        match self.strategy {
            BackendStrategy::Fixed => Some(self.backends[0].name.clone()),
            BackendStrategy::HealthRanked => self
                .pinned_index()
                .map(|index| self.backends[index].name.clone()),
        }
    }
}

/// Build a status error, preserving server-provided detail for the sync
/// queue's `last_error` and diagnostics.
async fn error_from_response(status: StatusCode, resp: reqwest::Response) -> TransportError {
    let body_text = resp.text().await.unwrap_or_default();
    let fallback = status_message(status);

    let message = if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or(fallback);
        match json.get("details").or_else(|| json.get("errors")) {
            Some(details) => format!("{message}: {details}"),
            None => message,
        }
    } else if !body_text.trim().is_empty() {
        format!("{fallback}: {}", body_text.trim())
    } else {
        fallback
    };

    warn!(status = status.as_u16(), %message, "request failed");
    TransportError::Status {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_backend_url_adds_scheme() {
        assert_eq!(
            normalize_backend_url("api.pixelnest.app"),
            "https://api.pixelnest.app"
        );
        assert_eq!(
            normalize_backend_url("localhost:3000"),
            "http://localhost:3000"
        );
        assert_eq!(
            normalize_backend_url("127.0.0.1:8080/"),
            "http://127.0.0.1:8080"
        );
    }

    #[test]
    fn test_normalize_backend_url_strips_api_suffix() {
        assert_eq!(
            normalize_backend_url("https://api.pixelnest.app/api/"),
            "https://api.pixelnest.app"
        );
        assert_eq!(
            normalize_backend_url("https://api.pixelnest.app///"),
            "https://api.pixelnest.app"
        );
    }

    #[test]
    fn test_outbound_request_builder_defaults() {
        let req = OutboundRequest::new(Method::GET, "/api/suppliers");
        assert!(req.query.is_empty());
        assert!(req.body.is_none());
    }
}
