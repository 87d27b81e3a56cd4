//! Engine configuration.
//!
//! The engine is an explicitly constructed service object: everything it
//! needs (backend endpoints, timeouts, retry policy, the response-shape
//! table) is injected here by the composition root. No module-level
//! globals.

use std::path::PathBuf;
use std::time::Duration;

/// One backend the engine may talk to.
#[derive(Debug, Clone)]
pub struct BackendEndpoint {
    /// Base URL, normalized at engine construction (scheme added, trailing
    /// slashes and `/api` suffix stripped).
    pub url: String,
    /// Display name for status surfaces and logs.
    pub name: String,
    /// Lower numbers are probed first under `HealthRanked`.
    pub priority: u8,
}

impl BackendEndpoint {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            priority: 1,
        }
    }
}

/// How the transport picks a backend from the configured list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStrategy {
    /// Always use the first configured endpoint.
    Fixed,
    /// Probe endpoints in priority order, pin the first healthy one, and
    /// unpin on connection failure so the next request re-probes.
    HealthRanked,
}

/// Declared response shape of a resource family, used to synthesize the
/// typed empty value when a read cannot be served from network or cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Endpoint returns a JSON array; empty value is `[]`.
    Collection,
    /// Endpoint returns a single JSON object; empty value is `{}`.
    Singleton,
}

/// Resource-family path prefix mapped to its response shape.
#[derive(Debug, Clone)]
pub struct ShapeRule {
    pub prefix: String,
    pub shape: ResponseShape,
}

impl ShapeRule {
    pub fn new(prefix: impl Into<String>, shape: ResponseShape) -> Self {
        Self {
            prefix: prefix.into(),
            shape,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backends: Vec<BackendEndpoint>,
    pub strategy: BackendStrategy,

    /// Directory holding the engine database (`engine.db`).
    pub data_dir: PathBuf,

    /// Per-call network timeout.
    pub request_timeout: Duration,
    /// Timeout for the lightweight health probe.
    pub probe_timeout: Duration,
    /// Interval between reachability probes.
    pub probe_interval: Duration,
    /// Interval between periodic drain passes while online.
    pub sync_interval: Duration,

    /// Transmission attempts before a queued mutation is abandoned.
    pub max_retries: u32,
    /// Base delay for retry backoff (`base * 2^attempts`, capped).
    pub retry_base_delay: Duration,
    /// Cap on the retry backoff delay.
    pub retry_max_delay: Duration,

    /// Response cache time-to-live.
    pub cache_ttl: Duration,
    /// Response cache entry bound; oldest entries evicted past this.
    pub cache_max_entries: usize,

    /// Reconnect backoff bounds for the live event feed.
    pub live_reconnect_base: Duration,
    pub live_reconnect_max: Duration,

    /// Resource-family response shapes, matched by longest prefix.
    pub shapes: Vec<ShapeRule>,
}

impl EngineConfig {
    /// Configuration for a single fixed backend with the default policy
    /// knobs and the standard admin-app resource map.
    pub fn single_backend(url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backends: vec![BackendEndpoint::new(url, "primary")],
            strategy: BackendStrategy::Fixed,
            data_dir: data_dir.into(),
            request_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(30),
            sync_interval: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(3600),
            cache_max_entries: 100,
            live_reconnect_base: Duration::from_secs(1),
            live_reconnect_max: Duration::from_secs(60),
            shapes: default_shapes(),
        }
    }

    /// Resolve the response shape for a resource path. Longest configured
    /// prefix wins; unmapped resources fall back to `Singleton` (empty
    /// object).
    pub fn shape_for(&self, resource: &str) -> ResponseShape {
        self.shapes
            .iter()
            .filter(|rule| resource.starts_with(rule.prefix.as_str()))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| rule.shape)
            .unwrap_or(ResponseShape::Singleton)
    }

    /// Resolve the resource-family prefix a path belongs to, used for
    /// cache invalidation and same-family replay ordering. Falls back to
    /// the first two path segments (`/api/transactions/42/items` ->
    /// `/api/transactions`) for families without a shape rule.
    pub fn family_for(&self, resource: &str) -> String {
        if let Some(rule) = self
            .shapes
            .iter()
            .filter(|rule| resource.starts_with(rule.prefix.as_str()))
            .max_by_key(|rule| rule.prefix.len())
        {
            return rule.prefix.clone();
        }
        let trimmed = resource.split('?').next().unwrap_or(resource);
        let mut end = trimmed.len();
        let mut seen = 0;
        for (i, c) in trimmed.char_indices().skip(1) {
            if c == '/' {
                seen += 1;
                if seen == 2 {
                    end = i;
                    break;
                }
            }
        }
        trimmed[..end].to_string()
    }
}

/// The admin application's resource families.
pub fn default_shapes() -> Vec<ShapeRule> {
    use ResponseShape::{Collection, Singleton};
    vec![
        ShapeRule::new("/api/transactions", Collection),
        ShapeRule::new("/api/suppliers", Collection),
        ShapeRule::new("/api/expenditures", Collection),
        ShapeRule::new("/api/bills", Collection),
        ShapeRule::new("/api/inventory", Collection),
        ShapeRule::new("/api/reports", Collection),
        ShapeRule::new("/api/dashboard", Singleton),
        ShapeRule::new("/api/statistics", Singleton),
        ShapeRule::new("/api/search", Collection),
    ]
}
