//! Pixel Nest offline-first request/sync engine.
//!
//! Client-side resilience layer for the repair-shop admin application:
//! every feature issues requests through one dispatcher that keeps working
//! when the network does not. Reads fall back to a bounded TTL cache,
//! writes fall back to a durable SQLite queue, and a background sync
//! engine replays queued mutations in order once connectivity returns.
//! A streaming event feed keeps cached reads fresh without polling.
//!
//! The engine is an explicitly constructed service object owned by the
//! application's composition root. Configuration, storage, and the
//! network seam are all injected, so tests run against doubles without
//! touching global state.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cache;
mod config;
mod connectivity;
mod db;
mod dispatcher;
mod error;
mod events;
mod live;
mod queue;
mod resources;
mod session;
mod sync;
mod transport;

pub use cache::ResponseCache;
pub use config::{BackendEndpoint, BackendStrategy, EngineConfig, ResponseShape, ShapeRule};
pub use connectivity::ConnectivityMonitor;
pub use dispatcher::{Dispatcher, Verb};
pub use error::{RequestError, StoreError, TransportError};
pub use events::{EngineEvent, EventBus};
pub use queue::{MutationState, MutationVerb, QueueDepths, QueueStore, QueuedMutation};
pub use resources::{Resources, StatsPeriod};
pub use session::SessionStore;
pub use sync::{DrainStats, SyncEngine};
pub use transport::{HttpTransport, OutboundRequest, SystemStatus, Transport};

/// Service name keying the OS credential store.
const CREDENTIAL_SERVICE: &str = "pixel-nest-sync";

/// Initialise tracing with an env-filter (`RUST_LOG`) falling back to
/// `info`. Optional: embedders with their own subscriber skip this.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// Snapshot of the engine for connection indicators and diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub online: bool,
    pub backend: Option<String>,
    pub pending_mutations: i64,
    pub in_flight_mutations: i64,
    pub cache_entries: usize,
    pub last_drain_at: Option<DateTime<Utc>>,
    pub authenticated: bool,
}

/// The composition root: owns the stores, the monitor, the dispatcher,
/// the sync engine, and the live listener, plus the background tasks
/// that drive them.
pub struct Engine {
    config: Arc<EngineConfig>,
    session: Arc<SessionStore>,
    cache: Arc<ResponseCache>,
    queue: Arc<QueueStore>,
    connectivity: Arc<ConnectivityMonitor>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    sync: Arc<SyncEngine>,
    live: Arc<live::LiveUpdateListener>,
    events: EventBus,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build the engine with the real HTTP transport and OS credential
    /// store. Background tasks are not started until [`Engine::start`].
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let session = Arc::new(SessionStore::new(CREDENTIAL_SERVICE));
        let transport: Arc<dyn Transport> =
            Arc::new(HttpTransport::new(&config, Arc::clone(&session))?);
        Self::with_transport(config, transport, session)
    }

    /// Build the engine around an injected transport and session store:
    /// the seam test doubles come through.
    pub fn with_transport(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        session: Arc<SessionStore>,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let events = EventBus::new();

        let db = Arc::new(db::init(&config.data_dir)?);
        let queue = Arc::new(QueueStore::new(db));
        let cache = Arc::new(ResponseCache::new(config.cache_ttl, config.cache_max_entries));
        // Seeded optimistic; the first probe corrects a wrong guess within
        // one tick.
        let connectivity = Arc::new(ConnectivityMonitor::new(true, events.clone()));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(&transport),
            Arc::clone(&cache),
            Arc::clone(&queue),
            Arc::clone(&connectivity),
            events.clone(),
        ));
        let sync = Arc::new(SyncEngine::new(
            Arc::clone(&config),
            Arc::clone(&queue),
            Arc::clone(&transport),
            Arc::clone(&cache),
            Arc::clone(&connectivity),
            events.clone(),
        ));
        let live = Arc::new(live::LiveUpdateListener::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            Arc::clone(&session),
            events.clone(),
        ));

        Ok(Self {
            config,
            session,
            cache,
            queue,
            connectivity,
            transport,
            dispatcher,
            sync,
            live,
            events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the probe loop, the sync loop, and the live update listener.
    pub fn start(&self) {
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if !tasks.is_empty() {
            return;
        }
        info!("engine starting background tasks");
        tasks.push(self.connectivity.start_probe_loop(
            Arc::clone(&self.transport),
            self.config.probe_interval,
            self.cancel.clone(),
        ));
        tasks.push(self.sync.start(self.cancel.clone()));
        tasks.push(self.live.start(self.cancel.clone()));
    }

    /// Stop background tasks and wait for them to finish. Outstanding
    /// timers are dropped with their tasks, so nothing leaks past here.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("engine stopped");
    }

    // -----------------------------------------------------------------
    // Request surfaces
    // -----------------------------------------------------------------

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Typed per-resource helpers over the dispatcher.
    pub fn resources(&self) -> Resources {
        Resources::new(Arc::clone(&self.dispatcher))
    }

    pub fn connectivity(&self) -> Arc<ConnectivityMonitor> {
        Arc::clone(&self.connectivity)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Trigger an immediate drain pass.
    pub async fn force_sync(&self) -> DrainStats {
        self.sync.drain().await
    }

    // -----------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------

    /// Authenticate against the backend and persist the returned bearer
    /// token and user profile. Unlike feature requests, this does not
    /// queue offline; a login needs a live backend.
    pub async fn login(&self, username: &str, password: &str) -> Result<Value, TransportError> {
        let mut request =
            OutboundRequest::new(reqwest::Method::POST, "/api/auth/login");
        request.body = Some(serde_json::json!({
            "username": username,
            "password": password,
        }));

        let response = self.transport.send(&request).await?;

        if let Some(token) = response
            .get("token")
            .or_else(|| response.get("accessToken"))
            .and_then(Value::as_str)
        {
            if let Err(e) = self.session.set_token(token) {
                warn!("failed to persist session token: {e}");
            }
        }
        if let Some(user) = response.get("user") {
            if let Err(e) = self.session.set_profile(user) {
                warn!("failed to persist user profile: {e}");
            }
        }

        Ok(response)
    }

    /// Clear the stored session. Purely local.
    pub fn logout(&self) {
        if let Err(e) = self.session.clear() {
            warn!("failed to clear session: {e}");
        }
    }

    /// The stored user profile, served without a network hop.
    pub fn current_user(&self) -> Option<Value> {
        self.session.profile()
    }

    // -----------------------------------------------------------------
    // Status & maintenance
    // -----------------------------------------------------------------

    pub fn status(&self) -> EngineStatus {
        let depths = self.queue.depths();
        EngineStatus {
            online: self.connectivity.is_online(),
            backend: self.transport.current_backend(),
            pending_mutations: depths.pending,
            in_flight_mutations: depths.in_flight,
            cache_entries: self.cache.len(),
            last_drain_at: self.sync.last_drain_at(),
            authenticated: self.session.is_authenticated(),
        }
    }

    /// Reachability and latency of the backend, measured now.
    pub async fn system_status(&self) -> SystemStatus {
        let start = Instant::now();
        let reachable = self.transport.probe().await;
        SystemStatus {
            reachable,
            backend: self.transport.current_backend(),
            latency_ms: reachable.then(|| start.elapsed().as_millis() as u64),
            error: (!reachable).then(|| "health probe failed".to_string()),
        }
    }

    /// Drop the response cache and every queued mutation (explicit user
    /// action from the troubleshooting screen).
    pub fn clear_local_data(&self) -> Result<(), StoreError> {
        self.cache.clear();
        self.queue.clear()?;
        info!("local data cleared");
        Ok(())
    }
}
