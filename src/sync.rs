//! Background sync engine.
//!
//! Drains the persistent mutation queue whenever connectivity returns and
//! on a periodic timer while online. One drain pass takes a snapshot of
//! due mutations in enqueue order and replays each through the same
//! transport the dispatcher uses. Failures back off exponentially;
//! a mutation that exhausts its retry budget is abandoned and the loss is
//! surfaced as a user-visible notification, never silently.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::events::{EngineEvent, EventBus};
use crate::queue::{MutationState, QueueStore};
use crate::transport::{OutboundRequest, Transport};

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DrainStats {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// A pass was already running; nothing was done.
    pub skipped: bool,
}

pub struct SyncEngine {
    config: Arc<EngineConfig>,
    queue: Arc<QueueStore>,
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    connectivity: Arc<ConnectivityMonitor>,
    events: EventBus,
    /// Single-flight guard: only one drain pass runs at a time. A trigger
    /// arriving mid-pass is dropped; the next trigger catches the rest.
    in_progress: AtomicBool,
    last_drain: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    pub fn new(
        config: Arc<EngineConfig>,
        queue: Arc<QueueStore>,
        transport: Arc<dyn Transport>,
        cache: Arc<ResponseCache>,
        connectivity: Arc<ConnectivityMonitor>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            queue,
            transport,
            cache,
            connectivity,
            events,
            in_progress: AtomicBool::new(false),
            last_drain: Mutex::new(None),
        }
    }

    /// Timestamp of the last completed drain pass, for status surfaces.
    pub fn last_drain_at(&self) -> Option<DateTime<Utc>> {
        self.last_drain.lock().ok().and_then(|guard| *guard)
    }

    /// Run one drain pass over the current queue snapshot.
    ///
    /// Mutations enqueued while the pass runs are not part of the
    /// snapshot; they wait for the next trigger. Within the pass, a
    /// retryable failure blocks the rest of that resource family so
    /// same-record mutations are never replayed out of order.
    pub async fn drain(&self) -> DrainStats {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            debug!("drain already in progress, skipping trigger");
            return DrainStats {
                skipped: true,
                ..DrainStats::default()
            };
        }

        let stats = self.drain_snapshot().await;
        self.in_progress.store(false, Ordering::SeqCst);

        if let Ok(mut guard) = self.last_drain.lock() {
            *guard = Some(Utc::now());
        }
        self.events.emit(EngineEvent::SyncCompleted {
            synced: stats.synced,
            failed: stats.failed,
        });
        if stats.attempted > 0 {
            info!(
                synced = stats.synced,
                failed = stats.failed,
                abandoned = stats.abandoned,
                "drain pass complete"
            );
        }
        stats
    }

    async fn drain_snapshot(&self) -> DrainStats {
        let snapshot = match self.queue.peek_due() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("cannot read sync queue: {e}");
                return DrainStats::default();
            }
        };

        let mut stats = DrainStats::default();
        let mut blocked_families: HashSet<String> = HashSet::new();

        for mutation in snapshot {
            // Connectivity lost mid-pass: leave the rest pending.
            if !self.connectivity.is_online() {
                debug!("connectivity lost mid-drain, deferring remaining mutations");
                break;
            }

            let family = self.config.family_for(&mutation.resource);
            if blocked_families.contains(&family) {
                continue;
            }

            stats.attempted += 1;
            if let Err(e) = self.queue.mark_in_flight(&mutation.id) {
                warn!(id = %mutation.id, "cannot mark mutation in-flight: {e}");
                continue;
            }

            let mut outbound =
                OutboundRequest::new(mutation.verb.http_method(), mutation.resource.clone());
            outbound.body = mutation.payload.clone();

            match self.transport.send(&outbound).await {
                Ok(_) => {
                    if let Err(e) = self.queue.remove(&mutation.id) {
                        warn!(id = %mutation.id, "cannot remove synced mutation: {e}");
                    }
                    // The server state changed; any cached read of this
                    // family is now stale.
                    self.cache.invalidate_family(&family);
                    self.events.emit(EngineEvent::MutationSynced {
                        id: mutation.id.clone(),
                        resource: mutation.resource.clone(),
                    });
                    stats.synced += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    let error = e.to_string();
                    let attempts = mutation.attempts + 1;

                    if attempts >= self.config.max_retries {
                        warn!(
                            id = %mutation.id,
                            resource = %mutation.resource,
                            attempts,
                            "mutation abandoned after max retries: {error}"
                        );
                        let _ = self.queue.mark_state(
                            &mutation.id,
                            MutationState::Failed,
                            Some(error.as_str()),
                        );
                        if let Err(remove_err) = self.queue.remove(&mutation.id) {
                            warn!(id = %mutation.id, "cannot remove abandoned mutation: {remove_err}");
                        }
                        self.events.emit(EngineEvent::MutationAbandoned {
                            id: mutation.id.clone(),
                            resource: mutation.resource.clone(),
                            error,
                        });
                        stats.abandoned += 1;
                    } else {
                        let next_retry_at = Utc::now()
                            + chrono::Duration::from_std(self.backoff_delay(attempts))
                                .unwrap_or_else(|_| chrono::Duration::seconds(300));
                        if let Err(mark_err) =
                            self.queue.mark_retry(&mutation.id, &error, next_retry_at)
                        {
                            warn!(id = %mutation.id, "cannot schedule retry: {mark_err}");
                        }
                        // Later mutations on the same family must not jump
                        // ahead of this one.
                        blocked_families.insert(family);
                    }
                }
            }
        }

        stats
    }

    /// `base * 2^attempts`, capped.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(16));
        self.config
            .retry_base_delay
            .saturating_mul(factor)
            .min(self.config.retry_max_delay)
    }

    /// Spawn the background loop: drain on every transition to online and
    /// on a periodic tick while online with work queued.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut online_rx = engine.connectivity.watch();
        tokio::spawn(async move {
            info!(
                interval_secs = engine.config.sync_interval.as_secs(),
                "sync loop started"
            );
            let mut ticker = tokio::time::interval(engine.config.sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("sync loop stopped");
                        break;
                    }
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online_rx.borrow_and_update() {
                            info!("connectivity restored, draining queue");
                            engine.drain().await;
                        }
                    }
                    _ = ticker.tick() => {
                        if engine.connectivity.is_online() && engine.queue.depths().pending > 0 {
                            engine.drain().await;
                        }
                    }
                }
            }
        })
    }
}
