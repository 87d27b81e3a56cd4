//! Connectivity monitor.
//!
//! Single source of truth for "can we reach the backend right now".
//! Platform link-state only proves the local link, so a platform "online"
//! hint is optimistic until the next health probe confirms it; a failing
//! probe forces the state offline regardless of what the platform says.
//! Transitions are edge-triggered: subscribers hear about changes, never
//! repeats of an unchanged state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{EngineEvent, EventBus};
use crate::transport::Transport;

pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    events: EventBus,
}

impl ConnectivityMonitor {
    /// `initial_online` is seeded from the platform's reachability signal
    /// (or optimistically `true` when the embedder has none); the first
    /// probe refines it.
    pub fn new(initial_online: bool, events: EventBus) -> Self {
        let (state, _) = watch::channel(initial_online);
        Self { state, events }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Receiver that resolves whenever the state transitions. The sync
    /// engine drains on every transition to online.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Entry point for the embedding shell's platform network events.
    /// An offline hint takes effect immediately; an online hint is taken
    /// at face value until the next probe disagrees.
    pub fn report_platform_hint(&self, online: bool) {
        debug!(online, "platform connectivity hint");
        self.set_state(online);
    }

    /// Record a probe result. Probe failures never propagate to callers;
    /// they only move the state.
    pub fn report_probe(&self, reachable: bool) {
        self.set_state(reachable);
    }

    fn set_state(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "connectivity changed");
            self.events.emit(EngineEvent::ConnectivityChanged { online });
        }
    }

    /// Spawn the periodic reachability probe. The first tick fires
    /// immediately, so a wrong seed value is corrected at startup.
    pub fn start_probe_loop(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("probe loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reachable = transport.probe().await;
                        monitor.report_probe(reachable);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::TransportError;
    use crate::transport::OutboundRequest;

    /// Probe results are served from a script; past the end, the last
    /// entry repeats.
    struct ScriptedProber {
        script: Vec<bool>,
        cursor: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedProber {
        async fn send(&self, _request: &OutboundRequest) -> Result<Value, TransportError> {
            Err(TransportError::NoBackend)
        }

        async fn probe(&self) -> bool {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            *self.script.get(i).or(self.script.last()).unwrap_or(&false)
        }
    }

    #[test]
    fn test_transitions_are_edge_triggered() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let monitor = ConnectivityMonitor::new(true, bus);

        monitor.report_probe(true); // no change, no event
        monitor.report_probe(false);
        monitor.report_probe(false); // repeat, no event
        monitor.report_probe(true);

        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::ConnectivityChanged { online } = event {
                transitions.push(online);
            }
        }
        assert_eq!(transitions, vec![false, true]);
        assert!(monitor.is_online());
    }

    #[test]
    fn test_platform_hint_moves_state() {
        let monitor = ConnectivityMonitor::new(true, EventBus::new());
        monitor.report_platform_hint(false);
        assert!(!monitor.is_online());
        monitor.report_platform_hint(true);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_probe_loop_recovers_after_single_failure() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let monitor = Arc::new(ConnectivityMonitor::new(false, bus));
        let prober = Arc::new(ScriptedProber {
            script: vec![false, true, true],
            cursor: AtomicUsize::new(0),
        });

        let cancel = CancellationToken::new();
        let handle = monitor.start_probe_loop(
            prober,
            Duration::from_millis(20),
            cancel.clone(),
        );

        // First probe fails (already offline, no transition), second
        // succeeds: exactly one offline->online transition.
        tokio::time::sleep(Duration::from_millis(90)).await;
        cancel.cancel();
        let _ = handle.await;

        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::ConnectivityChanged { online } = event {
                transitions.push(online);
            }
        }
        assert_eq!(transitions, vec![true]);
        assert!(monitor.is_online());
    }
}
