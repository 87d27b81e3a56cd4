//! Engine event bus.
//!
//! The engine reports progress to the embedding shell through a broadcast
//! channel instead of callbacks: connectivity transitions, queue activity,
//! drain results, and the one user-visible failure class: a mutation
//! abandoned after exhausting its retries. The UI decides how to render
//! these; the engine never blocks on a slow or absent receiver.

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the event channel. Receivers that lag past this many
/// undelivered events lose the oldest ones.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Connectivity state actually changed (edge-triggered, never repeated
    /// for an unchanged state).
    ConnectivityChanged { online: bool },

    /// A write was accepted into the offline queue.
    MutationQueued { id: String, resource: String },

    /// A queued mutation was confirmed by the backend and removed.
    MutationSynced { id: String, resource: String },

    /// A queued mutation exceeded its retry budget and was dropped.
    /// This mutation's effect is permanently lost and must be redone
    /// manually; emitted exactly once per mutation.
    MutationAbandoned {
        id: String,
        resource: String,
        error: String,
    },

    /// One drain pass finished.
    SyncCompleted { synced: usize, failed: usize },

    /// The live event feed reported a remote change to a resource family.
    RemoteChange { resource: String },
}

/// Shared sender handle. Cloned into every component that reports events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event. Send failures mean no receiver is subscribed, which
    /// is normal during startup and tests.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscriber_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::ConnectivityChanged { online: false });
        bus.emit(EngineEvent::MutationQueued {
            id: "m1".into(),
            resource: "/api/bills".into(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::ConnectivityChanged { online } => assert!(!online),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            EngineEvent::MutationQueued { id, .. } => assert_eq!(id, "m1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscriber_is_silent() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::SyncCompleted {
            synced: 0,
            failed: 0,
        });
    }
}
