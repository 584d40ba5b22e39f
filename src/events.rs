//! Application event bus
//!
//! Replaces UI-toolkit event emission with a broadcast channel the
//! presentation layer subscribes to. Events are notifications only;
//! authoritative state lives in the owning component's watch channels.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::node::state::RestartReason;
use crate::pairing::session::PairingState;
use crate::tx::orchestrator::JobStatus;

/// Events published to the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AppEvent {
    /// Daemon process is being launched
    NodeStarting,
    /// Daemon reachable and ready
    NodeStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// Daemon is shutting down
    NodeStopping,
    /// Daemon fully stopped
    NodeStopped,
    /// A flag change requires a full daemon restart
    NodeNeedsRestart { reason: RestartReason },
    /// Daemon process exited unexpectedly or failed to start
    NodeFailed { message: String },

    /// A poll failed; previous snapshot retained
    ConnectionDegraded { consecutive_failures: u32 },
    /// Consecutive failures crossed the threshold
    ConnectionLost,
    /// A poll succeeded after one or more failures
    ConnectionRestored,
    /// A fresh sync snapshot was published
    SyncUpdated,

    /// A transaction job changed status
    JobUpdated { id: u64, status: JobStatus },

    /// Pairing channel state replaced
    PairingStateChanged { state: PairingState },
    /// A data payload arrived from the companion device
    CompanionMessage,
}

/// Broadcast bus for [`AppEvent`]
///
/// Cheap to clone; emission never blocks and never fails when nobody is
/// listening (matching fire-and-forget UI event emission).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish an event; dropped if no subscriber is attached
    pub fn emit(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(AppEvent::NodeStopped);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(AppEvent::ConnectionLost);

        match rx.recv().await.unwrap() {
            AppEvent::ConnectionLost => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
