//! Shared state for node supervision
//!
//! The process state machine is owned exclusively by the supervisor and
//! published by full-value replacement; observers hold watch receivers and
//! never see partial updates.

use super::config::NodeConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Why a daemon restart is required
///
/// Each reason maps to a flag or conf line the daemon only honors at
/// startup; none of them can be applied to a live process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RestartReason {
    Rescan,
    Reindex,
    ConsolidationToggle,
    DeleteOldTx,
    ShieldedIndexToggle,
}

impl RestartReason {
    /// The user-facing instruction for this restart
    pub fn instruction(&self) -> &'static str {
        match self {
            RestartReason::Rescan => "restart sabled with -rescan to rebuild wallet state",
            RestartReason::Reindex => "restart sabled with -reindex to rebuild the block index",
            RestartReason::ConsolidationToggle => {
                "restart sabled to apply the consolidation setting"
            }
            RestartReason::DeleteOldTx => "restart sabled to apply the deletetx setting",
            RestartReason::ShieldedIndexToggle => {
                "restart sabled to apply the zindex setting"
            }
        }
    }
}

/// Lifecycle of the supervised daemon process
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeProcessState {
    #[default]
    NotStarted,
    Starting,
    Running {
        /// Pid of the embedded child; None when attached to an external daemon
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// Terminal for the current process instance; a fresh start with
    /// corrected flags is the only way forward
    NeedsRestart {
        reason: RestartReason,
    },
    Stopped,
    Failed {
        message: String,
    },
}

impl NodeProcessState {
    /// True while the daemon is expected to answer RPC
    pub fn is_running(&self) -> bool {
        matches!(self, NodeProcessState::Running { .. })
    }
}

/// Internal state for node supervision
#[derive(Debug)]
pub struct NodeState {
    /// Current process state, published by replacement
    process: watch::Sender<NodeProcessState>,

    /// Node configuration
    config: Mutex<NodeConfig>,

    /// Start time of the embedded daemon (for uptime calculation)
    start_time: Mutex<Option<std::time::Instant>>,
}

impl NodeState {
    pub fn new(config: NodeConfig) -> Self {
        let (process, _) = watch::channel(NodeProcessState::NotStarted);
        Self {
            process,
            config: Mutex::new(config),
            start_time: Mutex::new(None),
        }
    }

    /// Get the current process state
    pub fn process_state(&self) -> NodeProcessState {
        self.process.borrow().clone()
    }

    /// Replace the process state
    pub fn set_process_state(&self, state: NodeProcessState) {
        log::debug!("Node process state -> {:?}", state);

        if let NodeProcessState::Running { .. } = state {
            *self.start_time.lock().unwrap() = Some(std::time::Instant::now());
        } else {
            *self.start_time.lock().unwrap() = None;
        }

        self.process.send_replace(state);
    }

    /// Subscribe to process state replacements
    pub fn subscribe(&self) -> watch::Receiver<NodeProcessState> {
        self.process.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> NodeConfig {
        self.config.lock().unwrap().clone()
    }

    /// Update and persist the configuration
    pub fn set_config(&self, config: NodeConfig) -> Result<(), super::config::ConfigError> {
        config.save()?;
        *self.config.lock().unwrap() = config;
        Ok(())
    }

    /// Update specific fields of the configuration in memory
    pub fn update_config<F>(&self, f: F)
    where
        F: FnOnce(&mut NodeConfig),
    {
        let mut config = self.config.lock().unwrap();
        f(&mut config);
    }

    /// Uptime of the embedded daemon in seconds, if running
    pub fn uptime(&self) -> Option<u64> {
        self.start_time
            .lock()
            .unwrap()
            .map(|start| start.elapsed().as_secs())
    }
}

/// Type alias for shared node state
pub type SharedNodeState = Arc<NodeState>;

/// Create a new shared node state from persisted configuration
pub fn create_node_state() -> SharedNodeState {
    Arc::new(NodeState::new(NodeConfig::load()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = NodeState::new(NodeConfig::default());
        assert_eq!(state.process_state(), NodeProcessState::NotStarted);
        assert_eq!(state.uptime(), None);
    }

    #[test]
    fn test_running_tracks_uptime() {
        let state = NodeState::new(NodeConfig::default());
        state.set_process_state(NodeProcessState::Running { pid: Some(42) });
        assert!(state.process_state().is_running());
        assert!(state.uptime().is_some());

        state.set_process_state(NodeProcessState::Stopped);
        assert_eq!(state.uptime(), None);
    }

    #[tokio::test]
    async fn test_subscribers_observe_replacement() {
        let state = NodeState::new(NodeConfig::default());
        let mut rx = state.subscribe();

        state.set_process_state(NodeProcessState::Starting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NodeProcessState::Starting);

        state.set_process_state(NodeProcessState::NeedsRestart {
            reason: RestartReason::Rescan,
        });
        rx.changed().await.unwrap();
        assert_eq!(
            *rx.borrow(),
            NodeProcessState::NeedsRestart {
                reason: RestartReason::Rescan
            }
        );
    }

    #[test]
    fn test_restart_instructions_are_distinct() {
        let reasons = [
            RestartReason::Rescan,
            RestartReason::Reindex,
            RestartReason::ConsolidationToggle,
            RestartReason::DeleteOldTx,
            RestartReason::ShieldedIndexToggle,
        ];
        for (i, a) in reasons.iter().enumerate() {
            for b in reasons.iter().skip(i + 1) {
                assert_ne!(a.instruction(), b.instruction());
            }
        }
    }
}
