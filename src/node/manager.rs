//! Node process supervision
//!
//! Decides between attaching to an external daemon and launching an embedded
//! one, owns the child process handle, and applies restart-only flags by
//! fully stopping and relaunching the daemon.

use super::config::{NodeConfig, NodeMode};
use super::rpc::{self, RpcClient, RpcError};
use super::state::{NodeProcessState, RestartReason, SharedNodeState};
use crate::events::{AppEvent, EventBus};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Process name to look for
#[cfg(target_os = "windows")]
const DAEMON_PROCESS_NAME: &str = "sabled.exe";

#[cfg(not(target_os = "windows"))]
const DAEMON_PROCESS_NAME: &str = "sabled";

/// How long a stopping daemon gets before it is killed
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Supervision failures
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("sabled not found at {0}; install the node binary first")]
    BinaryMissing(String),
    #[error("failed to start sabled: {0}")]
    Spawn(String),
    #[error("sabled did not become ready within {0} seconds")]
    StartupTimeout(u64),
    #[error("no daemon reachable at {0} and embedded launch is disabled")]
    NoDaemon(String),
    #[error("restart flags can only be applied to an embedded daemon")]
    ExternallyManaged,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Config(#[from] super::config::ConfigError),
}

/// Manages the sabled daemon process
pub struct NodeManager {
    /// Child process handle (if we spawned it)
    process: Mutex<Option<Child>>,

    /// Set before a deliberate shutdown so the exit watcher can tell an
    /// expected exit from a crash
    expected_exit: AtomicBool,

    state: SharedNodeState,
    events: EventBus,

    /// Readiness gate for embedded launches
    ready_timeout_secs: u64,
}

impl NodeManager {
    pub fn new(state: SharedNodeState, events: EventBus) -> Self {
        Self {
            process: Mutex::new(None),
            expected_exit: AtomicBool::new(false),
            state,
            events,
            ready_timeout_secs: 90,
        }
    }

    /// Override the readiness timeout (startup gating)
    pub fn with_ready_timeout(mut self, secs: u64) -> Self {
        self.ready_timeout_secs = secs;
        self
    }

    /// Check if a sabled process is running by looking at the process table
    pub fn is_daemon_running() -> bool {
        Self::find_daemon_pid().is_some()
    }

    /// Find the PID of a running sabled process
    pub fn find_daemon_pid() -> Option<u32> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());

        for (pid, process) in sys.processes() {
            let name = process.name().to_string_lossy().to_lowercase();
            if name == DAEMON_PROCESS_NAME.to_lowercase() {
                return Some(pid.as_u32());
            }
        }
        None
    }

    /// Bring the daemon to a reachable state and hand back a live client
    ///
    /// Decision rule: if a daemon already answers at the configured endpoint,
    /// attach without launching. Otherwise launch embedded when permitted, or
    /// fail fast when it is not.
    pub async fn connect(self: &Arc<Self>) -> Result<RpcClient, ProcessError> {
        let config = self.state.get_config();

        let probe = RpcClient::from_config(&config);
        match probe.get_info().await {
            Ok(info) => {
                let pid = Self::find_daemon_pid();
                log::info!(
                    "Attached to running daemon at {} (blocks={}, pid={:?})",
                    probe.endpoint().url(),
                    info.blocks,
                    pid
                );
                self.state
                    .set_process_state(NodeProcessState::Running { pid });
                self.events.emit(AppEvent::NodeStarted { pid });
                return Ok(probe);
            }
            Err(RpcError::AuthFailure) => {
                // Never retried silently; credentials must change first
                let message = RpcError::AuthFailure.to_string();
                self.state
                    .set_process_state(NodeProcessState::Failed { message });
                return Err(ProcessError::Rpc(RpcError::AuthFailure));
            }
            Err(e) => {
                log::info!("No daemon at {}: {}", probe.endpoint().url(), e);
            }
        }

        if config.mode == NodeMode::External {
            let endpoint = probe.endpoint().url();
            self.state.set_process_state(NodeProcessState::Failed {
                message: format!("external daemon unreachable at {}", endpoint),
            });
            return Err(ProcessError::NoDaemon(endpoint));
        }

        self.start_embedded().await?;
        let config = self.state.get_config();
        Ok(RpcClient::from_config(&config))
    }

    /// Start the embedded daemon and wait until RPC answers
    pub async fn start_embedded(self: &Arc<Self>) -> Result<u32, ProcessError> {
        log::info!("Starting embedded daemon...");

        let config = self.state.get_config();

        let daemon_path = NodeConfig::daemon_path();
        if !daemon_path.exists() {
            let err = ProcessError::BinaryMissing(daemon_path.display().to_string());
            self.state.set_process_state(NodeProcessState::Failed {
                message: err.to_string(),
            });
            return Err(err);
        }

        self.state.set_process_state(NodeProcessState::Starting);
        self.events.emit(AppEvent::NodeStarting);

        let data_dir = config.get_data_directory();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            ProcessError::Spawn(format!("failed to create data directory: {}", e))
        })?;

        config.write_daemon_conf()?;

        let mut cmd = Command::new(&daemon_path);
        cmd.arg(format!("-datadir={}", data_dir.display()));

        match config.network {
            super::config::Network::Testnet => {
                cmd.arg("-testnet");
            }
            super::config::Network::Regtest => {
                cmd.arg("-regtest");
            }
            super::config::Network::Mainnet => {}
        }

        // One-shot flags; cleared below once the daemon is up
        if config.rescan {
            cmd.arg("-rescan");
        }
        if config.reindex {
            cmd.arg("-reindex");
        }

        if !config.custom_args.is_empty() {
            for arg in config.custom_args.split_whitespace() {
                cmd.arg(arg);
            }
        }

        // Redirect stdio to null to prevent blocking on full pipes
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.stdin(Stdio::null());

        log::info!("Starting sabled: {:?}", cmd);
        let child = cmd
            .spawn()
            .map_err(|e| ProcessError::Spawn(e.to_string()))?;

        let pid = child.id().unwrap_or_default();
        log::info!("sabled started with PID {}", pid);

        self.expected_exit.store(false, Ordering::SeqCst);
        *self.process.lock().await = Some(child);

        if let Err(e) = rpc::wait_for_node_ready(&config, self.ready_timeout_secs).await {
            log::error!("Daemon never became ready: {}", e);
            let err = ProcessError::StartupTimeout(self.ready_timeout_secs);
            self.state.set_process_state(NodeProcessState::Failed {
                message: err.to_string(),
            });
            self.events.emit(AppEvent::NodeFailed {
                message: err.to_string(),
            });
            return Err(err);
        }

        // Rescan/reindex only apply to the launch that requested them
        if config.rescan || config.reindex {
            self.state.update_config(|c| {
                c.rescan = false;
                c.reindex = false;
            });
            if let Err(e) = self.state.get_config().save() {
                log::error!("Failed to persist cleared one-shot flags: {}", e);
            }
        }

        self.state
            .set_process_state(NodeProcessState::Running { pid: Some(pid) });
        self.events.emit(AppEvent::NodeStarted { pid: Some(pid) });

        Self::spawn_exit_watcher(Arc::clone(self));

        Ok(pid)
    }

    /// Watch the child process and surface unexpected exits
    fn spawn_exit_watcher(manager: Arc<NodeManager>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;

                let mut guard = manager.process.lock().await;
                let child = match guard.as_mut() {
                    Some(child) => child,
                    None => break, // stop() took ownership
                };

                match child.try_wait() {
                    Ok(Some(status)) => {
                        *guard = None;
                        drop(guard);

                        if manager.expected_exit.load(Ordering::SeqCst) {
                            log::info!("sabled exited ({})", status);
                        } else {
                            let message = format!("sabled exited unexpectedly ({})", status);
                            log::error!("{}", message);
                            manager.state.set_process_state(NodeProcessState::Failed {
                                message: message.clone(),
                            });
                            manager.events.emit(AppEvent::NodeFailed { message });
                        }
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("Failed to poll sabled status: {}", e);
                        break;
                    }
                }
            }
        });
    }

    /// Stop the daemon session
    ///
    /// Embedded daemons get an RPC stop and a bounded grace period before
    /// being killed. External daemons are never touched; the session just
    /// detaches.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        log::info!("Stopping node session...");
        self.events.emit(AppEvent::NodeStopping);
        self.expected_exit.store(true, Ordering::SeqCst);

        let config = self.state.get_config();

        if config.mode == NodeMode::Embedded {
            if let Err(e) = rpc::stop_node_gracefully(&config).await {
                log::warn!("RPC stop failed: {}", e);
            }

            let taken = self.process.lock().await.take();
            if let Some(mut child) = taken {
                let deadline = std::time::Instant::now() + STOP_GRACE;
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            log::info!("sabled exited ({})", status);
                            break;
                        }
                        Ok(None) if std::time::Instant::now() >= deadline => {
                            log::warn!("sabled did not stop within grace period, killing");
                            if let Err(e) = child.kill().await {
                                log::error!("Failed to kill sabled: {}", e);
                            }
                            break;
                        }
                        Ok(None) => tokio::time::sleep(Duration::from_millis(500)).await,
                        Err(e) => {
                            log::warn!("Failed to poll sabled during stop: {}", e);
                            break;
                        }
                    }
                }
            }
        } else {
            log::info!("External daemon left running; detaching only");
            *self.process.lock().await = None;
        }

        self.state.set_process_state(NodeProcessState::Stopped);
        self.events.emit(AppEvent::NodeStopped);

        Ok(())
    }

    /// Apply a restart-only flag by cycling the daemon
    ///
    /// One-shot reasons (rescan, reindex) arm their flag here; toggle
    /// reasons expect the configuration to already carry the new value.
    /// Externally managed daemons only get the `NeedsRestart` state; this
    /// supervisor owns nothing it did not launch.
    pub async fn restart_with(self: &Arc<Self>, reason: RestartReason) -> Result<u32, ProcessError> {
        log::info!("Restart requested: {:?}", reason);

        self.state
            .set_process_state(NodeProcessState::NeedsRestart { reason });
        self.events.emit(AppEvent::NodeNeedsRestart { reason });

        let config = self.state.get_config();
        if config.mode == NodeMode::External {
            log::warn!(
                "Daemon is externally managed; user must {}",
                reason.instruction()
            );
            return Err(ProcessError::ExternallyManaged);
        }

        match reason {
            RestartReason::Rescan => self.state.update_config(|c| c.rescan = true),
            RestartReason::Reindex => self.state.update_config(|c| c.reindex = true),
            // Toggles were already written to the config by the caller
            RestartReason::ConsolidationToggle
            | RestartReason::DeleteOldTx
            | RestartReason::ShieldedIndexToggle => {}
        }

        self.stop().await?;

        // Give the old process a moment to release its ports and locks
        tokio::time::sleep(Duration::from_millis(500)).await;

        self.start_embedded().await
    }

    /// Check if we hold the child process handle (we started it)
    pub async fn has_process_handle(&self) -> bool {
        self.process.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::state::NodeState;

    fn manager_with(config: NodeConfig) -> (Arc<NodeManager>, SharedNodeState) {
        let state = Arc::new(NodeState::new(config));
        let events = EventBus::new();
        let manager = Arc::new(NodeManager::new(Arc::clone(&state), events).with_ready_timeout(1));
        (manager, state)
    }

    fn unreachable_config(mode: NodeMode) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.mode = mode;
        // A port nothing listens on
        config.rpc_port = 1;
        config.rpc_host = "127.0.0.1".to_string();
        config
    }

    #[tokio::test]
    async fn test_external_unreachable_fails_fast() {
        let (manager, state) = manager_with(unreachable_config(NodeMode::External));

        match manager.connect().await {
            Err(ProcessError::NoDaemon(endpoint)) => {
                assert!(endpoint.contains("127.0.0.1"));
            }
            other => panic!("expected NoDaemon, got {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            state.process_state(),
            NodeProcessState::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_embedded_without_binary_is_binary_missing() {
        let (manager, state) = manager_with(unreachable_config(NodeMode::Embedded));

        if NodeConfig::daemon_path().exists() {
            // Machine actually has a daemon installed; nothing to assert here
            return;
        }

        match manager.connect().await {
            Err(ProcessError::BinaryMissing(path)) => {
                assert!(path.contains("sabled"));
            }
            other => panic!("expected BinaryMissing, got {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            state.process_state(),
            NodeProcessState::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_restart_external_only_surfaces_needs_restart() {
        let (manager, state) = manager_with(unreachable_config(NodeMode::External));

        match manager.restart_with(RestartReason::Rescan).await {
            Err(ProcessError::ExternallyManaged) => {}
            other => panic!("expected ExternallyManaged, got {:?}", other.map(|_| ())),
        }
        assert_eq!(
            state.process_state(),
            NodeProcessState::NeedsRestart {
                reason: RestartReason::Rescan
            }
        );
    }

    #[tokio::test]
    async fn test_restart_passes_through_stopped_before_relaunch() {
        let (manager, state) = manager_with(unreachable_config(NodeMode::Embedded));
        if NodeConfig::daemon_path().exists() {
            return;
        }

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let collector = Arc::clone(&seen);
        let mut rx = state.subscribe();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let s = rx.borrow().clone();
                let terminal = matches!(s, NodeProcessState::Failed { .. });
                collector.lock().unwrap().push(s);
                if terminal {
                    break;
                }
            }
        });

        let _ = manager.restart_with(RestartReason::Reindex).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

        let seen = seen.lock().unwrap();
        let pos = |p: fn(&NodeProcessState) -> bool| seen.iter().position(p);

        let needs = pos(|s| matches!(s, NodeProcessState::NeedsRestart { .. }))
            .expect("NeedsRestart observed");
        let stopped =
            pos(|s| matches!(s, NodeProcessState::Stopped)).expect("Stopped observed");
        let terminal =
            pos(|s| matches!(s, NodeProcessState::Failed { .. })).expect("terminal observed");

        // Never an in-place flag change: the old instance fully stops first
        assert!(needs < stopped);
        assert!(stopped < terminal);
        assert!(!seen.iter().any(|s| s.is_running()));
    }

    #[tokio::test]
    async fn test_restart_reindex_arms_one_shot_flag() {
        let (manager, state) = manager_with(unreachable_config(NodeMode::Embedded));
        if NodeConfig::daemon_path().exists() {
            return;
        }

        let _ = manager.restart_with(RestartReason::Reindex).await;
        assert!(state.get_config().reindex);
    }
}
