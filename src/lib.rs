//! Sable Wallet companion backend
//!
//! Supervises (or attaches to) the sabled full-node daemon, keeps a live
//! view of chain and wallet state, orchestrates asynchronous transaction
//! construction, and runs the companion-device pairing channel. The
//! presentation layer drives everything through [`AppContext`] and observes
//! state through watch snapshots and the event bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

pub mod events;
pub mod logging;
pub mod node;
pub mod pairing;
pub mod tx;

use events::{AppEvent, EventBus};
use node::config::{ConfigError, NodeConfig};
use node::manager::NodeManager;
use node::poller::{ChainBackend, ConnectionHealth, PollerSettings, SyncPoller, SyncSnapshot};
use node::rpc::RpcClient;
use node::state::{NodeProcessState, NodeState, RestartReason, SharedNodeState};
use pairing::client::{PairingClient, PairingConfig};
use pairing::session::{PairingDescriptor, PairingState};
use pairing::RelayError;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tx::orchestrator::{OrchestratorSettings, TxBackend, TxJob, TxOrchestrator};
use tx::request::TransactionRequest;
use tx::scheduler::RecurringPayments;
use tx::{JobHandle, ValidationError};

/// How often the recurring-payment scheduler looks for due entries
const RECURRING_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Expand environment variables and ~ in paths
/// Windows: %VAR% style
/// Unix: ~ expands to HOME
pub fn expand_path(path: &str) -> String {
    let mut result = path.to_string();

    #[cfg(windows)]
    {
        while let Some(start) = result.find('%') {
            if let Some(end) = result[start + 1..].find('%') {
                let var_name = &result[start + 1..start + 1 + end];
                if let Ok(value) = std::env::var(var_name) {
                    result = format!("{}{}{}", &result[..start], value, &result[start + 2 + end..]);
                } else {
                    break;
                }
            } else {
                break;
            }
        }
    }

    #[cfg(not(windows))]
    {
        if result.starts_with("~/") {
            if let Some(home) = dirs::home_dir() {
                result = format!("{}{}", home.display(), &result[1..]);
            }
        } else if result == "~" {
            if let Some(home) = dirs::home_dir() {
                result = home.to_string_lossy().to_string();
            }
        }
    }

    result
}

/// Submission failures at the context surface
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("not connected to a daemon")]
    NotConnected,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Process-wide application context
///
/// Created once at startup and torn down at shutdown; every component hangs
/// off it instead of ambient globals. Commands come in as method calls,
/// state goes out as read-only snapshots and events.
pub struct AppContext {
    events: EventBus,
    node_state: SharedNodeState,
    manager: Arc<NodeManager>,

    rpc: Mutex<Option<Arc<RpcClient>>>,
    poller: Mutex<Option<SyncPoller>>,
    orchestrator: Mutex<Option<Arc<TxOrchestrator>>>,
    recurring: Mutex<Option<RecurringPayments>>,
    pairing: Mutex<Option<PairingClient>>,
}

impl AppContext {
    /// Build the context from the persisted configuration
    pub fn new() -> Arc<Self> {
        Self::with_config(NodeConfig::load())
    }

    /// Build the context from an explicit configuration
    pub fn with_config(config: NodeConfig) -> Arc<Self> {
        let events = EventBus::new();
        let node_state: SharedNodeState = Arc::new(NodeState::new(config));
        let manager = Arc::new(NodeManager::new(Arc::clone(&node_state), events.clone()));

        Arc::new(Self {
            events,
            node_state,
            manager,
            rpc: Mutex::new(None),
            poller: Mutex::new(None),
            orchestrator: Mutex::new(None),
            recurring: Mutex::new(None),
            pairing: Mutex::new(None),
        })
    }

    // ========================================================================
    // Node lifecycle commands
    // ========================================================================

    /// Bring the daemon up (or attach to it) and start the session services
    pub async fn connect_node(&self) -> anyhow::Result<()> {
        let client = self.manager.connect().await?;
        self.start_sessions(client);
        Ok(())
    }

    /// Stop the session services and the daemon
    pub async fn stop_node(&self) -> anyhow::Result<()> {
        self.shutdown_sessions().await;
        self.manager.stop().await?;
        Ok(())
    }

    /// Cycle the daemon to apply a restart-only flag, then resume sessions
    ///
    /// The RPC client is rebuilt afterwards; an embedded daemon mints a new
    /// auth cookie on every start.
    pub async fn restart_node_with(&self, reason: RestartReason) -> anyhow::Result<()> {
        self.shutdown_sessions().await;
        self.manager.restart_with(reason).await?;

        let config = self.node_state.get_config();
        self.start_sessions(RpcClient::from_config(&config));
        Ok(())
    }

    /// Wire the poller, orchestrator and scheduler to a live client
    fn start_sessions(&self, client: RpcClient) {
        let client = Arc::new(client);
        let config = self.node_state.get_config();

        *self.rpc.lock().unwrap() = Some(Arc::clone(&client));

        let poller = SyncPoller::start(
            Arc::clone(&client) as Arc<dyn ChainBackend>,
            PollerSettings::default(),
            self.events.clone(),
        );
        *self.poller.lock().unwrap() = Some(poller);

        let settings = OrchestratorSettings {
            allow_custom_fees: config.allow_custom_fees,
            ..Default::default()
        };
        let orchestrator = Arc::new(TxOrchestrator::start(
            client as Arc<dyn TxBackend>,
            settings,
            self.events.clone(),
        ));
        *self.recurring.lock().unwrap() = Some(RecurringPayments::start(
            Arc::clone(&orchestrator),
            RECURRING_CHECK_INTERVAL,
        ));
        *self.orchestrator.lock().unwrap() = Some(orchestrator);

        log::info!("Session services started");
    }

    /// Tear down the session services (poller, orchestrator, scheduler)
    async fn shutdown_sessions(&self) {
        let recurring = self.recurring.lock().unwrap().take();
        if let Some(recurring) = recurring {
            recurring.shutdown().await;
        }

        let poller = self.poller.lock().unwrap().take();
        if let Some(poller) = poller {
            poller.shutdown().await;
        }

        *self.orchestrator.lock().unwrap() = None;
        *self.rpc.lock().unwrap() = None;
    }

    /// Full teardown: pairing, sessions, daemon
    pub async fn shutdown(&self) {
        self.end_pairing().await;
        self.shutdown_sessions().await;

        if self.node_state.process_state().is_running() {
            if let Err(e) = self.manager.stop().await {
                log::error!("Daemon stop during shutdown failed: {}", e);
            }
        }

        log::info!("Application context shut down");
    }

    // ========================================================================
    // Read surfaces
    // ========================================================================

    /// Subscribe to the application event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    /// Current node process state
    pub fn node_state(&self) -> NodeProcessState {
        self.node_state.process_state()
    }

    /// Subscribe to node process state replacements
    pub fn subscribe_node_state(&self) -> watch::Receiver<NodeProcessState> {
        self.node_state.subscribe()
    }

    /// Current configuration
    pub fn config(&self) -> NodeConfig {
        self.node_state.get_config()
    }

    /// Replace and persist the configuration
    ///
    /// Endpoint changes take effect on the next connect; a live session is
    /// never re-pointed.
    pub fn set_config(&self, config: NodeConfig) -> Result<(), ConfigError> {
        self.node_state.set_config(config)
    }

    /// Most recent sync snapshot, if a session is running
    pub fn sync_snapshot(&self) -> Option<SyncSnapshot> {
        self.poller.lock().unwrap().as_ref().map(|p| p.snapshot())
    }

    /// Connection health as seen by the poller
    pub fn connection_health(&self) -> Option<ConnectionHealth> {
        self.poller.lock().unwrap().as_ref().map(|p| p.health())
    }

    /// Subscribe to sync snapshot replacements
    pub fn subscribe_sync(&self) -> Option<watch::Receiver<SyncSnapshot>> {
        self.poller
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.subscribe_snapshot())
    }

    /// Read-only copy of the transaction job list
    pub fn jobs(&self) -> Vec<TxJob> {
        self.orchestrator
            .lock()
            .unwrap()
            .as_ref()
            .map(|o| o.jobs())
            .unwrap_or_default()
    }

    /// Subscribe to job list replacements
    pub fn subscribe_jobs(&self) -> Option<watch::Receiver<Vec<TxJob>>> {
        self.orchestrator
            .lock()
            .unwrap()
            .as_ref()
            .map(|o| o.subscribe_jobs())
    }

    /// The live RPC client, for ad-hoc queries by the presentation layer
    pub fn rpc(&self) -> Option<Arc<RpcClient>> {
        self.rpc.lock().unwrap().clone()
    }

    // ========================================================================
    // Transaction commands
    // ========================================================================

    /// Validate and queue a transaction
    pub fn submit_transaction(&self, request: TransactionRequest) -> Result<JobHandle, SubmitError> {
        let orchestrator = self
            .orchestrator
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(SubmitError::NotConnected)?;
        Ok(orchestrator.submit(request)?)
    }

    /// Add a recurring payment schedule
    pub fn schedule_recurring(
        &self,
        label: &str,
        request: TransactionRequest,
        interval_secs: u64,
        first_due: Option<u64>,
    ) -> Result<u64, SubmitError> {
        let guard = self.recurring.lock().unwrap();
        let recurring = guard.as_ref().ok_or(SubmitError::NotConnected)?;
        Ok(recurring.add(label, request, interval_secs, first_due))
    }

    /// Remove a recurring payment schedule
    pub fn cancel_recurring(&self, id: u64) -> bool {
        self.recurring
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.remove(id))
            .unwrap_or(false)
    }

    // ========================================================================
    // Pairing commands
    // ========================================================================

    /// Start a pairing attempt; returns the descriptor to show the user
    ///
    /// Any existing session is torn down first; tokens are never shared
    /// between sessions.
    pub async fn begin_pairing(
        &self,
        config: PairingConfig,
    ) -> Result<PairingDescriptor, RelayError> {
        self.end_pairing().await;

        let (client, descriptor) = PairingClient::begin(config, self.events.clone()).await?;
        *self.pairing.lock().unwrap() = Some(client);
        Ok(descriptor)
    }

    /// Tear down the pairing channel
    pub async fn end_pairing(&self) {
        let client = self.pairing.lock().unwrap().take();
        if let Some(client) = client {
            client.disconnect().await;
        }
    }

    /// Forward a payload to the paired companion device
    pub fn send_to_companion(&self, payload: Value) -> Result<(), RelayError> {
        self.pairing
            .lock()
            .unwrap()
            .as_ref()
            .ok_or(RelayError::ChannelClosed)?
            .send(payload)
    }

    /// Current pairing channel state
    pub fn pairing_state(&self) -> PairingState {
        self.pairing
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.state())
            .unwrap_or(PairingState::Disconnected)
    }

    /// Read-only copy of the live pairing session, if any
    pub fn pairing_session(&self) -> Option<pairing::session::PairingSession> {
        self.pairing
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|p| p.session())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::session::PairingTransport;

    #[test]
    fn test_expand_path_passthrough() {
        assert_eq!(expand_path("/var/lib/sable"), "/var/lib/sable");
        assert_eq!(expand_path("relative/path"), "relative/path");
    }

    #[cfg(not(windows))]
    #[test]
    fn test_expand_path_tilde() {
        if let Some(home) = dirs::home_dir() {
            let expanded = expand_path("~/sable");
            assert_eq!(expanded, format!("{}/sable", home.display()));
            assert_eq!(expand_path("~"), home.to_string_lossy().to_string());
        }
    }

    #[tokio::test]
    async fn test_submit_before_connect_is_rejected() {
        let context = AppContext::with_config(NodeConfig::default());

        let request = TransactionRequest {
            from_address: "t1VJL2dPUyXK74WFPesmJh4dzCg45oAwHzK".to_string(),
            recipients: vec![],
            fee: Default::default(),
        };

        match context.submit_transaction(request) {
            Err(SubmitError::NotConnected) => {}
            other => panic!("expected NotConnected, got {:?}", other.map(|h| h.id)),
        }
        assert!(context.jobs().is_empty());
        assert!(context.sync_snapshot().is_none());
    }

    #[tokio::test]
    async fn test_initial_state_surfaces() {
        let context = AppContext::with_config(NodeConfig::default());
        assert_eq!(context.node_state(), NodeProcessState::NotStarted);
        assert_eq!(context.pairing_state(), PairingState::Disconnected);
        assert!(context.connection_health().is_none());
        assert!(context.rpc().is_none());
    }

    #[tokio::test]
    async fn test_pairing_lifecycle_through_context() {
        let context = AppContext::with_config(NodeConfig::default());

        let config = PairingConfig {
            transport: PairingTransport::Direct,
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        };

        let descriptor = context.begin_pairing(config).await.unwrap();
        assert_eq!(descriptor.transport, PairingTransport::Direct);
        assert_eq!(context.pairing_state(), PairingState::Connecting);

        // Cancelling before any companion arrives returns to Disconnected
        context.end_pairing().await;
        assert_eq!(context.pairing_state(), PairingState::Disconnected);
        assert!(context.send_to_companion(serde_json::json!("x")).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_without_sessions() {
        let context = AppContext::with_config(NodeConfig::default());
        context.shutdown().await;
        context.shutdown().await;
        assert_eq!(context.node_state(), NodeProcessState::NotStarted);
    }
}
