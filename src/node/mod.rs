//! Node connectivity module for Sable Wallet
//!
//! Brings the daemon to a reachable state and keeps a live view of it.
//!
//! ## Features
//!
//! - **Embedded Mode**: Write sable.conf and run sabled automatically
//! - **External Mode**: Attach to a user-managed daemon via RPC
//! - **Process Management**: Start, stop and restart-with-flags cycles
//! - **Polling**: Recurring chain/wallet snapshots with degradation tracking
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    node module                           │
//! ├─────────────────────────────────────────────────────────┤
//! │  config.rs   - Configuration types and persistence       │
//! │  state.rs    - Process state machine, shared state       │
//! │  manager.rs  - Process lifecycle (attach/start/stop)     │
//! │  rpc.rs      - JSON-RPC client and error taxonomy        │
//! │  poller.rs   - Sync & state polling loop                 │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod manager;
pub mod poller;
pub mod rpc;
pub mod state;

// Re-export key types for convenience
pub use config::{NodeConfig, NodeMode};
pub use manager::NodeManager;
pub use poller::{SyncPoller, SyncSnapshot};
pub use rpc::RpcClient;
pub use state::{create_node_state, NodeProcessState, NodeState, SharedNodeState};
