//! Sync and state polling
//!
//! A single recurring loop refreshes chain and wallet summaries over RPC and
//! republishes them as one immutable snapshot. Ticks never overlap: a tick
//! that misses its slot is skipped, not queued, so a slow daemon cannot build
//! an unbounded backlog.

use super::rpc::{Balances, NodeInfo, RpcClient, RpcError};
use crate::events::{AppEvent, EventBus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Chain and wallet summary surface the poller consumes
///
/// Seam between the polling loop and the RPC client, so the loop's state
/// machine can be driven without a daemon.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    async fn node_info(&self) -> Result<NodeInfo, RpcError>;
    async fn balances(&self) -> Result<Balances, RpcError>;
}

#[async_trait]
impl ChainBackend for RpcClient {
    async fn node_info(&self) -> Result<NodeInfo, RpcError> {
        self.get_info().await
    }

    async fn balances(&self) -> Result<Balances, RpcError> {
        self.z_get_total_balance().await
    }
}

/// Where the chain currently stands relative to the network
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Connecting,
    Syncing,
    Synced,
}

/// One consistent view of chain and wallet state
///
/// Produced whole on every successful poll and published by replacement;
/// consumers never observe fields from two different ticks.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub block_height: u64,
    pub longest_chain: u64,
    pub peer_count: u32,
    pub sync_phase: SyncPhase,
    pub notarized_height: u64,
    pub notarized_lag: u64,
    pub version: i64,
    pub protocol_version: i64,
    pub balances: Balances,
    /// Unix timestamp of the poll that produced this snapshot
    pub last_updated: u64,
}

/// Health of the RPC connection as seen by the polling loop
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionHealth {
    #[default]
    Healthy,
    /// One or more recent polls failed; previous snapshot still served
    Degraded { consecutive_failures: u32 },
    /// Consecutive failures crossed the threshold; the daemon is down, not slow
    NoConnection,
}

/// Poller cadence and escalation settings
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Tick interval; also the hard timeout for a single tick
    pub interval: Duration,
    /// Consecutive failures before escalating to NoConnection
    pub failure_threshold: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(4),
            failure_threshold: 3,
        }
    }
}

/// Recurring chain/wallet state poller
pub struct SyncPoller {
    snapshot_rx: watch::Receiver<SyncSnapshot>,
    health_rx: watch::Receiver<ConnectionHealth>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncPoller {
    /// Start the polling loop against a backend
    pub fn start(
        backend: Arc<dyn ChainBackend>,
        settings: PollerSettings,
        events: EventBus,
    ) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot::default());
        let (health_tx, health_rx) = watch::channel(ConnectionHealth::Healthy);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(async move {
            let mut ticker = time::interval(settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut failures: u32 = 0;

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // Hard per-tick timeout equal to the interval
                        let polled = time::timeout(settings.interval, poll_once(backend.as_ref()))
                            .await
                            .unwrap_or(Err(RpcError::Timeout));

                        match polled {
                            Ok((info, balances)) => {
                                if failures > 0 {
                                    log::info!("RPC connection restored after {} failed polls", failures);
                                    events.emit(AppEvent::ConnectionRestored);
                                }
                                failures = 0;
                                publish_health(&health_tx, ConnectionHealth::Healthy);

                                let snapshot = build_snapshot(info, balances);
                                snapshot_tx.send_replace(snapshot);
                                events.emit(AppEvent::SyncUpdated);
                            }
                            Err(e) => {
                                let was_down = failures >= settings.failure_threshold;

                                // Rejected credentials are not a blip; there is
                                // no point sitting in Degraded waiting them out
                                if matches!(e, RpcError::AuthFailure) {
                                    failures = failures.max(settings.failure_threshold);
                                } else {
                                    failures += 1;
                                }
                                log::warn!("Poll failed ({} consecutive): {}", failures, e);

                                if failures >= settings.failure_threshold {
                                    if !was_down {
                                        publish_health(&health_tx, ConnectionHealth::NoConnection);
                                        events.emit(AppEvent::ConnectionLost);
                                    }
                                } else {
                                    publish_health(
                                        &health_tx,
                                        ConnectionHealth::Degraded { consecutive_failures: failures },
                                    );
                                    events.emit(AppEvent::ConnectionDegraded {
                                        consecutive_failures: failures,
                                    });
                                }
                                // Previous snapshot is retained as-is
                            }
                        }
                    }
                }
            }
        });

        Self {
            snapshot_rx,
            health_rx,
            shutdown: shutdown_tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Current snapshot (the most recent successful poll)
    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Current connection health
    pub fn health(&self) -> ConnectionHealth {
        self.health_rx.borrow().clone()
    }

    /// Subscribe to snapshot replacements
    pub fn subscribe_snapshot(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Subscribe to connection health changes
    pub fn subscribe_health(&self) -> watch::Receiver<ConnectionHealth> {
        self.health_rx.clone()
    }

    /// Stop the loop and wait for the worker to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Gather both summaries; either failure fails the whole tick
async fn poll_once(backend: &dyn ChainBackend) -> Result<(NodeInfo, Balances), RpcError> {
    let info = backend.node_info().await?;
    let balances = backend.balances().await?;
    Ok((info, balances))
}

/// Merge the tick's results into one snapshot
fn build_snapshot(info: NodeInfo, balances: Balances) -> SyncSnapshot {
    let sync_phase = if info.connections == 0 {
        SyncPhase::Connecting
    } else if info.longestchain > info.blocks {
        SyncPhase::Syncing
    } else {
        SyncPhase::Synced
    };

    SyncSnapshot {
        block_height: info.blocks,
        longest_chain: info.longestchain,
        peer_count: info.connections,
        sync_phase,
        notarized_height: info.notarized,
        notarized_lag: info.blocks.saturating_sub(info.notarized),
        version: info.version,
        protocol_version: info.protocolversion,
        balances,
        last_updated: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    }
}

/// Publish health only when it actually changed
fn publish_health(tx: &watch::Sender<ConnectionHealth>, health: ConnectionHealth) {
    tx.send_if_modified(|current| {
        if *current != health {
            *current = health;
            true
        } else {
            false
        }
    });
}
