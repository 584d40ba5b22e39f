//! Asynchronous transaction orchestration
//!
//! Validated requests enter a strict FIFO queue drained by a single worker,
//! so at most one transaction is under construction at a time; the daemon
//! serializes shielded proof generation and parallel submissions only queue
//! up inside it. Progress is pulled from the daemon's operation-status RPC
//! and republished per job.

use super::request::{TransactionRequest, ValidatedRequest, ValidationError, COIN};
use crate::events::{AppEvent, EventBus};
use crate::node::rpc::{OperationStatus, RpcClient, RpcError};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

/// Daemon surface for submitting and watching send operations
#[async_trait]
pub trait TxBackend: Send + Sync {
    /// Start an asynchronous send; returns the daemon's operation id
    async fn submit_send(&self, request: &ValidatedRequest) -> Result<String, RpcError>;

    /// Fetch the current status of an operation
    async fn operation_status(&self, opid: &str) -> Result<OperationStatus, RpcError>;
}

#[async_trait]
impl TxBackend for RpcClient {
    async fn submit_send(&self, request: &ValidatedRequest) -> Result<String, RpcError> {
        let outputs: Vec<Value> = request
            .recipients
            .iter()
            .map(|r| {
                let mut output = json!({
                    "address": r.address,
                    "amount": zats_to_coin(r.zats),
                });
                if let Some(ref memo) = r.memo {
                    output["memo"] = json!(hex::encode(memo.as_bytes()));
                }
                output
            })
            .collect();

        let mut params = vec![
            json!(request.from_address),
            Value::Array(outputs),
            json!(1), // minconf
        ];
        if let Some(fee) = request.fee_zats {
            params.push(json!(zats_to_coin(fee)));
        }

        self.z_send_many(params).await
    }

    async fn operation_status(&self, opid: &str) -> Result<OperationStatus, RpcError> {
        self.z_get_operation_status(opid).await
    }
}

/// Zatoshis to the coin-denominated number the daemon expects
fn zats_to_coin(zats: u64) -> f64 {
    zats as f64 / COIN as f64
}

/// Job identifier, unique per orchestrator instance
pub type JobId = u64;

/// Lifecycle of one transaction job
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobStatus {
    Queued,
    Building {
        /// Percent complete, monotonically non-decreasing
        progress: u8,
    },
    Broadcasting,
    Completed {
        txid: String,
    },
    Failed {
        /// Daemon-supplied cause, preserved for display
        message: String,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }
}

/// A job as exposed to observers (read-only copy)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxJob {
    pub id: JobId,
    pub from_address: String,
    pub recipient_count: usize,
    pub total_zats: u64,
    pub status: JobStatus,
    pub submitted_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

/// Worker cadence and the progress-watch transient budget
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Operation-status poll interval; shorter than the sync poller's tick
    pub status_interval: Duration,
    /// Timeout for a single status call
    pub status_timeout: Duration,
    /// Consecutive status failures tolerated before giving up on a job
    pub max_transient_failures: u32,
    /// Config opt-in for FeePolicy::Custom
    pub allow_custom_fees: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(1),
            status_timeout: Duration::from_secs(5),
            max_transient_failures: 20,
            allow_custom_fees: false,
        }
    }
}

/// Handle returned by submit; tracks one job's status
#[derive(Debug)]
pub struct JobHandle {
    pub id: JobId,
    rx: watch::Receiver<JobStatus>,
}

impl JobHandle {
    /// Current status of the job
    pub fn status(&self) -> JobStatus {
        self.rx.borrow().clone()
    }

    /// Subscribe to status replacements
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.rx.clone()
    }

    /// Wait until the job completes or fails
    ///
    /// There is no cancellation once a job leaves the queue; a caller may
    /// only stop waiting.
    pub async fn wait_terminal(mut self) -> JobStatus {
        loop {
            let current = self.rx.borrow().clone();
            if current.is_terminal() {
                return current;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

/// Queue entry handed to the worker
struct QueuedJob {
    id: JobId,
    request: ValidatedRequest,
    status_tx: watch::Sender<JobStatus>,
}

/// Shared job list, published by replacement on every change
struct JobTable {
    list: Mutex<Vec<TxJob>>,
    watch_tx: watch::Sender<Vec<TxJob>>,
}

impl JobTable {
    fn new() -> (Arc<Self>, watch::Receiver<Vec<TxJob>>) {
        let (watch_tx, watch_rx) = watch::channel(Vec::new());
        (
            Arc::new(Self {
                list: Mutex::new(Vec::new()),
                watch_tx,
            }),
            watch_rx,
        )
    }

    fn push(&self, job: TxJob) {
        let mut list = self.list.lock().unwrap();
        list.push(job);
        self.watch_tx.send_replace(list.clone());
    }

    fn update<F>(&self, id: JobId, f: F)
    where
        F: FnOnce(&mut TxJob),
    {
        let mut list = self.list.lock().unwrap();
        if let Some(job) = list.iter_mut().find(|j| j.id == id) {
            f(job);
        }
        self.watch_tx.send_replace(list.clone());
    }

    fn snapshot(&self) -> Vec<TxJob> {
        self.list.lock().unwrap().clone()
    }
}

/// FIFO transaction queue with a single build worker
pub struct TxOrchestrator {
    queue_tx: mpsc::UnboundedSender<QueuedJob>,
    table: Arc<JobTable>,
    jobs_rx: watch::Receiver<Vec<TxJob>>,
    next_id: AtomicU64,
    allow_custom_fees: bool,
    events: EventBus,
}

impl TxOrchestrator {
    /// Start the orchestrator and its worker task
    ///
    /// The worker drains jobs in submission order and exits once the
    /// orchestrator is dropped and the queue is empty.
    pub fn start(
        backend: Arc<dyn TxBackend>,
        settings: OrchestratorSettings,
        events: EventBus,
    ) -> Self {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<QueuedJob>();
        let (table, jobs_rx) = JobTable::new();

        let worker_table = Arc::clone(&table);
        let worker_events = events.clone();
        let worker_settings = settings.clone();
        tokio::spawn(async move {
            while let Some(job) = queue_rx.recv().await {
                run_job(
                    backend.as_ref(),
                    job,
                    &worker_table,
                    &worker_events,
                    &worker_settings,
                )
                .await;
            }
            log::debug!("Transaction worker finished");
        });

        Self {
            queue_tx,
            table,
            jobs_rx,
            next_id: AtomicU64::new(0),
            allow_custom_fees: settings.allow_custom_fees,
            events,
        }
    }

    /// Validate a request and append it to the queue
    ///
    /// Rejections happen here, synchronously, before any job exists.
    pub fn submit(&self, request: TransactionRequest) -> Result<JobHandle, ValidationError> {
        let validated = request.validate(self.allow_custom_fees)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (status_tx, status_rx) = watch::channel(JobStatus::Queued);

        self.table.push(TxJob {
            id,
            from_address: validated.from_address.clone(),
            recipient_count: validated.recipients.len(),
            total_zats: validated.total_zats(),
            status: JobStatus::Queued,
            submitted_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            operation_id: None,
        });
        self.events.emit(AppEvent::JobUpdated {
            id,
            status: JobStatus::Queued,
        });

        log::info!(
            "Transaction job {} queued ({} recipients, {} zats)",
            id,
            validated.recipients.len(),
            validated.total_zats()
        );

        if self
            .queue_tx
            .send(QueuedJob {
                id,
                request: validated,
                status_tx: status_tx.clone(),
            })
            .is_err()
        {
            let status = JobStatus::Failed {
                message: "transaction worker is not running".to_string(),
            };
            status_tx.send_replace(status.clone());
            self.table.update(id, |job| job.status = status);
        }

        Ok(JobHandle { id, rx: status_rx })
    }

    /// Read-only copy of the current job list
    pub fn jobs(&self) -> Vec<TxJob> {
        self.table.snapshot()
    }

    /// Subscribe to job list replacements
    pub fn subscribe_jobs(&self) -> watch::Receiver<Vec<TxJob>> {
        self.jobs_rx.clone()
    }
}

/// Publish one status everywhere it is observed
fn set_status(
    table: &JobTable,
    status_tx: &watch::Sender<JobStatus>,
    events: &EventBus,
    id: JobId,
    status: JobStatus,
) {
    status_tx.send_replace(status.clone());
    table.update(id, |job| job.status = status.clone());
    events.emit(AppEvent::JobUpdated { id, status });
}

/// Drive one job from submission to its terminal state
async fn run_job(
    backend: &dyn TxBackend,
    job: QueuedJob,
    table: &JobTable,
    events: &EventBus,
    settings: &OrchestratorSettings,
) {
    let QueuedJob {
        id,
        request,
        status_tx,
    } = job;

    set_status(table, &status_tx, events, id, JobStatus::Building { progress: 0 });

    let opid = match backend.submit_send(&request).await {
        Ok(opid) => opid,
        Err(e) => {
            log::error!("Job {} submission failed: {}", id, e);
            set_status(
                table,
                &status_tx,
                events,
                id,
                JobStatus::Failed {
                    message: e.to_string(),
                },
            );
            return;
        }
    };

    log::info!("Job {} building as operation {}", id, opid);
    table.update(id, |j| j.operation_id = Some(opid.clone()));

    let mut progress: u8 = 0;
    let mut transient_failures: u32 = 0;

    loop {
        tokio::time::sleep(settings.status_interval).await;

        let polled = tokio::time::timeout(
            settings.status_timeout,
            backend.operation_status(&opid),
        )
        .await
        .unwrap_or(Err(RpcError::Timeout));

        let status = match polled {
            Ok(status) => {
                transient_failures = 0;
                status
            }
            Err(e) => {
                // A hung or failed status call is not a job failure; the
                // operation keeps building inside the daemon regardless
                transient_failures += 1;
                log::warn!(
                    "Job {} status poll failed ({}/{}): {}",
                    id,
                    transient_failures,
                    settings.max_transient_failures,
                    e
                );
                if transient_failures > settings.max_transient_failures {
                    set_status(
                        table,
                        &status_tx,
                        events,
                        id,
                        JobStatus::Failed {
                            message: format!(
                                "lost contact with the daemon while watching operation {}: {}",
                                opid, e
                            ),
                        },
                    );
                    return;
                }
                continue;
            }
        };

        match status.status.as_str() {
            "queued" => {}
            "executing" => {
                if let Some(fraction) = status.progress {
                    let percent = (fraction.clamp(0.0, 1.0) * 100.0) as u8;
                    if percent > progress {
                        progress = percent;
                        set_status(
                            table,
                            &status_tx,
                            events,
                            id,
                            JobStatus::Building { progress },
                        );
                    }
                }
            }
            "success" => {
                set_status(table, &status_tx, events, id, JobStatus::Broadcasting);

                match status.result.map(|r| r.txid) {
                    Some(txid) if !txid.is_empty() => {
                        log::info!("Job {} completed: txid {}", id, txid);
                        set_status(
                            table,
                            &status_tx,
                            events,
                            id,
                            JobStatus::Completed { txid },
                        );
                    }
                    _ => {
                        set_status(
                            table,
                            &status_tx,
                            events,
                            id,
                            JobStatus::Failed {
                                message: format!(
                                    "operation {} succeeded without a transaction id",
                                    opid
                                ),
                            },
                        );
                    }
                }
                return;
            }
            "failed" => {
                let message = status
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "operation failed".to_string());
                log::error!("Job {} failed: {}", id, message);
                set_status(table, &status_tx, events, id, JobStatus::Failed { message });
                return;
            }
            other => {
                log::warn!("Job {}: unknown operation status '{}'", id, other);
            }
        }
    }
}
