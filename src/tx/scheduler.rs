//! Recurring payment scheduling
//!
//! A thin layer that mints one-shot transaction requests at computed due
//! times and feeds them through the normal submit path. It owns no
//! transaction-building logic; a due payment is just another queued job.

use super::orchestrator::TxOrchestrator;
use super::request::TransactionRequest;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// One recurring payment definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringPayment {
    pub id: u64,
    /// User-facing label, e.g. "VPS hosting"
    pub label: String,
    pub request: TransactionRequest,
    /// Seconds between payments
    pub interval_secs: u64,
    /// Unix timestamp of the next submission
    pub next_due: u64,
}

/// Advance a due time past `now`, stepping by whole intervals
///
/// A schedule that was overdue for several periods still submits once; the
/// missed periods are skipped rather than burst-submitted.
pub fn advance_due(next_due: u64, interval_secs: u64, now: u64) -> u64 {
    let mut due = next_due;
    while due <= now {
        due += interval_secs.max(1);
    }
    due
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Runtime list of recurring payments with a tick loop
pub struct RecurringPayments {
    schedules: Arc<Mutex<Vec<RecurringPayment>>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RecurringPayments {
    /// Start the scheduler loop
    pub fn start(orchestrator: Arc<TxOrchestrator>, check_interval: Duration) -> Self {
        let schedules: Arc<Mutex<Vec<RecurringPayment>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let worker_schedules = Arc::clone(&schedules);
        let worker = tokio::spawn(async move {
            let mut ticker = time::interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let now = unix_now();
                        let due: Vec<(u64, String, TransactionRequest)> = {
                            let mut list = worker_schedules.lock().unwrap();
                            let mut due = Vec::new();
                            for schedule in list.iter_mut() {
                                if schedule.next_due <= now {
                                    due.push((
                                        schedule.id,
                                        schedule.label.clone(),
                                        schedule.request.clone(),
                                    ));
                                    schedule.next_due =
                                        advance_due(schedule.next_due, schedule.interval_secs, now);
                                }
                            }
                            due
                        };

                        for (id, label, request) in due {
                            match orchestrator.submit(request) {
                                Ok(handle) => log::info!(
                                    "Recurring payment {} ('{}') submitted as job {}",
                                    id,
                                    label,
                                    handle.id
                                ),
                                Err(e) => log::error!(
                                    "Recurring payment {} ('{}') rejected: {}",
                                    id,
                                    label,
                                    e
                                ),
                            }
                        }
                    }
                }
            }
        });

        Self {
            schedules,
            next_id: AtomicU64::new(0),
            shutdown: shutdown_tx,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Add a schedule; `first_due` defaults to one interval from now
    pub fn add(
        &self,
        label: &str,
        request: TransactionRequest,
        interval_secs: u64,
        first_due: Option<u64>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let next_due = first_due.unwrap_or_else(|| unix_now() + interval_secs);

        self.schedules.lock().unwrap().push(RecurringPayment {
            id,
            label: label.to_string(),
            request,
            interval_secs,
            next_due,
        });

        log::info!("Recurring payment {} ('{}') added", id, label);
        id
    }

    /// Remove a schedule; returns whether it existed
    pub fn remove(&self, id: u64) -> bool {
        let mut list = self.schedules.lock().unwrap();
        let before = list.len();
        list.retain(|s| s.id != id);
        before != list.len()
    }

    /// Read-only copy of the schedule list
    pub fn list(&self) -> Vec<RecurringPayment> {
        self.schedules.lock().unwrap().clone()
    }

    /// Stop the scheduler loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::node::rpc::{OperationResult, OperationStatus, RpcError};
    use crate::tx::orchestrator::{JobStatus, OrchestratorSettings, TxBackend};
    use crate::tx::request::{FeePolicy, Recipient, ValidatedRequest};
    use async_trait::async_trait;

    const T_ADDR: &str = "t1VJL2dPUyXK74WFPesmJh4dzCg45oAwHzK";
    const T_ADDR_2: &str = "t1Wg5Yab9WDX8Y1bXjhyvHSKjzdPZnFQ8rX";

    struct InstantDaemon;

    #[async_trait]
    impl TxBackend for InstantDaemon {
        async fn submit_send(&self, _request: &ValidatedRequest) -> Result<String, RpcError> {
            Ok("opid-r".to_string())
        }

        async fn operation_status(&self, opid: &str) -> Result<OperationStatus, RpcError> {
            Ok(OperationStatus {
                id: opid.to_string(),
                status: "success".to_string(),
                progress: Some(1.0),
                result: Some(OperationResult {
                    txid: "txid-r".to_string(),
                }),
                error: None,
            })
        }
    }

    fn orchestrator() -> Arc<TxOrchestrator> {
        let settings = OrchestratorSettings {
            status_interval: Duration::from_millis(5),
            ..Default::default()
        };
        Arc::new(TxOrchestrator::start(
            Arc::new(InstantDaemon),
            settings,
            EventBus::new(),
        ))
    }

    fn request() -> TransactionRequest {
        TransactionRequest {
            from_address: T_ADDR.to_string(),
            recipients: vec![Recipient {
                address: T_ADDR_2.to_string(),
                amount: "0.25".to_string(),
                memo: None,
            }],
            fee: FeePolicy::Default,
        }
    }

    #[test]
    fn test_advance_due_skips_missed_periods() {
        assert_eq!(advance_due(100, 50, 100), 150);
        assert_eq!(advance_due(100, 50, 99), 100);
        // Overdue by many periods lands on the next future slot
        assert_eq!(advance_due(100, 50, 320), 350);
        // Zero interval must not loop forever
        assert_eq!(advance_due(100, 0, 100), 101);
    }

    #[tokio::test]
    async fn test_add_remove_list() {
        let scheduler = RecurringPayments::start(orchestrator(), Duration::from_secs(3600));

        let id = scheduler.add("rent", request(), 86_400, None);
        assert_eq!(scheduler.list().len(), 1);
        assert_eq!(scheduler.list()[0].label, "rent");

        assert!(scheduler.remove(id));
        assert!(!scheduler.remove(id));
        assert!(scheduler.list().is_empty());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_due_payment_flows_through_submit() {
        let orch = orchestrator();
        let scheduler = RecurringPayments::start(Arc::clone(&orch), Duration::from_millis(10));

        // Due immediately
        scheduler.add("vps", request(), 3600, Some(0));

        // Wait for the job to appear and finish
        let mut jobs_rx = orch.subscribe_jobs();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let jobs = jobs_rx.borrow().clone();
                if jobs
                    .iter()
                    .any(|j| matches!(j.status, JobStatus::Completed { .. }))
                {
                    break;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("recurring payment never produced a completed job");
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), jobs_rx.changed()).await;
        }

        // The schedule advanced to a future slot and did not burst
        let entry = &scheduler.list()[0];
        assert!(entry.next_due > unix_now() - 1);
        assert_eq!(orch.jobs().len(), 1);

        scheduler.shutdown().await;
    }
}
