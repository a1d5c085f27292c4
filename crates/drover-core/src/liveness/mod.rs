//! Liveness monitor: detects workers with stale heartbeats and recovers
//! their orphaned tasks.
//!
//! A task on a stale worker is requeued with `retry_count + 1` while the
//! retry budget lasts, and terminates as `failed` once it is spent. The
//! pass is idempotent: the stale scan excludes workers already `offline`,
//! so re-running it without intervening worker activity changes nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use drover_db::models::{Task, TaskStatus, Worker, WorkerStatus};

use crate::ledger::ResourceLedger;
use crate::metrics::MetricsSink;
use crate::scheduler::SchedulerConfig;
use crate::store::{StoreResult, TaskStore};

/// Terminal error recorded when a task's retry budget is spent on worker loss.
pub const ORPHAN_EXHAUSTED_ERROR: &str = "max retries exhausted after worker loss";

pub struct LivenessMonitor {
    store: Arc<dyn TaskStore>,
    ledger: Arc<ResourceLedger>,
    metrics: Arc<dyn MetricsSink>,
    config: SchedulerConfig,
}

impl LivenessMonitor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<ResourceLedger>,
        metrics: Arc<dyn MetricsSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            metrics,
            config,
        }
    }

    /// Run one liveness pass. Returns the number of workers marked offline.
    ///
    /// Failures on individual workers are logged and skipped; the next pass
    /// retries them.
    pub async fn run_once(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = now - self.config.stale_after();
        let stale = self.store.list_stale_workers(cutoff).await?;

        let mut expired = 0;
        for worker in stale {
            match self.expire_worker(&worker, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        worker_id = %worker.id,
                        error = %e,
                        "failed to expire stale worker, will retry next pass"
                    );
                }
            }
        }
        Ok(expired)
    }

    /// Apply the orphan policy to one stale worker, then take it offline.
    /// Returns whether the worker transitioned to `offline`.
    async fn expire_worker(&self, worker: &Worker, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut orphan: Option<Task> = None;
        if let Some(task_id) = worker.current_task_id {
            match self.store.get_task(task_id).await {
                Ok(task) => {
                    if !task.status.is_terminal() && task.worker_id == Some(worker.id) {
                        self.recover_orphan(&task, now).await?;
                        orphan = Some(task);
                    }
                }
                Err(e) if e.is_not_found() => {
                    warn!(
                        worker_id = %worker.id,
                        task_id = %task_id,
                        "stale worker holds a missing task"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let mut offline = worker.clone();
        offline.status = WorkerStatus::Offline;
        offline.current_task_id = None;
        let wrote = self.store.update_worker(&offline, worker.status).await?;
        if wrote {
            self.metrics.worker_offline();
            info!(
                worker_id = %worker.id,
                last_heartbeat = %worker.last_heartbeat,
                "worker marked offline"
            );
            // The heartbeat handler may have revived the worker between the
            // scan and the write; release only when the offline write won.
            if let Some(task) = &orphan {
                self.ledger.release(worker.id, task);
            }
        }
        Ok(wrote)
    }

    /// Requeue an orphaned task while the retry budget lasts; terminate it
    /// as `failed` once the budget is spent.
    async fn recover_orphan(&self, task: &Task, now: DateTime<Utc>) -> StoreResult<()> {
        let mut recovered = task.clone();
        if task.retry_count < task.max_retries {
            recovered.status = TaskStatus::Pending;
            recovered.worker_id = None;
            recovered.retry_count += 1;
            recovered.started_at = None;
            recovered.error = None;
            if self.store.update_task(&recovered, task.status).await? {
                self.metrics.task_requeued();
                info!(
                    task_id = %task.id,
                    retry_count = recovered.retry_count,
                    max_retries = task.max_retries,
                    "orphaned task requeued"
                );
            }
        } else {
            recovered.status = TaskStatus::Failed;
            recovered.error = Some(ORPHAN_EXHAUSTED_ERROR.to_owned());
            recovered.completed_at = Some(now);
            if self.store.update_task(&recovered, task.status).await? {
                self.metrics.task_failed("worker_loss");
                warn!(
                    task_id = %task.id,
                    retry_count = task.retry_count,
                    "orphaned task failed, retry budget exhausted"
                );
            }
        }
        Ok(())
    }
}
