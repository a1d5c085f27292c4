//! Timeout sweeper: fails running tasks that have exceeded their
//! wall-clock budget and frees their workers.
//!
//! The effective budget is the smaller of the task's own
//! `timeout_seconds` and the configured ceiling. Timeout is a hard cancel
//! at the scheduler: the worker may still be running the task, and its
//! eventual terminal report is dropped by the ingress idempotence rule.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use drover_db::models::{Task, TaskStatus, WorkerStatus};

use crate::ledger::ResourceLedger;
use crate::metrics::MetricsSink;
use crate::scheduler::SchedulerConfig;
use crate::store::{StoreResult, TaskStore};

/// Terminal error recorded when a task exceeds its wall-clock budget.
pub const TIMEOUT_ERROR: &str = "task timed out";

/// Running tasks are scanned in batches of this size.
const SWEEP_BATCH: i64 = 100;

pub struct TimeoutSweeper {
    store: Arc<dyn TaskStore>,
    ledger: Arc<ResourceLedger>,
    metrics: Arc<dyn MetricsSink>,
    config: SchedulerConfig,
}

impl TimeoutSweeper {
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

    /// Run one sweep over all running tasks. Returns the number timed out.
    pub async fn run_once(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let ceiling = self.config.task_timeout.as_secs() as i64;
        let mut offset = 0;
        let mut expired = 0;

        loop {
            let batch = self.store.list_running_tasks(SWEEP_BATCH, offset).await?;
            let fetched = batch.len();
            let mut kept = 0_i64;

            for task in batch {
                if !self.is_expired(&task, now, ceiling) {
                    kept += 1;
                    continue;
                }
                match self.expire_task(&task, now).await {
                    Ok(true) => expired += 1,
                    Ok(false) => kept += 1,
                    Err(e) => {
                        kept += 1;
                        warn!(
                            task_id = %task.id,
                            error = %e,
                            "failed to expire timed-out task, will retry next sweep"
                        );
                    }
                }
            }

            if fetched < SWEEP_BATCH as usize {
                break;
            }
            // Expired tasks left the running set, shifting the page window;
            // advance only past the rows that are still running.
            offset += kept;
        }

        Ok(expired)
    }

    fn is_expired(&self, task: &Task, now: DateTime<Utc>, ceiling_secs: i64) -> bool {
        let Some(started_at) = task.started_at else {
            return false;
        };
        let budget = task.timeout_seconds.min(ceiling_secs);
        now - started_at > Duration::seconds(budget)
    }

    /// Fail one timed-out task and free its worker. Returns whether the
    /// terminal write won (a concurrent completion report may beat it).
    async fn expire_task(&self, task: &Task, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut failed = task.clone();
        failed.status = TaskStatus::Failed;
        failed.error = Some(TIMEOUT_ERROR.to_owned());
        failed.completed_at = Some(now);
        if !self.store.update_task(&failed, TaskStatus::Running).await? {
            return Ok(false);
        }
        self.metrics.task_failed("timeout");
        info!(
            task_id = %task.id,
            timeout_seconds = task.timeout_seconds,
            "task timed out"
        );

        if let Some(worker_id) = task.worker_id {
            match self.store.get_worker(worker_id).await {
                Ok(worker) => {
                    if worker.current_task_id == Some(task.id) {
                        let mut freed = worker.clone();
                        freed.status = WorkerStatus::Available;
                        freed.current_task_id = None;
                        if !self.store.update_worker(&freed, worker.status).await? {
                            warn!(
                                worker_id = %worker_id,
                                task_id = %task.id,
                                "worker changed under timeout sweep, leaving to liveness monitor"
                            );
                        }
                    }
                    self.ledger.release(worker_id, task);
                }
                Err(e) if e.is_not_found() => {
                    warn!(
                        worker_id = %worker_id,
                        task_id = %task.id,
                        "timed-out task references a missing worker"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(true)
    }
}
