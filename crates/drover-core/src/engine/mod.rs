//! Assignment engine: one pass pairs pending tasks with available workers.
//!
//! Tasks are considered in dispatch order (priority descending, then age),
//! workers in packing order (spare GPU, then spare memory). Admission is
//! first-fit through the resource ledger; a task that fits no worker is
//! held in `pending` for the next pass -- there is no fallback that
//! violates resource fit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use drover_db::models::{Task, TaskStatus, Worker, WorkerStatus};

use crate::ledger::ResourceLedger;
use crate::metrics::MetricsSink;
use crate::scheduler::SchedulerConfig;
use crate::store::{StoreResult, TaskStore};

/// Outcome of one attempted (task, worker) pairing.
enum AssignOutcome {
    /// Both writes landed; the worker is consumed for this pass.
    Assigned,
    /// The task write lost its guard (cancelled or claimed concurrently);
    /// the worker remains a candidate.
    TaskLost,
    /// The worker write lost its guard; its state is unknown, so it is
    /// dropped from the pass. The task was compensated back to `pending`.
    WorkerLost,
}

pub struct AssignmentEngine {
    store: Arc<dyn TaskStore>,
    ledger: Arc<ResourceLedger>,
    metrics: Arc<dyn MetricsSink>,
    config: SchedulerConfig,
}

impl AssignmentEngine {
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

    /// Run one assignment pass. Returns the number of tasks assigned.
    pub async fn run_once(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let pending = self.store.list_pending_tasks(self.config.max_tasks).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let cutoff = now - self.config.stale_after();
        let mut workers = self.store.list_available_workers(cutoff).await?;

        let mut assigned = 0;
        let mut held: HashMap<String, i64> = HashMap::new();

        for task in pending {
            let Some(idx) = workers.iter().position(|w| self.ledger.can_fit(w, &task)) else {
                *held.entry(task.model_name.clone()).or_default() += 1;
                continue;
            };

            match self.assign(&task, &workers[idx]).await {
                Ok(AssignOutcome::Assigned) => {
                    workers.remove(idx);
                    assigned += 1;
                }
                Ok(AssignOutcome::TaskLost) => {}
                Ok(AssignOutcome::WorkerLost) => {
                    workers.remove(idx);
                }
                Err(e) => {
                    // Store hiccup mid-pair: leave the rest of the pass to
                    // the next tick.
                    error!(task_id = %task.id, error = %e, "assignment pair failed, ending pass");
                    break;
                }
            }
        }

        for (model, depth) in &held {
            self.metrics.queue_depth(model, *depth);
        }

        Ok(assigned)
    }

    /// The assignment write sequence: task first, then worker, then ledger.
    ///
    /// If the worker write fails, the task is compensated back to
    /// `pending`; if the compensation also fails, the orphan path will
    /// reconcile it within the stale-heartbeat window.
    async fn assign(&self, task: &Task, worker: &Worker) -> StoreResult<AssignOutcome> {
        let mut claimed = task.clone();
        claimed.status = TaskStatus::Scheduled;
        claimed.worker_id = Some(worker.id);
        if !self.store.update_task(&claimed, TaskStatus::Pending).await? {
            debug!(task_id = %task.id, "task left pending before assignment, skipping");
            return Ok(AssignOutcome::TaskLost);
        }

        let mut busy = worker.clone();
        busy.status = WorkerStatus::Busy;
        busy.current_task_id = Some(task.id);
        if !self
            .store
            .update_worker(&busy, WorkerStatus::Available)
            .await?
        {
            self.compensate(task, worker.id).await;
            return Ok(AssignOutcome::WorkerLost);
        }

        self.ledger.commit(worker.id, task);
        self.metrics.task_assigned(&task.model_name);
        info!(
            task_id = %task.id,
            worker_id = %worker.id,
            priority = %task.priority,
            "task assigned"
        );
        Ok(AssignOutcome::Assigned)
    }

    /// Rewrite a half-assigned task back to `pending`.
    async fn compensate(&self, task: &Task, worker_id: Uuid) {
        let mut restored = task.clone();
        restored.status = TaskStatus::Pending;
        restored.worker_id = None;
        match self
            .store
            .update_task(&restored, TaskStatus::Scheduled)
            .await
        {
            Ok(true) => {
                debug!(task_id = %task.id, worker_id = %worker_id, "assignment compensated");
            }
            Ok(false) => {
                error!(
                    task_id = %task.id,
                    worker_id = %worker_id,
                    "compensation lost its guard; liveness monitor will reconcile"
                );
            }
            Err(e) => {
                error!(
                    task_id = %task.id,
                    worker_id = %worker_id,
                    error = %e,
                    "compensation write failed; liveness monitor will reconcile"
                );
            }
        }
    }
}
