//! Worker registration, heartbeat, and the combined worker+task status
//! report.
//!
//! The report handler carries the system's one idempotence rule: a
//! terminal report against a task that is already terminal is dropped and
//! acknowledged, which is what reconciles the timeout race.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use drover_db::models::{TaskStatus, Worker, WorkerStatus, hex_bytes_opt};

use crate::ledger::ResourceLedger;
use crate::metrics::MetricsSink;
use crate::store::{StoreError, TaskStore};

/// A worker registration, as received from a node.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterWorker {
    /// Client-supplied identity. A node that restarts re-registers under
    /// the same id and refreshes its record; omitted means a fresh id.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub available_cpu: f64,
    pub available_memory: i64,
    pub available_gpu: f64,
}

/// Error from worker registration.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("invalid worker: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validate and upsert a worker. Fresh or re-registered, the worker comes
/// back `available` with a current heartbeat.
pub async fn register_worker(
    store: &dyn TaskStore,
    req: RegisterWorker,
    now: DateTime<Utc>,
) -> Result<Worker, RegisterError> {
    if req.name.trim().is_empty() {
        return Err(RegisterError::Invalid("name must not be empty".into()));
    }
    if req.available_cpu < 0.0 {
        return Err(RegisterError::Invalid(format!(
            "available_cpu must not be negative, got {}",
            req.available_cpu
        )));
    }
    if req.available_memory < 0 {
        return Err(RegisterError::Invalid(format!(
            "available_memory must not be negative, got {}",
            req.available_memory
        )));
    }
    if !(0.0..=1.0).contains(&req.available_gpu) {
        return Err(RegisterError::Invalid(format!(
            "available_gpu must be within 0..1, got {}",
            req.available_gpu
        )));
    }

    let worker = Worker {
        id: req.id.unwrap_or_else(Uuid::new_v4),
        name: req.name,
        status: WorkerStatus::Available,
        capabilities: req.capabilities,
        current_task_id: None,
        last_heartbeat: now,
        registered_at: now,
        available_cpu: req.available_cpu,
        available_memory: req.available_memory,
        available_gpu: req.available_gpu,
        total_tasks_handled: 0,
    };

    let registered = store.create_worker(&worker).await?;
    info!(
        worker_id = %registered.id,
        name = %registered.name,
        capabilities = ?registered.capabilities,
        "worker registered"
    );
    Ok(registered)
}

/// Stamp a worker's heartbeat. An `offline` worker revives to `available`.
pub async fn heartbeat(
    store: &dyn TaskStore,
    worker_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if store.update_heartbeat(worker_id, now).await? {
        Ok(())
    } else {
        Err(StoreError::worker_not_found(worker_id))
    }
}

/// Task outcome carried by a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedOutcome {
    Running,
    Completed,
    Failed,
}

/// A combined worker+task status report, as received from a node.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerReport {
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_task_id: Option<Uuid>,
    #[serde(default)]
    pub task_status: Option<ReportedOutcome>,
    /// Result payload, hex-encoded on the wire.
    #[serde(default, with = "hex_bytes_opt")]
    pub task_output: Option<Vec<u8>>,
    #[serde(default)]
    pub task_error: Option<String>,
    pub available_cpu: f64,
    pub available_memory: i64,
    pub available_gpu: f64,
}

/// Error from a status report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("worker {0} not found")]
    WorkerNotFound(Uuid),
    #[error("invalid report: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReportError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind: "worker", id } => Self::WorkerNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Apply a status report: refresh the worker's advertised resources and
/// heartbeat, and apply any attached task outcome.
///
/// A report is dropped (success returned, task untouched) when its task is
/// already terminal, or when the task is no longer assigned to the
/// reporting worker -- an orphaned worker coming back late must not settle
/// a task that has been handed to someone else. Either way the reporter is
/// unpinned from the task if still necessary.
pub async fn report_status(
    store: &dyn TaskStore,
    ledger: &ResourceLedger,
    metrics: &dyn MetricsSink,
    worker_id: Uuid,
    report: WorkerReport,
    now: DateTime<Utc>,
) -> Result<Worker, ReportError> {
    let worker = store.get_worker(worker_id).await?;

    // Every report is also a liveness signal.
    let mut updated = worker.clone();
    updated.available_cpu = report.available_cpu;
    updated.available_memory = report.available_memory;
    updated.available_gpu = report.available_gpu;
    updated.last_heartbeat = now;

    match (report.current_task_id, report.task_status) {
        (Some(task_id), Some(outcome)) => {
            apply_task_outcome(
                store, ledger, metrics, &worker, &mut updated, task_id, outcome, &report, now,
            )
            .await?;
        }
        (None, Some(_)) => {
            return Err(ReportError::Invalid(
                "task_status requires current_task_id".into(),
            ));
        }
        (_, None) => {
            // Plain presence refresh.
            updated.status = report.status;
            updated.current_task_id = report.current_task_id;
        }
    }

    if !store.update_worker(&updated, worker.status).await? {
        // The liveness monitor flipped the worker under the report. The
        // task-side writes (if any) have landed; hand back the fresh
        // record and let the next heartbeat revive the worker.
        warn!(worker_id = %worker_id, "worker changed under status report");
        return Ok(store.get_worker(worker_id).await?);
    }
    Ok(updated)
}

/// Apply the task part of a report, adjusting the worker record in place.
#[allow(clippy::too_many_arguments)]
async fn apply_task_outcome(
    store: &dyn TaskStore,
    ledger: &ResourceLedger,
    metrics: &dyn MetricsSink,
    worker: &Worker,
    updated: &mut Worker,
    task_id: Uuid,
    outcome: ReportedOutcome,
    report: &WorkerReport,
    now: DateTime<Utc>,
) -> Result<(), ReportError> {
    let task = match store.get_task(task_id).await {
        Ok(task) => task,
        Err(e) if e.is_not_found() => {
            warn!(worker_id = %worker.id, task_id = %task_id, "report references a missing task");
            updated.status = WorkerStatus::Available;
            updated.current_task_id = None;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if task.status.is_terminal() {
        // Timeout race (or a duplicate delivery): the task has already
        // been settled. Drop the report; unpin the worker if the sweeper
        // did not get to it.
        debug!(
            task_id = %task_id,
            status = %task.status,
            "dropping report for already-terminal task"
        );
        if worker.current_task_id == Some(task_id) {
            updated.status = WorkerStatus::Available;
            updated.current_task_id = None;
            ledger.release(worker.id, &task);
        }
        return Ok(());
    }

    if task.worker_id != Some(worker.id) {
        // The task was orphaned away from this worker and may be running
        // somewhere else by now; only the current assignee's reports are
        // authoritative. Drop it, unpinning the reporter if it still
        // points here.
        debug!(
            task_id = %task_id,
            reporter = %worker.id,
            assignee = ?task.worker_id,
            "dropping report from a worker the task is no longer assigned to"
        );
        if worker.current_task_id == Some(task_id) {
            updated.status = WorkerStatus::Available;
            updated.current_task_id = None;
            ledger.release(worker.id, &task);
        }
        return Ok(());
    }

    match outcome {
        ReportedOutcome::Running => {
            // The first running report stamps started_at; repeats are
            // no-ops thanks to the status guard.
            if task.status == TaskStatus::Scheduled {
                let mut running = task.clone();
                running.status = TaskStatus::Running;
                running.started_at = Some(now);
                if !store.update_task(&running, TaskStatus::Scheduled).await? {
                    debug!(task_id = %task_id, "running report lost its guard");
                }
            }
            updated.status = WorkerStatus::Busy;
            updated.current_task_id = Some(task_id);
        }
        ReportedOutcome::Completed | ReportedOutcome::Failed => {
            let mut settled = task.clone();
            settled.completed_at = Some(now);
            if outcome == ReportedOutcome::Completed {
                settled.status = TaskStatus::Completed;
                settled.output = report.task_output.clone();
                settled.error = None;
            } else {
                settled.status = TaskStatus::Failed;
                settled.error = Some(
                    report
                        .task_error
                        .clone()
                        .unwrap_or_else(|| "task failed".to_owned()),
                );
            }

            if store.update_task(&settled, task.status).await? {
                if outcome == ReportedOutcome::Completed {
                    metrics.task_completed();
                } else {
                    metrics.task_failed("worker_report");
                }
                info!(
                    task_id = %task_id,
                    worker_id = %worker.id,
                    status = %settled.status,
                    "task settled by worker report"
                );
                updated.total_tasks_handled += 1;
                ledger.release(worker.id, &task);
            } else {
                // Settled concurrently (sweeper or a duplicate report);
                // treat as a dropped report.
                debug!(task_id = %task_id, "terminal report lost its guard");
            }
            updated.status = WorkerStatus::Available;
            updated.current_task_id = None;
        }
    }
    Ok(())
}
