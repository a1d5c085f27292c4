//! Task submission and cancellation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use drover_db::models::{Task, TaskPriority, TaskStatus, WorkerStatus, hex_bytes};

use crate::ledger::ResourceLedger;
use crate::metrics::MetricsSink;
use crate::store::{StoreError, TaskStore};

/// A task submission, as received from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model_name: String,
    pub priority: TaskPriority,
    /// Opaque payload, hex-encoded on the wire.
    #[serde(default, with = "hex_bytes")]
    pub input: Vec<u8>,
    pub user_id: String,
    /// Per-task wall-clock budget in seconds. Clamped to the configured
    /// ceiling; the ceiling applies when omitted.
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

/// Error from task submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid task: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Default retry budget when the client does not set one.
const DEFAULT_MAX_RETRIES: i32 = 3;

/// Validate and insert a new task in `pending`.
pub async fn submit_task(
    store: &dyn TaskStore,
    metrics: &dyn MetricsSink,
    timeout_ceiling: Duration,
    req: SubmitTask,
    now: DateTime<Utc>,
) -> Result<Task, SubmitError> {
    if req.name.trim().is_empty() {
        return Err(SubmitError::Invalid("name must not be empty".into()));
    }
    if req.user_id.trim().is_empty() {
        return Err(SubmitError::Invalid("user_id must not be empty".into()));
    }
    if matches!(req.timeout_seconds, Some(timeout) if timeout <= 0) {
        return Err(SubmitError::Invalid(format!(
            "timeout_seconds must be positive, got {}",
            req.timeout_seconds.unwrap_or_default()
        )));
    }
    if matches!(req.max_retries, Some(max_retries) if max_retries < 0) {
        return Err(SubmitError::Invalid(format!(
            "max_retries must not be negative, got {}",
            req.max_retries.unwrap_or_default()
        )));
    }

    let ceiling = timeout_ceiling.as_secs() as i64;
    let timeout_seconds = req.timeout_seconds.unwrap_or(ceiling).min(ceiling);

    let task = Task {
        id: Uuid::new_v4(),
        name: req.name,
        description: req.description,
        model_name: req.model_name,
        priority: req.priority,
        status: TaskStatus::Pending,
        input: req.input,
        output: None,
        error: None,
        worker_id: None,
        user_id: req.user_id,
        timeout_seconds,
        retry_count: 0,
        max_retries: req.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
    };

    let created = store.create_task(&task).await?;
    metrics.task_submitted(created.priority);
    info!(
        task_id = %created.id,
        model = %created.model_name,
        priority = %created.priority,
        "task submitted"
    );
    Ok(created)
}

/// Error from task cancellation.
#[derive(Debug, Error)]
pub enum CancelError {
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {id} is {status}; only pending or scheduled tasks can be cancelled")]
    Conflict { id: Uuid, status: TaskStatus },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for CancelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind: "task", id } => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Cancel a task. Allowed from `pending` or `scheduled` only; a `running`
/// task must wait for completion or timeout.
///
/// Cancelling a `scheduled` task frees its assigned worker and releases
/// the ledger commitment, so the capacity is usable on the next tick.
pub async fn cancel_task(
    store: &dyn TaskStore,
    ledger: &ResourceLedger,
    metrics: &dyn MetricsSink,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<Task, CancelError> {
    let task = store.get_task(id).await?;
    if !matches!(task.status, TaskStatus::Pending | TaskStatus::Scheduled) {
        return Err(CancelError::Conflict {
            id,
            status: task.status,
        });
    }

    let mut cancelled = task.clone();
    cancelled.status = TaskStatus::Cancelled;
    cancelled.worker_id = None;
    cancelled.completed_at = Some(now);
    if !store.update_task(&cancelled, task.status).await? {
        // The status moved between the read and the write; report the
        // fresh state as the conflict.
        let fresh = store.get_task(id).await?;
        return Err(CancelError::Conflict {
            id,
            status: fresh.status,
        });
    }

    if task.status == TaskStatus::Scheduled {
        if let Some(worker_id) = task.worker_id {
            free_cancelled_worker(store, worker_id, &task).await;
            ledger.release(worker_id, &task);
        }
    }

    metrics.task_cancelled();
    info!(task_id = %id, "task cancelled");
    Ok(cancelled)
}

/// Return a worker whose scheduled task was cancelled to `available`.
async fn free_cancelled_worker(store: &dyn TaskStore, worker_id: Uuid, task: &Task) {
    match store.get_worker(worker_id).await {
        Ok(worker) if worker.current_task_id == Some(task.id) => {
            let mut freed = worker.clone();
            freed.status = WorkerStatus::Available;
            freed.current_task_id = None;
            match store.update_worker(&freed, worker.status).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        worker_id = %worker_id,
                        task_id = %task.id,
                        "worker changed under cancellation, leaving to liveness monitor"
                    );
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "failed to free worker on cancel");
                }
            }
        }
        Ok(_) => {}
        Err(e) => {
            warn!(worker_id = %worker_id, error = %e, "failed to load worker on cancel");
        }
    }
}
