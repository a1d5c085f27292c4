//! The task store contract: durable CRUD over tasks and workers.
//!
//! The scheduler's single-writer discipline provides cross-record ordering;
//! the store is only required to make each individual update atomic and
//! durable before acknowledging. Status-changing writes are optimistic:
//! they carry the status the caller last observed, and a mismatch turns the
//! write into a no-op (`Ok(false)`) rather than a lost update.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use drover_db::models::{Task, TaskStatus, Worker, WorkerStatus};

/// Error returned by task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record does not exist. Callers branch on this variant, so it is
    /// distinguished from backend failures.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    /// An insert collided with an existing id.
    #[error("duplicate {kind} id {id}")]
    Duplicate { kind: &'static str, id: Uuid },

    /// Anything else: connection drops, serialization failures, etc. The
    /// scheduler treats these as retry-next-tick.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn task_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "task", id }
    }

    pub fn worker_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "worker", id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage for tasks and workers.
///
/// Two implementations ship with the crate: [`PgStore`] over PostgreSQL and
/// [`MemoryStore`] for tests. Both honor the same ordering and
/// optimistic-locking semantics.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task. Fails with [`StoreError::Duplicate`] on id collision.
    async fn create_task(&self, task: &Task) -> StoreResult<Task>;

    /// Point lookup; [`StoreError::NotFound`] when missing.
    async fn get_task(&self, id: Uuid) -> StoreResult<Task>;

    /// Optimistic whole-record write, guarded on the task's current status
    /// matching `expected`. Bumps `updated_at`. Returns `false` on a guard
    /// miss (including a missing row).
    async fn update_task(&self, task: &Task, expected: TaskStatus) -> StoreResult<bool>;

    /// Up to `limit` pending tasks in dispatch order: priority descending,
    /// creation time ascending, id as the final tie-break.
    async fn list_pending_tasks(&self, limit: i64) -> StoreResult<Vec<Task>>;

    /// Running tasks in creation order, batched for the timeout sweeper.
    async fn list_running_tasks(&self, limit: i64, offset: i64) -> StoreResult<Vec<Task>>;

    /// Tasks filtered by status (or all), newest first.
    async fn list_tasks_by_status(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> StoreResult<Vec<Task>>;

    /// Pending queue depth per model tag.
    async fn count_pending_by_model(&self) -> StoreResult<Vec<(String, i64)>>;

    /// Task counts by status, for operational summaries.
    async fn count_tasks_by_status(&self) -> StoreResult<Vec<(String, i64)>>;

    /// Insert or refresh a worker. Registration is an upsert: a node that
    /// restarts with the same identity refreshes its capabilities,
    /// resources, and heartbeat while keeping its history.
    async fn create_worker(&self, worker: &Worker) -> StoreResult<Worker>;

    /// Point lookup; [`StoreError::NotFound`] when missing.
    async fn get_worker(&self, id: Uuid) -> StoreResult<Worker>;

    /// Optimistic whole-record write, guarded on the worker's current
    /// status matching `expected`.
    async fn update_worker(&self, worker: &Worker, expected: WorkerStatus) -> StoreResult<bool>;

    /// Workers eligible for assignment: `available`, unassigned, heartbeat
    /// newer than `heartbeat_cutoff`. Ordered by spare GPU then spare
    /// memory, both descending.
    async fn list_available_workers(
        &self,
        heartbeat_cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Worker>>;

    /// Workers that are not `offline` but whose heartbeat is older than
    /// `cutoff`. The liveness monitor's scan.
    async fn list_stale_workers(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Worker>>;

    /// All workers, most recently heard-from first.
    async fn list_workers(&self) -> StoreResult<Vec<Worker>>;

    /// Stamp a worker's heartbeat at `now`. A heartbeat from an `offline`
    /// worker revives it to `available`; no other field changes. Returns
    /// `false` when the worker does not exist.
    async fn update_heartbeat(&self, worker_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;
}
