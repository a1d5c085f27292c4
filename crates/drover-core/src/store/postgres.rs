//! PostgreSQL-backed task store: a thin delegation to the `drover-db`
//! query layer, mapping missing rows and guard misses to the store
//! contract's vocabulary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{Task, TaskStatus, Worker, WorkerStatus};
use drover_db::queries::{tasks, workers};

use super::{StoreError, StoreResult, TaskStore};

/// Task store over a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Whether an error chain contains a PostgreSQL unique violation (23505).
fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<sqlx::Error>(),
            Some(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505")
        )
    })
}

#[async_trait]
impl TaskStore for PgStore {
    async fn create_task(&self, task: &Task) -> StoreResult<Task> {
        tasks::insert_task(&self.pool, task).await.map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate {
                    kind: "task",
                    id: task.id,
                }
            } else {
                StoreError::Backend(e)
            }
        })
    }

    async fn get_task(&self, id: Uuid) -> StoreResult<Task> {
        tasks::get_task(&self.pool, id)
            .await?
            .ok_or_else(|| StoreError::task_not_found(id))
    }

    async fn update_task(&self, task: &Task, expected: TaskStatus) -> StoreResult<bool> {
        let rows = tasks::update_task_if_status(&self.pool, task, expected).await?;
        Ok(rows > 0)
    }

    async fn list_pending_tasks(&self, limit: i64) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_pending_tasks(&self.pool, limit).await?)
    }

    async fn list_running_tasks(&self, limit: i64, offset: i64) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_running_tasks(&self.pool, limit, offset).await?)
    }

    async fn list_tasks_by_status(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> StoreResult<Vec<Task>> {
        Ok(tasks::list_tasks_by_status(&self.pool, status, limit).await?)
    }

    async fn count_pending_by_model(&self) -> StoreResult<Vec<(String, i64)>> {
        Ok(tasks::count_pending_by_model(&self.pool).await?)
    }

    async fn count_tasks_by_status(&self) -> StoreResult<Vec<(String, i64)>> {
        Ok(tasks::count_tasks_by_status(&self.pool).await?)
    }

    async fn create_worker(&self, worker: &Worker) -> StoreResult<Worker> {
        Ok(workers::upsert_worker(&self.pool, worker).await?)
    }

    async fn get_worker(&self, id: Uuid) -> StoreResult<Worker> {
        workers::get_worker(&self.pool, id)
            .await?
            .ok_or_else(|| StoreError::worker_not_found(id))
    }

    async fn update_worker(&self, worker: &Worker, expected: WorkerStatus) -> StoreResult<bool> {
        let rows = workers::update_worker_if_status(&self.pool, worker, expected).await?;
        Ok(rows > 0)
    }

    async fn list_available_workers(
        &self,
        heartbeat_cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Worker>> {
        Ok(workers::list_available_workers(&self.pool, heartbeat_cutoff).await?)
    }

    async fn list_stale_workers(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Worker>> {
        Ok(workers::list_stale_workers(&self.pool, cutoff).await?)
    }

    async fn list_workers(&self) -> StoreResult<Vec<Worker>> {
        Ok(workers::list_workers(&self.pool).await?)
    }

    async fn update_heartbeat(&self, worker_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let rows = workers::update_heartbeat(&self.pool, worker_id, now).await?;
        Ok(rows > 0)
    }
}
