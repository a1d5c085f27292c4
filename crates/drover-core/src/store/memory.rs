//! In-memory task store for tests: the same ordering and optimistic-locking
//! semantics as the PostgreSQL implementation, over hash maps.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use drover_db::models::{Task, TaskStatus, Worker, WorkerStatus};

use super::{StoreError, StoreResult, TaskStore};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    workers: HashMap<Uuid, Worker>,
}

/// In-memory [`TaskStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Dispatch order: priority descending, creation time ascending, id as the
/// final tie-break.
fn dispatch_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    (b.priority as i16)
        .cmp(&(a.priority as i16))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Packing order for available workers: spare GPU descending, spare memory
/// descending, id as the final tie-break.
fn packing_order(a: &Worker, b: &Worker) -> std::cmp::Ordering {
    b.available_gpu
        .total_cmp(&a.available_gpu)
        .then(b.available_memory.cmp(&a.available_memory))
        .then(a.id.cmp(&b.id))
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: &Task) -> StoreResult<Task> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate {
                kind: "task",
                id: task.id,
            });
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(task.clone())
    }

    async fn get_task(&self, id: Uuid) -> StoreResult<Task> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::task_not_found(id))
    }

    async fn update_task(&self, task: &Task, expected: TaskStatus) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.tasks.get_mut(&task.id) {
            Some(existing) if existing.status == expected => {
                let mut updated = task.clone();
                updated.updated_at = Utc::now();
                *existing = updated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_pending_tasks(&self, limit: i64) -> StoreResult<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(dispatch_order);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn list_running_tasks(&self, limit: i64, offset: i64) -> StoreResult<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut running: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(running
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_tasks_by_status(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> StoreResult<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        tasks.truncate(limit.max(0) as usize);
        Ok(tasks)
    }

    async fn count_pending_by_model(&self) -> StoreResult<Vec<(String, i64)>> {
        let inner = self.inner.read().await;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for task in inner.tasks.values() {
            if task.status == TaskStatus::Pending {
                *counts.entry(task.model_name.clone()).or_default() += 1;
            }
        }
        Ok(counts.into_iter().collect())
    }

    async fn count_tasks_by_status(&self) -> StoreResult<Vec<(String, i64)>> {
        let inner = self.inner.read().await;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for task in inner.tasks.values() {
            *counts.entry(task.status.to_string()).or_default() += 1;
        }
        let mut counts: Vec<(String, i64)> = counts.into_iter().collect();
        counts.sort();
        Ok(counts)
    }

    async fn create_worker(&self, worker: &Worker) -> StoreResult<Worker> {
        let mut inner = self.inner.write().await;
        let stored = match inner.workers.get(&worker.id) {
            // Re-registration refreshes the record but keeps history.
            Some(existing) => {
                let mut refreshed = worker.clone();
                refreshed.registered_at = existing.registered_at;
                refreshed.total_tasks_handled = existing.total_tasks_handled;
                refreshed
            }
            None => worker.clone(),
        };
        inner.workers.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_worker(&self, id: Uuid) -> StoreResult<Worker> {
        let inner = self.inner.read().await;
        inner
            .workers
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::worker_not_found(id))
    }

    async fn update_worker(&self, worker: &Worker, expected: WorkerStatus) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.workers.get_mut(&worker.id) {
            Some(existing) if existing.status == expected => {
                *existing = worker.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_available_workers(
        &self,
        heartbeat_cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Worker>> {
        let inner = self.inner.read().await;
        let mut available: Vec<Worker> = inner
            .workers
            .values()
            .filter(|w| {
                w.status == WorkerStatus::Available
                    && w.current_task_id.is_none()
                    && w.last_heartbeat > heartbeat_cutoff
            })
            .cloned()
            .collect();
        available.sort_by(packing_order);
        Ok(available)
    }

    async fn list_stale_workers(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Worker>> {
        let inner = self.inner.read().await;
        let mut stale: Vec<Worker> = inner
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Offline && w.last_heartbeat < cutoff)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.last_heartbeat.cmp(&b.last_heartbeat));
        Ok(stale)
    }

    async fn list_workers(&self) -> StoreResult<Vec<Worker>> {
        let inner = self.inner.read().await;
        let mut workers: Vec<Worker> = inner.workers.values().cloned().collect();
        workers.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
        Ok(workers)
    }

    async fn update_heartbeat(&self, worker_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.workers.get_mut(&worker_id) {
            Some(worker) => {
                worker.last_heartbeat = now;
                if worker.status == WorkerStatus::Offline {
                    worker.status = WorkerStatus::Available;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
