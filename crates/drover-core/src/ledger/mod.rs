//! Process-local accounting of per-worker resource commitments.
//!
//! The ledger answers "can worker W accept task T?" during assignment. It
//! is a cache, not a source of truth: [`ResourceLedger::rebuild`]
//! reconstructs it from the store on process start by walking workers that
//! hold an assignment. Worker-advertised resources are capacity; the
//! outstanding commitments tracked here are what is spoken for.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::warn;
use uuid::Uuid;

use drover_db::models::{Task, Worker};

use crate::store::{StoreResult, TaskStore};

/// One gibibyte. Bytes are the canonical memory unit at every boundary;
/// the requirement table's GiB figures are converted here, once.
pub const GIB: i64 = 1 << 30;

/// Tolerance for the float dimensions, so that e.g. a 0.3 + 0.7 GPU
/// commitment fills a 1.0-GPU worker exactly.
const EPSILON: f64 = 1e-9;

/// Resources one task claims on its worker for the duration of an attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskRequirement {
    pub cpu_cores: f64,
    pub memory_bytes: i64,
    pub gpu_fraction: f64,
}

impl TaskRequirement {
    /// Derive the requirement for a task. Untagged tasks are assumed small;
    /// tasks pinned to a model claim a standard inference slot.
    pub fn for_task(task: &Task) -> Self {
        if task.model_name.is_empty() {
            Self {
                cpu_cores: 0.5,
                memory_bytes: GIB,
                gpu_fraction: 0.3,
            }
        } else {
            Self {
                cpu_cores: 1.0,
                memory_bytes: 2 * GIB,
                gpu_fraction: 0.7,
            }
        }
    }
}

/// Outstanding commitments for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Committed {
    pub cpu_cores: f64,
    pub memory_bytes: i64,
    pub gpu_fraction: f64,
}

impl Committed {
    fn is_zero(&self) -> bool {
        self.cpu_cores <= EPSILON && self.memory_bytes == 0 && self.gpu_fraction <= EPSILON
    }
}

/// In-memory resource ledger.
///
/// Reads take the lock shared, commits and releases take it exclusive.
/// All operations are non-blocking (no store I/O behind the lock).
#[derive(Default)]
pub struct ResourceLedger {
    committed: RwLock<HashMap<Uuid, Committed>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruct a ledger from the store: every worker holding an
    /// assignment contributes its task's requirement. Workers whose task
    /// has vanished are skipped with a warning; the liveness monitor will
    /// reconcile them.
    pub async fn rebuild(store: &dyn TaskStore) -> StoreResult<Self> {
        let ledger = Self::new();
        for worker in store.list_workers().await? {
            let Some(task_id) = worker.current_task_id else {
                continue;
            };
            match store.get_task(task_id).await {
                Ok(task) => ledger.commit(worker.id, &task),
                Err(e) if e.is_not_found() => {
                    warn!(
                        worker_id = %worker.id,
                        task_id = %task_id,
                        "worker holds an assignment for a missing task, skipping"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ledger)
    }

    /// Whether `worker` can accept `task`: the worker must advertise the
    /// task's capability tag, and the commitment plus the task's
    /// requirement must fit the advertised capacity on every dimension.
    pub fn can_fit(&self, worker: &Worker, task: &Task) -> bool {
        if !worker.has_capability(&task.model_name) {
            return false;
        }
        let req = TaskRequirement::for_task(task);
        let committed = self.snapshot(worker.id);
        committed.cpu_cores + req.cpu_cores <= worker.available_cpu + EPSILON
            && committed.memory_bytes + req.memory_bytes <= worker.available_memory
            && committed.gpu_fraction + req.gpu_fraction <= worker.available_gpu + EPSILON
    }

    /// Add a task's requirement to a worker's commitments. Call only after
    /// the store writes for the assignment have succeeded.
    pub fn commit(&self, worker_id: Uuid, task: &Task) {
        let req = TaskRequirement::for_task(task);
        let mut committed = self.committed.write().unwrap_or_else(|e| e.into_inner());
        let entry = committed.entry(worker_id).or_default();
        entry.cpu_cores += req.cpu_cores;
        entry.memory_bytes += req.memory_bytes;
        entry.gpu_fraction += req.gpu_fraction;
    }

    /// Subtract a task's requirement from a worker's commitments, on any
    /// terminal transition or orphan/timeout recovery. Saturates at zero:
    /// a duplicate release (timeout sweep racing a terminal report) must
    /// not underflow.
    pub fn release(&self, worker_id: Uuid, task: &Task) {
        let req = TaskRequirement::for_task(task);
        let mut committed = self.committed.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = committed.get_mut(&worker_id) {
            entry.cpu_cores = (entry.cpu_cores - req.cpu_cores).max(0.0);
            entry.memory_bytes = (entry.memory_bytes - req.memory_bytes).max(0);
            entry.gpu_fraction = (entry.gpu_fraction - req.gpu_fraction).max(0.0);
            if entry.is_zero() {
                committed.remove(&worker_id);
            }
        }
    }

    /// Current commitments for a worker. Observability only.
    pub fn snapshot(&self, worker_id: Uuid) -> Committed {
        let committed = self.committed.read().unwrap_or_else(|e| e.into_inner());
        committed.get(&worker_id).copied().unwrap_or_default()
    }
}
