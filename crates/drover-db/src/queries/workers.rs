//! Database query functions for the `workers` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Worker, WorkerStatus};

/// Insert or refresh a worker row.
///
/// Registration is an upsert keyed on id: a node that restarts with the same
/// identity refreshes its capabilities, advertised resources, and heartbeat,
/// and comes back `available`. `registered_at` and `total_tasks_handled`
/// survive the refresh.
pub async fn upsert_worker(pool: &PgPool, worker: &Worker) -> Result<Worker> {
    let upserted = sqlx::query_as::<_, Worker>(
        "INSERT INTO workers (id, name, status, capabilities, current_task_id, \
                              last_heartbeat, registered_at, available_cpu, \
                              available_memory, available_gpu, total_tasks_handled) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (id) DO UPDATE \
         SET name = EXCLUDED.name, \
             status = EXCLUDED.status, \
             capabilities = EXCLUDED.capabilities, \
             current_task_id = EXCLUDED.current_task_id, \
             last_heartbeat = EXCLUDED.last_heartbeat, \
             available_cpu = EXCLUDED.available_cpu, \
             available_memory = EXCLUDED.available_memory, \
             available_gpu = EXCLUDED.available_gpu \
         RETURNING *",
    )
    .bind(worker.id)
    .bind(&worker.name)
    .bind(worker.status)
    .bind(&worker.capabilities)
    .bind(worker.current_task_id)
    .bind(worker.last_heartbeat)
    .bind(worker.registered_at)
    .bind(worker.available_cpu)
    .bind(worker.available_memory)
    .bind(worker.available_gpu)
    .bind(worker.total_tasks_handled)
    .fetch_one(pool)
    .await
    .context("failed to upsert worker")?;

    Ok(upserted)
}

/// Fetch a single worker by ID.
pub async fn get_worker(pool: &PgPool, id: Uuid) -> Result<Option<Worker>> {
    let worker = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worker")?;

    Ok(worker)
}

/// Optimistic whole-record write: update every mutable field of the worker,
/// guarded on the current status matching `expected`.
///
/// Returns the number of rows affected (0 means the status did not match,
/// or the worker does not exist).
pub async fn update_worker_if_status(
    pool: &PgPool,
    worker: &Worker,
    expected: WorkerStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers \
         SET name = $1, status = $2, capabilities = $3, current_task_id = $4, \
             last_heartbeat = $5, available_cpu = $6, available_memory = $7, \
             available_gpu = $8, total_tasks_handled = $9 \
         WHERE id = $10 AND status = $11",
    )
    .bind(&worker.name)
    .bind(worker.status)
    .bind(&worker.capabilities)
    .bind(worker.current_task_id)
    .bind(worker.last_heartbeat)
    .bind(worker.available_cpu)
    .bind(worker.available_memory)
    .bind(worker.available_gpu)
    .bind(worker.total_tasks_handled)
    .bind(worker.id)
    .bind(expected)
    .execute(pool)
    .await
    .context("failed to update worker")?;

    Ok(result.rows_affected())
}

/// Workers eligible to receive work: `available`, unassigned, and heartbeat
/// newer than `heartbeat_cutoff`.
///
/// Ordered by spare GPU then spare memory, both descending -- biasing
/// assignment toward over-provisioned nodes helps pack small tasks.
pub async fn list_available_workers(
    pool: &PgPool,
    heartbeat_cutoff: DateTime<Utc>,
) -> Result<Vec<Worker>> {
    let workers = sqlx::query_as::<_, Worker>(
        "SELECT * FROM workers \
         WHERE status = 'available' \
           AND current_task_id IS NULL \
           AND last_heartbeat > $1 \
         ORDER BY available_gpu DESC, available_memory DESC, id ASC",
    )
    .bind(heartbeat_cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list available workers")?;

    Ok(workers)
}

/// Workers whose heartbeat is older than `cutoff` and that are not already
/// `offline`. This is the liveness monitor's scan; excluding `offline` rows
/// is what makes the monitor idempotent.
pub async fn list_stale_workers(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<Worker>> {
    let workers = sqlx::query_as::<_, Worker>(
        "SELECT * FROM workers \
         WHERE status != 'offline' \
           AND last_heartbeat < $1 \
         ORDER BY last_heartbeat ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stale workers")?;

    Ok(workers)
}

/// List all workers, most recently heard-from first.
pub async fn list_workers(pool: &PgPool) -> Result<Vec<Worker>> {
    let workers =
        sqlx::query_as::<_, Worker>("SELECT * FROM workers ORDER BY last_heartbeat DESC")
            .fetch_all(pool)
            .await
            .context("failed to list workers")?;

    Ok(workers)
}

/// Stamp a worker's heartbeat.
///
/// Touches only `last_heartbeat`, except that a heartbeat from an `offline`
/// worker revives it to `available`. Returns the number of rows affected
/// (0 means the worker does not exist).
pub async fn update_heartbeat(pool: &PgPool, worker_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers \
         SET last_heartbeat = $1, \
             status = CASE WHEN status = 'offline' THEN 'available' ELSE status END \
         WHERE id = $2",
    )
    .bind(now)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to update heartbeat")?;

    Ok(result.rows_affected())
}
