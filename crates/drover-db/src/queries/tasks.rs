//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new task row. Returns the inserted task with server-bumped
/// timestamps. Fails on id collision (primary key violation).
pub async fn insert_task(pool: &PgPool, task: &Task) -> Result<Task> {
    let inserted = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, name, description, model_name, priority, status, \
                            input, output, error, worker_id, user_id, \
                            timeout_seconds, retry_count, max_retries, \
                            created_at, updated_at, started_at, completed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
                 $15, NOW(), $16, $17) \
         RETURNING *",
    )
    .bind(task.id)
    .bind(&task.name)
    .bind(&task.description)
    .bind(&task.model_name)
    .bind(task.priority)
    .bind(task.status)
    .bind(&task.input)
    .bind(&task.output)
    .bind(&task.error)
    .bind(task.worker_id)
    .bind(&task.user_id)
    .bind(task.timeout_seconds)
    .bind(task.retry_count)
    .bind(task.max_retries)
    .bind(task.created_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(inserted)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Optimistic whole-record write: update every mutable field of the task,
/// guarded on the current status matching `expected`.
///
/// Bumps `updated_at`. Returns the number of rows affected (0 means the
/// status did not match, or the task does not exist).
pub async fn update_task_if_status(
    pool: &PgPool,
    task: &Task,
    expected: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET name = $1, description = $2, model_name = $3, priority = $4, \
             status = $5, input = $6, output = $7, error = $8, worker_id = $9, \
             user_id = $10, timeout_seconds = $11, retry_count = $12, \
             max_retries = $13, started_at = $14, completed_at = $15, \
             updated_at = NOW() \
         WHERE id = $16 AND status = $17",
    )
    .bind(&task.name)
    .bind(&task.description)
    .bind(&task.model_name)
    .bind(task.priority)
    .bind(task.status)
    .bind(&task.input)
    .bind(&task.output)
    .bind(&task.error)
    .bind(task.worker_id)
    .bind(&task.user_id)
    .bind(task.timeout_seconds)
    .bind(task.retry_count)
    .bind(task.max_retries)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(task.id)
    .bind(expected)
    .execute(pool)
    .await
    .context("failed to update task")?;

    Ok(result.rows_affected())
}

/// List up to `limit` pending tasks in dispatch order: priority descending,
/// then creation time ascending, then id as the final tie-break.
pub async fn list_pending_tasks(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'pending' \
         ORDER BY priority DESC, created_at ASC, id ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list pending tasks")?;

    Ok(tasks)
}

/// List running tasks in creation order, batched for the timeout sweeper.
pub async fn list_running_tasks(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'running' \
         ORDER BY created_at ASC, id ASC \
         LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list running tasks")?;

    Ok(tasks)
}

/// List tasks, optionally filtered by status, newest first.
pub async fn list_tasks_by_status(
    pool: &PgPool,
    status: Option<TaskStatus>,
    limit: i64,
) -> Result<Vec<Task>> {
    let tasks = match status {
        Some(status) => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE status = $1 \
                 ORDER BY created_at DESC LIMIT $2",
            )
            .bind(status)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at DESC LIMIT $1")
                .bind(limit)
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Pending queue depth per model tag.
pub async fn count_pending_by_model(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT model_name, COUNT(*) FROM tasks \
         WHERE status = 'pending' \
         GROUP BY model_name",
    )
    .fetch_all(pool)
    .await
    .context("failed to count pending tasks by model")?;

    Ok(rows)
}

/// Task counts by status, for operational summaries.
pub async fn count_tasks_by_status(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) FROM tasks GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to count tasks by status")?;

    Ok(rows)
}
