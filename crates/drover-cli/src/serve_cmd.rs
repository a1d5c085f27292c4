//! `drover serve`: the HTTP ingress for clients and workers, run alongside
//! the scheduler loop.
//!
//! Handlers are thin: they parse, call into `drover_core::service` or the
//! store, and map typed errors to status codes. All state behind the
//! router is trait objects, so tests run against the in-memory store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use drover_core::ledger::ResourceLedger;
use drover_core::metrics::MetricsSink;
use drover_core::service::{
    CancelError, RegisterError, RegisterWorker, ReportError, SubmitError, SubmitTask,
    WorkerReport, cancel_task, heartbeat, register_worker, report_status, submit_task,
};
use drover_core::store::{StoreError, TaskStore};
use drover_db::models::TaskStatus;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub ledger: Arc<ResourceLedger>,
    pub metrics: Arc<dyn MetricsSink>,
    /// Ceiling on any task's wall-clock budget.
    pub task_timeout: Duration,
    /// Prometheus render handle; `None` when no recorder is installed
    /// (tests).
    pub prometheus: Option<PrometheusHandle>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{msg:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::not_found(err.to_string()),
            StoreError::Duplicate { .. } => Self::bad_request(err.to_string()),
            StoreError::Backend(_) => Self::internal(err),
        }
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Invalid(_) => Self::bad_request(err.to_string()),
            SubmitError::Store(e) => e.into(),
        }
    }
}

impl From<CancelError> for AppError {
    fn from(err: CancelError) -> Self {
        match err {
            CancelError::NotFound(_) => Self::not_found(err.to_string()),
            CancelError::Conflict { .. } => Self::bad_request(err.to_string()),
            CancelError::Store(e) => e.into(),
        }
    }
}

impl From<RegisterError> for AppError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::Invalid(_) => Self::bad_request(err.to_string()),
            RegisterError::Store(e) => e.into(),
        }
    }
}

impl From<ReportError> for AppError {
    fn from(err: ReportError) -> Self {
        match err {
            ReportError::WorkerNotFound(_) => Self::not_found(err.to_string()),
            ReportError::Invalid(_) => Self::bad_request(err.to_string()),
            ReportError::Store(e) => e.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .route("/tasks", post(create_task_handler).get(list_tasks_handler))
        .route(
            "/tasks/{id}",
            get(get_task_handler).delete(cancel_task_handler),
        )
        .route(
            "/workers",
            post(register_worker_handler).get(list_workers_handler),
        )
        .route("/workers/{id}/heartbeat", put(heartbeat_handler))
        .route("/workers/{id}/status", put(status_report_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    state: AppState,
    bind: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("drover serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;
    tracing::info!("drover serve shut down");
    Ok(())
}

/// Resolves on ctrl-c or external cancellation; either way the token ends
/// up cancelled so the scheduler stops with the server.
async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to install Ctrl+C handler");
            }
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    // A cheap store round-trip; unreachable storage means unhealthy.
    state
        .store
        .count_tasks_by_status()
        .await
        .map_err(AppError::from)?;
    Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
}

async fn render_metrics(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    match &state.prometheus {
        Some(handle) => Ok(handle.render().into_response()),
        None => Err(AppError::not_found("metrics recorder not installed")),
    }
}

async fn create_task_handler(
    State(state): State<AppState>,
    Json(req): Json<SubmitTask>,
) -> Result<axum::response::Response, AppError> {
    let task = submit_task(
        state.store.as_ref(),
        state.metrics.as_ref(),
        state.task_timeout,
        req,
        chrono::Utc::now(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(task)).into_response())
}

async fn get_task_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = state.store.get_task(id).await?;
    Ok(Json(task).into_response())
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
    limit: Option<i64>,
}

/// Default page size for task listings.
const DEFAULT_LIST_LIMIT: i64 = 100;

async fn list_tasks_handler(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<axum::response::Response, AppError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<TaskStatus>()
                .map_err(|e| AppError::bad_request(e.to_string()))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 1000);
    let tasks = state.store.list_tasks_by_status(status, limit).await?;
    Ok(Json(tasks).into_response())
}

async fn cancel_task_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = cancel_task(
        state.store.as_ref(),
        state.ledger.as_ref(),
        state.metrics.as_ref(),
        id,
        chrono::Utc::now(),
    )
    .await?;
    Ok(Json(task).into_response())
}

async fn register_worker_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterWorker>,
) -> Result<axum::response::Response, AppError> {
    let worker = register_worker(state.store.as_ref(), req, chrono::Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(worker)).into_response())
}

async fn list_workers_handler(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let workers = state.store.list_workers().await?;
    Ok(Json(workers).into_response())
}

async fn heartbeat_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    heartbeat(state.store.as_ref(), id, chrono::Utc::now()).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
}

async fn status_report_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<WorkerReport>,
) -> Result<axum::response::Response, AppError> {
    let worker = report_status(
        state.store.as_ref(),
        state.ledger.as_ref(),
        state.metrics.as_ref(),
        id,
        report,
        chrono::Utc::now(),
    )
    .await?;
    Ok(Json(worker).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
