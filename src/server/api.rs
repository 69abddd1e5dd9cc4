//! HTTP API
//!
//! Routes:
//! - POST /process - Submit a TaskRequest, returns its CompletionReport
//! - GET /status - Per-component liveness
//! - GET /metrics - Prometheus text
//! - GET /tasks/{task_id} - Latest report for a task from the audit log, 202 while in flight
//! - POST /tasks/{task_id}/cancel - Cooperative cancellation
//! - POST /legacy/run - Native legacy job through the legacy adapter
//! - GET /legacy/status/{job_id} - Legacy status query
//! - GET /healthz - Liveness probe

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use crate::adapter::{envelope, LegacyAdapter, ModuleAdapter};
use crate::controller::MetaController;
use crate::error::TaskError;
use crate::types::{CompletionReport, TaskRequest};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<MetaController>,
    pub legacy: Arc<LegacyAdapter>,
    pub start_time: Instant,
    pub version: &'static str,
}

impl AppState {
    pub fn new(controller: Arc<MetaController>) -> Self {
        Self {
            controller,
            legacy: Arc::new(LegacyAdapter::new()),
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn not_found(what: String) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: what })).into_response()
}

/// Run a task on its own tokio task so a dropped connection cannot cut it short
async fn submit_detached(controller: &Arc<MetaController>, task: TaskRequest) -> CompletionReport {
    let task_id = task.task_id.clone();
    let runner = controller.clone();
    match tokio::spawn(async move { runner.submit(task).await }).await {
        Ok(report) => report,
        Err(e) => {
            error!("Task {} did not complete: {}", task_id, e);
            let report = CompletionReport::failed(
                &task_id,
                &TaskError::Internal(e.to_string()),
                std::time::Duration::ZERO,
            );
            controller.audit().append(report.clone());
            report
        }
    }
}

/// Submit a task and wait for its report
pub async fn process(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let task = match envelope::decode(&body) {
        Ok(task) => task,
        Err(e) => {
            debug!("Rejected envelope: {}", e);
            let task_id = body
                .get("task_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let report = CompletionReport::failed(task_id, &TaskError::from(e), std::time::Duration::ZERO);
            return (StatusCode::BAD_REQUEST, Json(envelope::encode_report(&report))).into_response();
        }
    };

    let report = submit_detached(&state.controller, task).await;
    Json(envelope::encode_report(&report)).into_response()
}

pub async fn status(State(state): State<Arc<AppState>>) -> Response {
    let mut body = match serde_json::to_value(state.controller.status().await) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error: e.to_string() }),
            )
                .into_response()
        }
    };
    body["version"] = Value::from(state.version);
    body["server_uptime_secs"] = Value::from(state.start_time.elapsed().as_secs());
    Json(body).into_response()
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.controller.render_metrics().await,
    )
}

pub async fn task_report(State(state): State<Arc<AppState>>, Path(task_id): Path<String>) -> Response {
    // A running task outranks any earlier report under the same id
    if state.controller.is_in_flight(&task_id) {
        return (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"task_id": task_id, "status": "in_flight"})),
        )
            .into_response();
    }
    match state.controller.audit().find(&task_id) {
        Some(report) => Json(report).into_response(),
        None => not_found(format!("no report for task '{}'", task_id)),
    }
}

pub async fn cancel_task(State(state): State<Arc<AppState>>, Path(task_id): Path<String>) -> Response {
    if state.controller.cancel(&task_id) {
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"task_id": task_id, "cancelled": true})),
        )
            .into_response()
    } else {
        not_found(format!("task '{}' is not in flight", task_id))
    }
}

/// Run a native legacy job; the reply is always in the legacy response shape
pub async fn legacy_run(State(state): State<Arc<AppState>>, Json(job): Json<Value>) -> Response {
    match state.legacy.to_canonical(&job) {
        Ok(task) => {
            let report = submit_detached(&state.controller, task).await;
            Json(state.legacy.from_canonical(&report)).into_response()
        }
        Err(e) => {
            debug!("Legacy job rejected by adapter: {}", e);
            (StatusCode::BAD_REQUEST, Json(LegacyAdapter::safe_response(&job, &e))).into_response()
        }
    }
}

pub async fn legacy_status(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Json<Value> {
    let report = state.controller.audit().find(&job_id);
    Json(LegacyAdapter::status_response(&job_id, report.as_ref()))
}

/// Liveness probe
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Create the API router
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/process", post(process))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/tasks/{task_id}", get(task_report))
        .route("/tasks/{task_id}/cancel", post(cancel_task))
        .route("/legacy/run", post(legacy_run))
        .route("/legacy/status/{job_id}", get(legacy_status))
        .route("/healthz", get(liveness))
        .with_state(state)
}
