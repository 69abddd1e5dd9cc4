//! HTTP Server
//!
//! Axum server with CORS, request tracing, and graceful shutdown.

pub mod api;

use axum::{
    http::{header, Method},
    Router,
};
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::controller::MetaController;

pub use api::{api_router, AppState};

pub struct Server {
    config: Config,
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: Config, controller: Arc<MetaController>) -> Self {
        Self {
            config,
            state: Arc::new(AppState::new(controller)),
        }
    }

    /// Build the router with all routes and middleware
    pub fn build_router(&self) -> Router {
        router(self.state.clone())
    }

    /// Start the server and run until shutdown signal
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let router = self.build_router();

        if self.config.is_localhost() {
            info!("Bound to localhost");
        } else {
            warn!("Bound to {} - the API has no authentication", addr);
        }

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on http://{}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server shut down gracefully");
        Ok(())
    }
}

/// API routes wrapped in CORS and request tracing
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    api_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::controller::AuditLog;
    use crate::environment::{Environment, LegacyModule, ScriptedHandler};
    use crate::memory::InMemoryStore;
    use crate::types::Outcome;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        app_with(Arc::new(ScriptedHandler::new())).0
    }

    fn app_with(handler: Arc<ScriptedHandler>) -> (Router, Arc<MetaController>) {
        let controller = Arc::new(MetaController::new(
            Config::default(),
            Arc::new(InMemoryStore::new()),
            AuditLog::new(),
        ));
        let scripted = Arc::new(Environment::new(handler, 100, Duration::from_secs(60)));
        let legacy = Arc::new(Environment::new(
            Arc::new(LegacyModule::default()),
            100,
            Duration::from_secs(60),
        ));
        controller.register_agent(Agent::new("analyst", &["process_dataset"], scripted));
        controller.register_agent(Agent::new("legacy", &["data_processing"], legacy));
        (router(Arc::new(AppState::new(controller.clone()))), controller)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn wait_in_flight(controller: &MetaController, task_id: &str) {
        while !controller.is_in_flight(task_id) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(b) => Body::from(b.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_process_then_poll() {
        let app = app();
        let (status, report) = call(
            &app,
            "POST",
            "/process",
            Some(json!({"task_id": "T1", "type": "process_dataset", "payload": {"dataset_id": "DS123"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["outcome"], "success");

        let (status, polled) = call(&app, "GET", "/tasks/T1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(polled["task_id"], "T1");

        let (status, _) = call(&app, "GET", "/tasks/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dropped_request_still_reports() {
        let handler = Arc::new(ScriptedHandler::new().with_latency(Duration::from_millis(200)));
        let (app, controller) = app_with(handler.clone());

        let request = post(
            "/process",
            json!({"task_id": "P1", "type": "process_dataset", "payload": {}}),
        );
        // The client gives up long before the action finishes
        let abandoned = tokio::time::timeout(Duration::from_millis(50), app.clone().oneshot(request)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!controller.is_in_flight("P1"));
        assert_eq!(controller.audit().find("P1").unwrap().outcome, Outcome::Success);
        assert_eq!(handler.total_side_effects(), 1);

        let (status, polled) = call(&app, "GET", "/tasks/P1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(polled["outcome"], "success");
    }

    #[tokio::test]
    async fn test_poll_reports_in_flight_over_earlier_report() {
        let handler = Arc::new(ScriptedHandler::new().with_latency(Duration::from_millis(200)));
        let (app, controller) = app_with(handler);

        let first = tokio::spawn({
            let app = app.clone();
            async move {
                call(
                    &app,
                    "POST",
                    "/process",
                    Some(json!({"task_id": "X", "type": "process_dataset", "payload": {}})),
                )
                .await
            }
        });
        wait_in_flight(&controller, "X").await;

        // Audits an invalid_input report under the same id
        let (status, duplicate) = call(
            &app,
            "POST",
            "/process",
            Some(json!({"task_id": "X", "type": "process_dataset", "payload": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(duplicate["error"]["kind"], "invalid_input");

        let (status, polled) = call(&app, "GET", "/tasks/X", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(polled["status"], "in_flight");

        let (status, report) = first.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["outcome"], "success");

        let (status, polled) = call(&app, "GET", "/tasks/X", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(polled["outcome"], "success");
    }

    #[tokio::test]
    async fn test_process_missing_field() {
        let (status, report) = call(&app(), "POST", "/process", Some(json!({"task_id": "T1"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(report["error"]["kind"], "schema_mismatch");
    }

    #[tokio::test]
    async fn test_status_and_metrics() {
        let app = app();
        let (status, body) = call(&app, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["memory"]["healthy"], true);
        assert_eq!(body["agents"].as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("archmerge_memory_faults_total"));
    }

    #[tokio::test]
    async fn test_legacy_run_and_status() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/legacy/run",
            Some(json!({"id": "job_1", "type": "data_processing", "priority": "2", "payload": "{\"input_file\": \"data.csv\"}"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["code"], 200);

        let (_, status_body) = call(&app, "GET", "/legacy/status/job_1", None).await;
        assert_eq!(status_body["data"]["status"], "COMPLETED");

        let (_, unknown) = call(&app, "GET", "/legacy/status/job_9", None).await;
        assert_eq!(unknown["data"]["status"], "UNKNOWN");
    }

    #[tokio::test]
    async fn test_legacy_run_bad_priority() {
        let (status, body) = call(
            &app(),
            "POST",
            "/legacy/run",
            Some(json!({"id": "job_2", "type": "data_processing", "priority": true})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["data"]["job_id"], "job_2");
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_liveness() {
        let app = app();
        let (status, _) = call(&app, "POST", "/tasks/T1/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
