//! Worker server — the minimal HTTP surface a coordinator drives:
//! `/health`, `/status`, `/prepare`, `/start`, `/results`, `/stop`.
//!
//! A worker hosts at most one active runner; `/prepare` while a test is
//! running is rejected.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::engine::{run_test, EngineHandle, EngineStatus};
use crate::error::StampedeError;
use crate::model::TestConfiguration;
use crate::results::{TestResult, TestSummary};

pub const DEFAULT_WORKER_PORT: u16 = 8080;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusBody {
    pub connected: bool,
    pub running: bool,
    pub virtual_users: u32,
    pub rps: f64,
    pub response_time: f64,
    pub error_rate: f64,
    pub active_runner: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBody {
    /// Absolute wall-clock start time in epoch milliseconds; immediate
    /// start when absent or in the past.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultsBody {
    pub results: Vec<TestResult>,
    pub summary: Option<TestSummary>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct WorkerState {
    prepared: Mutex<Option<TestConfiguration>>,
    runner: Mutex<Option<EngineHandle>>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    async fn is_running(&self) -> bool {
        let runner = self.runner.lock().await;
        match runner.as_ref() {
            Some(handle) => matches!(
                handle.status().await,
                EngineStatus::Running | EngineStatus::Stopping
            ),
            None => false,
        }
    }
}

/// Build the worker router.
pub fn router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/prepare", post(prepare))
        .route("/start", post(start))
        .route("/results", get(results))
        .route("/stop", post(stop))
        .with_state(state)
}

/// Bind and serve the worker until the process is stopped.
pub async fn serve(port: u16) -> Result<(), StampedeError> {
    let state = Arc::new(WorkerState::new());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| StampedeError::Engine(format!("cannot bind worker port {port}: {e}")))?;
    tracing::info!(port, "worker listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| StampedeError::Engine(format!("worker server failed: {e}")))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn status(State(state): State<Arc<WorkerState>>) -> impl IntoResponse {
    let runner = state.runner.lock().await;
    let body = match runner.as_ref() {
        Some(handle) => {
            let snap = handle.ctx.metrics.snapshot();
            let running = matches!(
                handle.status().await,
                EngineStatus::Running | EngineStatus::Stopping
            );
            WorkerStatusBody {
                connected: true,
                running,
                virtual_users: handle.ctx.active_vus(),
                rps: snap.rps,
                response_time: snap.mean_ms,
                error_rate: snap.error_rate,
                active_runner: true,
            }
        }
        None => WorkerStatusBody {
            connected: true,
            running: false,
            virtual_users: 0,
            rps: 0.0,
            response_time: 0.0,
            error_rate: 0.0,
            active_runner: false,
        },
    };
    Json(body)
}

async fn prepare(
    State(state): State<Arc<WorkerState>>,
    Json(config): Json<TestConfiguration>,
) -> Response {
    if state.is_running().await {
        return error_response(
            StatusCode::CONFLICT,
            "a test is already running on this worker",
        );
    }

    let errors = crate::model::validation::validate(&config);
    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return error_response(StatusCode::BAD_REQUEST, joined);
    }

    tracing::info!(test = %config.name, "test prepared");
    *state.prepared.lock().await = Some(config);
    (StatusCode::OK, Json(serde_json::json!({"prepared": true}))).into_response()
}

async fn start(
    State(state): State<Arc<WorkerState>>,
    body: Option<Json<StartBody>>,
) -> Response {
    if state.is_running().await {
        return error_response(
            StatusCode::CONFLICT,
            "a test is already running on this worker",
        );
    }

    let Some(config) = state.prepared.lock().await.take() else {
        return error_response(StatusCode::BAD_REQUEST, "no test has been prepared");
    };

    let start_time = body.and_then(|Json(b)| b.start_time);
    let delay = start_time
        .map(|at| (at - crate::clock::epoch_ms()).max(0) as u64)
        .unwrap_or(0);

    let state_clone = Arc::clone(&state);
    tokio::spawn(async move {
        if delay > 0 {
            tracing::info!(delay_ms = delay, "waiting for synchronised start time");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        // Events are drained locally; the coordinator reads aggregate
        // state through /status and /results.
        let (event_tx, mut event_rx) = mpsc::channel(1024);
        tokio::spawn(async move { while event_rx.recv().await.is_some() {} });

        match run_test(config, event_tx).await {
            Ok(handle) => {
                *state_clone.runner.lock().await = Some(handle);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start prepared test");
            }
        }
    });

    (StatusCode::OK, Json(serde_json::json!({"started": true}))).into_response()
}

async fn results(State(state): State<Arc<WorkerState>>) -> impl IntoResponse {
    let runner = state.runner.lock().await;
    let body = match runner.as_ref() {
        Some(handle) => {
            // The metrics store is updated synchronously at record time, so
            // a read here cannot race a pending batch flush.
            ResultsBody {
                results: handle.ctx.metrics.stored_results(),
                summary: Some(handle.ctx.summary()),
            }
        }
        None => ResultsBody {
            results: Vec::new(),
            summary: None,
        },
    };
    Json(body)
}

async fn stop(State(state): State<Arc<WorkerState>>) -> impl IntoResponse {
    let runner = state.runner.lock().await;
    if let Some(handle) = runner.as_ref() {
        tracing::info!("stop requested");
        handle.cancel.cancel();
    }
    Json(serde_json::json!({"stopping": true}))
}
