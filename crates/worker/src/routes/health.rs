use axum::extract::State;
use axum::{routing::get, Json, Router};
use rpa_core::wire::WorkerStatus;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Whether the shared state store answers.
    pub store_healthy: bool,
}

/// GET /health -- returns service and store health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_healthy = state.store.ping().await.is_ok();

    let status = if store_healthy { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        store_healthy,
    })
}

/// GET /status -- current load, polled by the orchestrator for worker selection.
async fn worker_status(State(state): State<AppState>) -> Json<WorkerStatus> {
    Json(state.processor.status())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

pub fn status_router() -> Router<AppState> {
    Router::new().route("/status", get(worker_status))
}
