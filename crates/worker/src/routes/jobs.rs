use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use rpa_core::wire::{DispatchRequest, DispatchResponse};

use crate::error::AppResult;
use crate::state::AppState;

/// POST /jobs/execute -- run one job and return its outcome.
///
/// Safe to retry: a finished job replays its recorded report.
async fn execute_job(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> AppResult<Json<DispatchResponse>> {
    let response = state.processor.process_job(&request).await?;
    Ok(Json(response))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/jobs/execute", post(execute_job))
}
