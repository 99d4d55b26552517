use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use rpa_core::wire::{BatchAssignment, DispatchAck};

use crate::error::AppResult;
use crate::state::AppState;

/// POST /batches -- take ownership of a handed-off batch.
///
/// Answers right away; the jobs run in the background.
async fn accept_batch(
    State(state): State<AppState>,
    Json(assignment): Json<BatchAssignment>,
) -> AppResult<Json<DispatchAck>> {
    let ack = state.processor.accept(assignment).await?;
    Ok(Json(ack))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/batches", post(accept_batch))
}
