pub mod batches;
pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

/// Dispatch surface exposed to the orchestrator.
///
/// ```text
/// POST /batches          accept a batch handoff
/// POST /jobs/execute     run one job of an owned batch
/// GET  /status           load and counters
/// ```
pub fn dispatch_routes() -> Router<AppState> {
    Router::new()
        .merge(batches::router())
        .merge(jobs::router())
        .merge(health::status_router())
}
