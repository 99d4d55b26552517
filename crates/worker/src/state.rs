use std::sync::Arc;

use rpa_store::StateStore;

use crate::processor::BatchProcessor;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<BatchProcessor>,
    /// Shared coordination store, probed by the health endpoint.
    pub store: Arc<dyn StateStore>,
}
