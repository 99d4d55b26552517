//! Periodic removal of expired rows from the shared store.
//!
//! Expired entries are already invisible to readers; this only reclaims
//! space in backends that keep them around.

use std::sync::Arc;
use std::time::Duration;

use rpa_store::StateStore;
use tokio_util::sync::CancellationToken;

/// How often expired entries are purged.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(300);

pub async fn run(store: Arc<dyn StateStore>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    tracing::info!(interval_secs = PURGE_INTERVAL.as_secs(), "Store purge job started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Store purge job stopping");
                break;
            }
            _ = interval.tick() => {
                match store.purge_expired().await {
                    Ok(0) => tracing::debug!("Store purge: nothing expired"),
                    Ok(purged) => tracing::info!(purged, "Store purge: removed expired entries"),
                    Err(e) => tracing::error!(error = %e, "Store purge failed"),
                }
            }
        }
    }
}
