//! Periodic scan for batches whose worker stopped heartbeating.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::monitor::HeartbeatMonitor;

pub async fn run(monitor: Arc<HeartbeatMonitor>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    tracing::info!(interval_secs = interval.as_secs(), "Abandoned-batch monitor started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Abandoned-batch monitor shutting down");
                break;
            }
            _ = ticker.tick() => {
                match monitor.run_once().await {
                    Ok(recovered) if !recovered.is_empty() => {
                        let requeued: usize = recovered.iter().map(|r| r.requeued.len()).sum();
                        tracing::info!(batches = recovered.len(), requeued, "Recovered abandoned batches");
                    }
                    Ok(_) => tracing::debug!("No abandoned batches"),
                    Err(e) => tracing::error!(error = %e, "Abandoned-batch scan failed"),
                }
            }
        }
    }
}
