//! Assemble pending jobs into batches and hand them to workers.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::assembler::BatchAssembler;
use crate::dispatcher::BatchDispatcher;

/// Run the assembly and dispatch cycle every `poll_interval` until `cancel`
/// is triggered.
pub async fn run(
    assembler: Arc<BatchAssembler>,
    dispatcher: Arc<BatchDispatcher>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(
        poll_interval_ms = poll_interval.as_millis() as u64,
        workers = dispatcher.workers().len(),
        "Batch dispatch loop started",
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Batch dispatch loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                match assembler.run_once().await {
                    Ok(created) if !created.is_empty() => {
                        tracing::debug!(count = created.len(), "New batches assembled");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Assembly cycle failed"),
                }
                match dispatcher.dispatch_created().await {
                    Ok(0) => {}
                    Ok(dispatched) => tracing::debug!(dispatched, "Dispatch cycle complete"),
                    Err(e) => tracing::error!(error = %e, "Dispatch cycle failed"),
                }
            }
        }
    }
}
