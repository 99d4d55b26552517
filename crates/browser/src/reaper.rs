//! Periodic execution-unit reclamation.
//!
//! Each tick fails units stuck in startup, terminates idle units past the
//! idle timeout and tops the warm pool back up. Safe to run in several
//! processes at once since every step goes through compare-and-set.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ExecutionUnitError;
use crate::manager::ExecutionUnitManager;

/// Default interval between reclamation passes.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// What one reclamation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub stale_failed: usize,
    pub idle_reclaimed: usize,
    pub warm_provisioned: usize,
}

pub struct UnitReaper {
    manager: Arc<ExecutionUnitManager>,
    interval: Duration,
}

impl UnitReaper {
    pub fn new(manager: Arc<ExecutionUnitManager>) -> Self {
        Self::with_interval(manager, DEFAULT_REAP_INTERVAL)
    }

    pub fn with_interval(manager: Arc<ExecutionUnitManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Run until `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Execution-unit reaper started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Execution-unit reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.reap_once().await {
                        Ok(summary) if summary != ReapSummary::default() => {
                            tracing::info!(
                                stale_failed = summary.stale_failed,
                                idle_reclaimed = summary.idle_reclaimed,
                                warm_provisioned = summary.warm_provisioned,
                                "Reaper pass complete",
                            );
                        }
                        Ok(_) => tracing::debug!("Reaper pass: nothing to do"),
                        Err(e) => tracing::error!(error = %e, "Reaper pass failed"),
                    }
                }
            }
        }
    }

    pub async fn reap_once(&self) -> Result<ReapSummary, ExecutionUnitError> {
        let stale_failed = self.manager.reap_stale_startups().await?;
        let idle_reclaimed = self.manager.reap_idle().await?;
        let warm_provisioned = self.manager.maintain_warm_pool().await?;
        Ok(ReapSummary {
            stale_failed,
            idle_reclaimed,
            warm_provisioned,
        })
    }
}
