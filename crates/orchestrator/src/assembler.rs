//! Batch assembly service: turns pending intake jobs into persisted batches.

use std::sync::Arc;
use std::time::Duration;

use rpa_core::batch::{assemble, new_batch_id, Batch, BatchFailure, BatchStatus};
use rpa_core::clock::Clock;
use rpa_core::config::CoordinationConfig;
use rpa_store::intake::JobIntake;
use rpa_store::repositories::BatchRepo;
use rpa_store::StateStore;

use crate::error::DispatchError;

/// Upper bound on pending jobs pulled per assembly pass.
pub const DEFAULT_PULL_LIMIT: usize = 1000;

pub struct BatchAssembler {
    store: Arc<dyn StateStore>,
    intake: Arc<dyn JobIntake>,
    clock: Arc<dyn Clock>,
    max_batch_size: usize,
    max_wait: Duration,
    batch_ttl: Duration,
    pull_limit: usize,
}

impl BatchAssembler {
    pub fn new(
        store: Arc<dyn StateStore>,
        intake: Arc<dyn JobIntake>,
        clock: Arc<dyn Clock>,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            store,
            intake,
            clock,
            max_batch_size: config.max_batch_size,
            max_wait: config.max_batch_wait,
            batch_ttl: config.batch_ttl,
            pull_limit: DEFAULT_PULL_LIMIT.max(config.max_batch_size),
        }
    }

    /// Pull pending jobs, group them and persist every batch that is ready.
    /// Returns the new `Created` batches in assembly order.
    pub async fn run_once(&self) -> Result<Vec<Batch>, DispatchError> {
        let pending = self.intake.pull_pending(self.pull_limit).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let assembled = assemble(&pending, self.max_batch_size, self.max_wait, now)?;
        let mut created = Vec::with_capacity(assembled.len());

        for group in assembled {
            let batch = Batch::new(new_batch_id(), &group.provider, &group.action, group.job_ids(), now);
            BatchRepo::create(self.store.as_ref(), &batch, self.batch_ttl).await?;

            if let Err(e) = self.intake.mark_assigned(&batch.job_ids, &batch.batch_id).await {
                tracing::error!(
                    batch_id = %batch.batch_id,
                    provider = %batch.provider,
                    error = %e,
                    "Failed to tag jobs with their batch, dropping the batch",
                );
                BatchRepo::fail(
                    self.store.as_ref(),
                    &batch.provider,
                    &batch.batch_id,
                    &[BatchStatus::Created],
                    BatchFailure::Aborted,
                    self.clock.now(),
                )
                .await?;
                self.intake.requeue(&batch.job_ids).await?;
                continue;
            }

            tracing::info!(
                batch_id = %batch.batch_id,
                provider = %batch.provider,
                action = %batch.action,
                batch_size = batch.batch_size,
                "Batch assembled",
            );
            created.push(batch);
        }

        Ok(created)
    }
}
