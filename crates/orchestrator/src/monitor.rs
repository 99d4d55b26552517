//! Abandoned-batch detection.
//!
//! A batch that is `Assigned` or `InProgress` without a live heartbeat has
//! lost its worker. Its unfinished jobs move to a fresh batch, which gets a
//! new code and a new session on whichever worker takes it.

use std::sync::Arc;
use std::time::Duration;

use rpa_core::batch::{new_batch_id, Batch, BatchFailure, BatchStatus};
use rpa_core::clock::Clock;
use rpa_core::types::{BatchId, JobId};
use rpa_store::cas::CasOutcome;
use rpa_store::intake::JobIntake;
use rpa_store::repositories::{BatchRepo, JobMarkerRepo};
use rpa_store::StateStore;

use crate::dispatcher::BatchDispatcher;
use crate::error::DispatchError;

/// Result of recovering one abandoned batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub abandoned: BatchId,
    /// Batch now carrying the unfinished jobs, if there were any.
    pub replacement: Option<BatchId>,
    pub requeued: Vec<JobId>,
    /// Whether the replacement was handed to a worker right away. If not,
    /// the regular dispatch sweep picks it up.
    pub dispatched: bool,
}

pub struct HeartbeatMonitor {
    store: Arc<dyn StateStore>,
    intake: Arc<dyn JobIntake>,
    dispatcher: Arc<BatchDispatcher>,
    clock: Arc<dyn Clock>,
    batch_ttl: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<dyn StateStore>,
        intake: Arc<dyn JobIntake>,
        dispatcher: Arc<BatchDispatcher>,
        clock: Arc<dyn Clock>,
        batch_ttl: Duration,
    ) -> Self {
        Self {
            store,
            intake,
            dispatcher,
            clock,
            batch_ttl,
        }
    }

    /// Owned batches whose heartbeat has expired.
    pub async fn detect_abandoned(&self) -> Result<Vec<Batch>, DispatchError> {
        let mut abandoned = Vec::new();
        for batch in BatchRepo::list(self.store.as_ref()).await? {
            if !matches!(batch.status, BatchStatus::Assigned | BatchStatus::InProgress) {
                continue;
            }
            if BatchRepo::heartbeat_owner(self.store.as_ref(), &batch.provider, &batch.batch_id)
                .await?
                .is_none()
            {
                abandoned.push(batch);
            }
        }
        Ok(abandoned)
    }

    /// Fail an abandoned batch and move its unfinished jobs to a new one.
    ///
    /// Returns `None` if the batch changed state in the meantime.
    pub async fn recover(&self, batch: &Batch) -> Result<Option<Recovery>, DispatchError> {
        let outcome = BatchRepo::fail(
            self.store.as_ref(),
            &batch.provider,
            &batch.batch_id,
            &[BatchStatus::Assigned, BatchStatus::InProgress],
            BatchFailure::Abandoned,
            self.clock.now(),
        )
        .await?;
        let abandoned = match outcome {
            CasOutcome::Applied(b) => b,
            CasOutcome::Rejected(_) => return Ok(None),
        };
        tracing::warn!(
            batch_id = %abandoned.batch_id,
            provider = %abandoned.provider,
            worker_id = ?abandoned.worker_id,
            jobs_attempted = abandoned.jobs_attempted(),
            batch_size = abandoned.batch_size,
            "Batch abandoned by its worker",
        );

        let unfinished = JobMarkerRepo::unfinished(
            self.store.as_ref(),
            &abandoned.provider,
            &abandoned.batch_id,
            &abandoned.job_ids,
        )
        .await?;
        if unfinished.is_empty() {
            return Ok(Some(Recovery {
                abandoned: abandoned.batch_id,
                replacement: None,
                requeued: Vec::new(),
                dispatched: false,
            }));
        }

        let replacement_id = new_batch_id();
        let moved = self.intake.reassign(&unfinished, &replacement_id).await?;
        if moved.is_empty() {
            return Ok(Some(Recovery {
                abandoned: abandoned.batch_id,
                replacement: None,
                requeued: Vec::new(),
                dispatched: false,
            }));
        }
        let replacement = abandoned.derive(replacement_id, moved.clone(), self.clock.now());
        BatchRepo::create(self.store.as_ref(), &replacement, self.batch_ttl).await?;
        tracing::info!(
            from = %abandoned.batch_id,
            batch_id = %replacement.batch_id,
            batch_size = replacement.batch_size,
            "Unfinished jobs moved to a new batch",
        );

        let dispatched = match self.dispatcher.dispatch(&replacement).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(batch_id = %replacement.batch_id, error = %e, "Replacement batch not dispatched yet");
                false
            }
        };

        Ok(Some(Recovery {
            abandoned: abandoned.batch_id,
            replacement: Some(replacement.batch_id),
            requeued: moved,
            dispatched,
        }))
    }

    /// Detect and recover every abandoned batch.
    pub async fn run_once(&self) -> Result<Vec<Recovery>, DispatchError> {
        let mut recovered = Vec::new();
        for batch in self.detect_abandoned().await? {
            match self.recover(&batch).await {
                Ok(Some(r)) => recovered.push(r),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(batch_id = %batch.batch_id, error = %e, "Failed to recover abandoned batch");
                }
            }
        }
        Ok(recovered)
    }
}
