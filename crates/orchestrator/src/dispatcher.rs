//! Batch dispatcher.
//!
//! Ownership is persisted before any worker is contacted: the heartbeat key
//! is created with the chosen worker's id, then the batch record moves
//! `Created -> Assigned(worker)` by compare-and-set. Only then is the batch
//! handed off. A failed handoff re-issues the jobs under a derived batch id,
//! so a batch's `worker_id` never changes once written.

use std::sync::Arc;
use std::time::Duration;

use rpa_core::backoff::BackoffConfig;
use rpa_core::batch::{reissue_batch_id, Batch, BatchFailure, BatchStatus};
use rpa_core::clock::Clock;
use rpa_core::config::CoordinationConfig;
use rpa_core::job::JobStatus;
use rpa_core::types::{BatchId, JobId, WorkerId};
use rpa_core::wire::{BatchAssignment, WorkerStatus};
use rpa_core::worker_pool::{pick_least_loaded, RoundRobinCursor, WorkerEndpoint, WorkerSelection};
use rpa_store::cas::CasOutcome;
use rpa_store::intake::JobIntake;
use rpa_store::repositories::{BatchRepo, JobMarkerRepo};
use rpa_store::StateStore;

use crate::error::DispatchError;
use crate::totp::TotpCoordinator;
use crate::transport::WorkerTransport;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Handoff attempts per batch, each to a different worker.
    pub dispatch_attempts: u32,
    pub batch_ttl: Duration,
    pub heartbeat_ttl: Duration,
    pub selection: WorkerSelection,
    pub retry_backoff: BackoffConfig,
}

impl DispatcherConfig {
    pub fn from_coordination(config: &CoordinationConfig) -> Self {
        Self {
            dispatch_attempts: config.dispatch_attempts,
            batch_ttl: config.batch_ttl,
            heartbeat_ttl: config.heartbeat_ttl,
            selection: config.worker_selection,
            retry_backoff: BackoffConfig {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: 0.2,
            },
        }
    }
}

/// An acknowledged handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// The batch the worker owns. Differs from the input batch when the
    /// jobs had to be re-issued.
    pub batch_id: BatchId,
    pub worker_id: WorkerId,
    pub attempts: u32,
}

enum Handoff {
    Acknowledged(DispatchOutcome),
    Rejected(Batch),
}

pub struct BatchDispatcher {
    store: Arc<dyn StateStore>,
    intake: Arc<dyn JobIntake>,
    totp: Arc<TotpCoordinator>,
    transport: Arc<dyn WorkerTransport>,
    workers: Vec<WorkerEndpoint>,
    cursor: RoundRobinCursor,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl BatchDispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        intake: Arc<dyn JobIntake>,
        totp: Arc<TotpCoordinator>,
        transport: Arc<dyn WorkerTransport>,
        workers: Vec<WorkerEndpoint>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            intake,
            totp,
            transport,
            workers,
            cursor: RoundRobinCursor::default(),
            clock,
            config,
        }
    }

    pub fn workers(&self) -> &[WorkerEndpoint] {
        &self.workers
    }

    /// Hand a `Created` batch to one worker.
    ///
    /// Transport failures move on to a different worker under a re-issued
    /// batch id. When every attempt fails the last batch is marked failed
    /// and its jobs go back to pending.
    pub async fn dispatch(&self, batch: &Batch) -> Result<DispatchOutcome, DispatchError> {
        let base_id = batch.batch_id.clone();
        let attempts = self.config.dispatch_attempts.max(1);
        let mut current = batch.clone();
        let mut tried: Vec<WorkerId> = Vec::new();

        for attempt in 1..=attempts {
            let Some(worker) = self.select_worker(&tried).await else {
                if tried.is_empty() {
                    return Err(DispatchError::NoWorkers(current.batch_id));
                }
                break;
            };

            let final_failure = if attempt == attempts {
                BatchFailure::DispatchExhausted
            } else {
                BatchFailure::Handoff
            };
            match self.try_worker(&current, &worker, attempt, final_failure).await? {
                Handoff::Acknowledged(outcome) => return Ok(outcome),
                Handoff::Rejected(failed) => {
                    tried.push(worker.worker_id.clone());
                    if attempt == attempts {
                        self.intake.requeue(&failed.job_ids).await?;
                        return Err(DispatchError::Exhausted {
                            batch_id: failed.batch_id,
                            attempts,
                        });
                    }
                    current = self.reissue(&failed, &base_id, attempt).await?;
                    self.clock
                        .sleep(self.config.retry_backoff.jittered_delay_for(attempt))
                        .await;
                }
            }
        }

        // Ran out of untried workers before running out of attempts.
        BatchRepo::fail(
            self.store.as_ref(),
            &current.provider,
            &current.batch_id,
            &[BatchStatus::Created],
            BatchFailure::DispatchExhausted,
            self.clock.now(),
        )
        .await?;
        self.intake.requeue(&current.job_ids).await?;
        Err(DispatchError::Exhausted {
            batch_id: current.batch_id,
            attempts: tried.len() as u32,
        })
    }

    /// One handoff of `batch` to `worker`.
    async fn try_worker(
        &self,
        batch: &Batch,
        worker: &WorkerEndpoint,
        attempt: u32,
        failure: BatchFailure,
    ) -> Result<Handoff, DispatchError> {
        let provider = batch.provider.as_str();
        let batch_id = batch.batch_id.as_str();

        if self.totp.provider_requires_totp(provider) {
            let reserved = self.totp.get_fresh_code(provider, batch_id).await?;
            let outcome =
                BatchRepo::set_totp_code(self.store.as_ref(), provider, batch_id, &reserved.code).await?;
            if let CasOutcome::Rejected(b) = outcome {
                return Err(ownership_lost(&b));
            }
        }

        if !BatchRepo::start_heartbeat(
            self.store.as_ref(),
            provider,
            batch_id,
            &worker.worker_id,
            self.config.heartbeat_ttl,
        )
        .await?
        {
            return Err(DispatchError::OwnershipLost {
                batch_id: batch_id.to_string(),
                reason: "another dispatcher is handing it off".to_string(),
            });
        }

        let claimed = match BatchRepo::claim(self.store.as_ref(), provider, batch_id, &worker.worker_id).await? {
            CasOutcome::Applied(b) => b,
            CasOutcome::Rejected(b) => {
                BatchRepo::clear_heartbeat(self.store.as_ref(), provider, batch_id).await?;
                return Err(ownership_lost(&b));
            }
        };

        let jobs = self.intake.fetch_jobs(&claimed.job_ids).await?;
        let assignment = BatchAssignment {
            batch_id: claimed.batch_id.clone(),
            provider: claimed.provider.clone(),
            action: claimed.action.clone(),
            totp_code: claimed.totp_code.clone(),
            jobs,
        };

        let acknowledged = DispatchOutcome {
            batch_id: claimed.batch_id.clone(),
            worker_id: worker.worker_id.clone(),
            attempts: attempt,
        };

        self.mark_dispatched(&claimed).await;

        match self.transport.hand_off(worker, &assignment).await {
            Ok(ack) if ack.accepted => {
                tracing::info!(
                    batch_id,
                    provider,
                    worker_id = %worker.worker_id,
                    attempt,
                    "Batch handed off",
                );
                return Ok(Handoff::Acknowledged(acknowledged));
            }
            Ok(ack) => tracing::warn!(
                batch_id,
                worker_id = %worker.worker_id,
                reason = ?ack.reason,
                "Worker declined batch",
            ),
            Err(e) => tracing::warn!(
                batch_id,
                worker_id = %worker.worker_id,
                error = %e,
                "Batch handoff failed",
            ),
        }

        // The worker may have accepted even though the response was lost.
        let outcome = BatchRepo::fail(
            self.store.as_ref(),
            provider,
            batch_id,
            &[BatchStatus::Assigned],
            failure,
            self.clock.now(),
        )
        .await?;
        match outcome {
            CasOutcome::Applied(failed) => {
                BatchRepo::clear_heartbeat(self.store.as_ref(), provider, batch_id).await?;
                Ok(Handoff::Rejected(failed))
            }
            CasOutcome::Rejected(b) if b.started_at.is_some() && b.is_owned_by(&worker.worker_id) => {
                tracing::info!(batch_id, worker_id = %worker.worker_id, "Worker accepted despite handoff error");
                Ok(Handoff::Acknowledged(acknowledged))
            }
            CasOutcome::Rejected(b) => Err(ownership_lost(&b)),
        }
    }

    /// Tell intake the jobs are on their way to a worker. A job the worker
    /// already started is left as it is.
    async fn mark_dispatched(&self, batch: &Batch) {
        for &job_id in &batch.job_ids {
            if let Err(e) = self.intake.mark_status(job_id, JobStatus::Dispatched).await {
                tracing::debug!(batch_id = %batch.batch_id, job_id, error = %e, "Job not marked dispatched");
            }
        }
    }

    /// Move the jobs of a failed handoff onto a derived batch.
    async fn reissue(&self, failed: &Batch, base_id: &str, attempt: u32) -> Result<Batch, DispatchError> {
        let next_id = reissue_batch_id(base_id, attempt);
        let moved = self.intake.reassign(&failed.job_ids, &next_id).await?;
        let next = failed.derive(next_id, moved, self.clock.now());
        BatchRepo::create(self.store.as_ref(), &next, self.config.batch_ttl).await?;
        tracing::info!(
            from = %failed.batch_id,
            batch_id = %next.batch_id,
            batch_size = next.batch_size,
            "Batch re-issued for another worker",
        );
        Ok(next)
    }

    async fn select_worker(&self, exclude: &[WorkerId]) -> Option<WorkerEndpoint> {
        match self.config.selection {
            WorkerSelection::RoundRobin => self.cursor.pick(&self.workers, exclude).cloned(),
            WorkerSelection::LeastLoaded => {
                let candidates: Vec<&WorkerEndpoint> = self
                    .workers
                    .iter()
                    .filter(|w| !exclude.contains(&w.worker_id))
                    .collect();
                let statuses = futures::future::join_all(
                    candidates.iter().map(|w| self.transport.status(w)),
                )
                .await;
                let snapshot: Vec<(WorkerEndpoint, WorkerStatus)> = candidates
                    .into_iter()
                    .zip(statuses)
                    .filter_map(|(w, status)| match status {
                        Ok(s) => Some((w.clone(), s)),
                        Err(e) => {
                            tracing::debug!(worker_id = %w.worker_id, error = %e, "Worker status unavailable");
                            None
                        }
                    })
                    .collect();
                pick_least_loaded(&snapshot, exclude).cloned()
            }
        }
    }

    /// Dispatch every batch still waiting in `Created`, oldest first.
    pub async fn dispatch_created(&self) -> Result<usize, DispatchError> {
        let mut waiting: Vec<Batch> = BatchRepo::list(self.store.as_ref())
            .await?
            .into_iter()
            .filter(|b| b.status == BatchStatus::Created)
            .collect();
        waiting.sort_by_key(|b| b.created_at);

        let mut dispatched = 0;
        for batch in &waiting {
            match self.dispatch(batch).await {
                Ok(_) => dispatched += 1,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(batch_id = %batch.batch_id, error = %e, "Dispatch deferred");
                }
                Err(e) => {
                    tracing::error!(batch_id = %batch.batch_id, error = %e, "Dispatch failed");
                }
            }
        }
        Ok(dispatched)
    }

    /// Cancel an unfinished batch and return its unprocessed jobs to
    /// pending. The owning worker notices through its heartbeat.
    pub async fn abort(&self, provider: &str, batch_id: &str) -> Result<Vec<JobId>, DispatchError> {
        let outcome = BatchRepo::fail(
            self.store.as_ref(),
            provider,
            batch_id,
            &[BatchStatus::Created, BatchStatus::Assigned, BatchStatus::InProgress],
            BatchFailure::Aborted,
            self.clock.now(),
        )
        .await?;
        let batch = match outcome {
            CasOutcome::Applied(b) => b,
            CasOutcome::Rejected(b) => return Err(ownership_lost(&b)),
        };
        BatchRepo::clear_heartbeat(self.store.as_ref(), provider, batch_id).await?;

        let unfinished =
            JobMarkerRepo::unfinished(self.store.as_ref(), provider, batch_id, &batch.job_ids).await?;
        self.intake.requeue(&unfinished).await?;
        tracing::info!(batch_id, provider, requeued = unfinished.len(), "Batch aborted");
        Ok(unfinished)
    }
}

fn ownership_lost(batch: &Batch) -> DispatchError {
    DispatchError::OwnershipLost {
        batch_id: batch.batch_id.clone(),
        reason: format!("batch is {:?}", batch.status),
    }
}
