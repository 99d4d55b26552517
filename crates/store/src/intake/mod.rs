//! Job intake: the external system that owns job persistence.
//!
//! The coordination layer pulls pending jobs, tags them with their batch and
//! reports each terminal outcome as soon as it is known.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use rpa_core::job::{JobReport, JobStatus, PendingJob};
use rpa_core::types::JobId;

pub use http::HttpJobIntake;
pub use memory::MemoryIntake;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Intake API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {job_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

impl IntakeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IntakeError::Request(_) => true,
            IntakeError::Api { status, .. } => *status >= 500,
            IntakeError::NotFound(_) | IntakeError::InvalidTransition { .. } => false,
        }
    }
}

#[async_trait]
pub trait JobIntake: Send + Sync {
    /// Up to `limit` pending jobs in submission order.
    async fn pull_pending(&self, limit: usize) -> Result<Vec<PendingJob>, IntakeError>;

    /// Tag jobs with the batch that now carries them.
    async fn mark_assigned(&self, job_ids: &[JobId], batch_id: &str) -> Result<(), IntakeError>;

    async fn mark_status(&self, job_id: JobId, status: JobStatus) -> Result<(), IntakeError>;

    /// Look up jobs by id, in the order given. Unknown ids are an error.
    async fn fetch_jobs(&self, job_ids: &[JobId]) -> Result<Vec<PendingJob>, IntakeError>;

    /// Record a terminal outcome for one job.
    async fn report(&self, report: &JobReport) -> Result<(), IntakeError>;

    /// Return non-terminal jobs to pending.
    async fn requeue(&self, job_ids: &[JobId]) -> Result<(), IntakeError>;

    /// Move non-terminal jobs onto another batch, back in `Assigned`.
    /// Returns the jobs that moved; terminal ones are left alone.
    async fn reassign(&self, job_ids: &[JobId], batch_id: &str) -> Result<Vec<JobId>, IntakeError>;
}
