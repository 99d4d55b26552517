//! Messages exchanged between the dispatcher and workers.

use serde::{Deserialize, Serialize};

use crate::job::{JobReport, JobStatus, PendingJob};
use crate::types::{BatchId, WorkerId};

/// Handoff of a whole batch to its owning worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAssignment {
    pub batch_id: BatchId,
    pub provider: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_code: Option<String>,
    /// In batch order.
    pub jobs: Vec<PendingJob>,
}

impl BatchAssignment {
    pub fn request_for(&self, job: &PendingJob, session_id: Option<String>) -> DispatchRequest {
        DispatchRequest {
            batch_id: self.batch_id.clone(),
            provider: self.provider.clone(),
            action: self.action.clone(),
            totp_code: self.totp_code.clone(),
            session_id,
            job: job.clone(),
        }
    }
}

/// Worker's answer to a [`BatchAssignment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAck {
    pub batch_id: BatchId,
    pub worker_id: WorkerId,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-job dispatch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub batch_id: BatchId,
    pub provider: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub job: PendingJob,
}

/// Outcome of one job as seen on the dispatch transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Completed,
    Failed,
    /// Another delivery of the same job is still running.
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub status: DispatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobReport>,
}

impl DispatchResponse {
    pub fn from_report(report: JobReport) -> Self {
        let status = match report.status {
            JobStatus::Completed => DispatchStatus::Completed,
            _ => DispatchStatus::Failed,
        };
        Self {
            status,
            result: Some(report),
        }
    }

    pub fn in_progress() -> Self {
        Self {
            status: DispatchStatus::InProgress,
            result: None,
        }
    }
}

/// Load snapshot served by a worker's status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub active_batches: u32,
    pub active_jobs: u32,
    pub capacity: u32,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
}

impl WorkerStatus {
    pub fn has_capacity(&self) -> bool {
        self.active_batches < self.capacity
    }
}
