//! Jobs as seen by the coordination layer.
//!
//! The job intake system owns persistence. The coordination layer only reads
//! pending jobs, tags them with a batch, and reports terminal outcomes.

use serde::{Deserialize, Serialize};

use crate::types::{BatchId, JobId, Timestamp};

/// Lifecycle of a job inside the intake system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    Dispatched,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Statuses reachable from `self`. Terminal statuses return an empty slice.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Pending => &[Assigned],
            // Assigned -> Pending on requeue, -> Failed when a batch fails
            // before the job was attempted.
            Assigned => &[Dispatched, Running, Pending, Failed],
            Dispatched => &[Running, Pending, Failed],
            Running => &[Completed, Failed, Pending],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition(self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Assigned => "assigned",
            JobStatus::Dispatched => "dispatched",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// A job as yielded by the intake pull interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingJob {
    pub id: JobId,
    pub provider: String,
    pub action: String,
    pub parameters: serde_json::Value,
    pub submitted_at: Timestamp,
}

/// Full job row as held by an intake backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub provider: String,
    pub action: String,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    pub batch_id: Option<BatchId>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub submitted_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    pub fn to_pending(&self) -> PendingJob {
        PendingJob {
            id: self.id,
            provider: self.provider.clone(),
            action: self.action.clone(),
            parameters: self.parameters.clone(),
            submitted_at: self.submitted_at,
        }
    }
}

/// Typed terminal failure categories surfaced to the intake system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The authenticated session was lost and could not be re-established.
    SessionExpired,
    /// The initial portal login was rejected.
    LoginFailed,
    /// No execution unit could be made ready.
    Provisioning,
    /// The provider automation reported a failure for this job.
    Automation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Completion report sent to the intake system once per attempted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobReport {
    pub fn completed(job_id: JobId, result: serde_json::Value) -> Self {
        Self {
            job_id,
            status: JobStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(job_id: JobId, error: JobError) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}
