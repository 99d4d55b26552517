//! Batch records, status state machine and the pure assembly algorithm.
//!
//! A batch groups pending jobs that share a provider and an action so that
//! one authenticated session (and one TOTP code) serves every job in it.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::{JobErrorKind, PendingJob};
use crate::types::{provider_key, BatchId, JobId, ServiceId, Timestamp, WorkerId};

// ---------------------------------------------------------------------------
// Store keys
// ---------------------------------------------------------------------------

/// Prefix shared by batch records and their heartbeat keys.
pub const BATCH_KEY_PREFIX: &str = "batch:";

/// Suffix distinguishing heartbeat keys from batch records.
pub const HEARTBEAT_KEY_SUFFIX: &str = ":heartbeat";

pub fn batch_key(provider: &str, batch_id: &str) -> String {
    format!("{BATCH_KEY_PREFIX}{provider}:{batch_id}")
}

pub fn heartbeat_key(provider: &str, batch_id: &str) -> String {
    format!("{BATCH_KEY_PREFIX}{provider}:{batch_id}{HEARTBEAT_KEY_SUFFIX}")
}

/// Per-job idempotency marker, scoped to the batch that carries the job.
pub fn job_marker_key(provider: &str, batch_id: &str, job_id: JobId) -> String {
    format!("job:{provider}:{batch_id}:{job_id}")
}

/// Generate a fresh, time-ordered batch id.
pub fn new_batch_id() -> BatchId {
    format!("batch_{}", uuid::Uuid::now_v7().simple())
}

/// Batch id used when the jobs of `base` are handed to another worker.
///
/// Ownership is immutable per batch id, so a reissue always gets a new id.
pub fn reissue_batch_id(base: &str, reissue: u32) -> BatchId {
    format!("{base}-r{reissue}")
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Created,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn valid_transitions(self) -> &'static [BatchStatus] {
        use BatchStatus::*;
        match self {
            Created => &[Assigned, Failed],
            Assigned => &[InProgress, Failed],
            InProgress => &[Completed, Failed],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition(self, to: BatchStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

/// Why a batch ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailure {
    /// The worker never acknowledged the handoff.
    Handoff,
    /// Every dispatch attempt failed or no worker was available.
    DispatchExhausted,
    /// The owning worker stopped refreshing its heartbeat.
    Abandoned,
    /// Cancelled through the dispatcher.
    Aborted,
    /// No execution unit could be made ready.
    Provisioning,
    /// Every job was attempted but at least one failed under
    /// [`BatchTerminalPolicy::AllSucceeded`].
    JobsFailed,
}

/// What terminal status a fully attempted batch receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchTerminalPolicy {
    /// `Completed` once every job reached a terminal outcome.
    #[default]
    AllAttempted,
    /// `Completed` only if every job succeeded, `Failed` otherwise.
    AllSucceeded,
}

impl FromStr for BatchTerminalPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all-attempted" => Ok(Self::AllAttempted),
            "all-succeeded" => Ok(Self::AllSucceeded),
            other => Err(CoreError::Validation(format!(
                "Unknown batch terminal policy '{other}' (expected all-attempted or all-succeeded)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch record
// ---------------------------------------------------------------------------

/// The batch record as persisted under [`batch_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub provider: String,
    pub action: String,
    pub worker_id: Option<WorkerId>,
    pub totp_code: Option<String>,
    pub session_id: Option<String>,
    pub service_id: Option<ServiceId>,
    /// Ordered at assembly time and never modified afterwards.
    pub job_ids: Vec<JobId>,
    pub status: BatchStatus,
    pub failure: Option<BatchFailure>,
    pub batch_size: u32,
    pub jobs_completed: u32,
    pub jobs_failed: u32,
    pub relogin_attempted: bool,
    /// Once set, every remaining job fails with this kind.
    pub session_terminal: Option<JobErrorKind>,
    /// Batch whose unfinished jobs this batch carries, if any.
    pub parent_batch_id: Option<BatchId>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl Batch {
    pub fn new(
        batch_id: BatchId,
        provider: impl Into<String>,
        action: impl Into<String>,
        job_ids: Vec<JobId>,
        now: Timestamp,
    ) -> Self {
        let batch_size = job_ids.len() as u32;
        Self {
            batch_id,
            provider: provider.into(),
            action: action.into(),
            worker_id: None,
            totp_code: None,
            session_id: None,
            service_id: None,
            job_ids,
            status: BatchStatus::Created,
            failure: None,
            batch_size,
            jobs_completed: 0,
            jobs_failed: 0,
            relogin_attempted: false,
            session_terminal: None,
            parent_batch_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// A fresh `Created` batch carrying `job_ids` on behalf of `self`.
    pub fn derive(&self, batch_id: BatchId, job_ids: Vec<JobId>, now: Timestamp) -> Self {
        let mut batch = Batch::new(batch_id, &self.provider, &self.action, job_ids, now);
        batch.parent_batch_id = Some(self.batch_id.clone());
        batch
    }

    pub fn jobs_attempted(&self) -> u32 {
        self.jobs_completed + self.jobs_failed
    }

    pub fn is_fully_attempted(&self) -> bool {
        self.jobs_attempted() == self.batch_size
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.worker_id.as_deref() == Some(worker_id)
    }

    pub fn contains_job(&self, job_id: JobId) -> bool {
        self.job_ids.contains(&job_id)
    }

    /// Count one finished job. Refuses to exceed `batch_size`.
    pub fn record_outcome(&mut self, success: bool) -> Result<(), CoreError> {
        if self.jobs_attempted() >= self.batch_size {
            return Err(CoreError::InvariantViolation(format!(
                "batch {} already has {} of {} jobs attempted",
                self.batch_id,
                self.jobs_attempted(),
                self.batch_size
            )));
        }
        if success {
            self.jobs_completed += 1;
        } else {
            self.jobs_failed += 1;
        }
        Ok(())
    }

    /// Terminal status for a fully attempted batch under `policy`.
    pub fn terminal_status(&self, policy: BatchTerminalPolicy) -> (BatchStatus, Option<BatchFailure>) {
        match policy {
            BatchTerminalPolicy::AllAttempted => (BatchStatus::Completed, None),
            BatchTerminalPolicy::AllSucceeded if self.jobs_failed == 0 => {
                (BatchStatus::Completed, None)
            }
            BatchTerminalPolicy::AllSucceeded => {
                (BatchStatus::Failed, Some(BatchFailure::JobsFailed))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// A group of same-provider, same-action jobs ready to become a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledBatch {
    pub provider: String,
    pub action: String,
    pub jobs: Vec<PendingJob>,
}

impl AssembledBatch {
    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.id).collect()
    }
}

/// Group pending jobs into bounded batches.
///
/// Jobs are grouped strictly by `(provider, action)` and keep submission order
/// within a group. Providers are compared and emitted in their canonical
/// form (see [`provider_key`]). A group emits full batches of
/// `max_batch_size`; the remainder is emitted as a partial batch only once its oldest job has
/// waited longer than `max_wait`. Everything else stays pending.
pub fn assemble(
    pending: &[PendingJob],
    max_batch_size: usize,
    max_wait: Duration,
    now: Timestamp,
) -> Result<Vec<AssembledBatch>, CoreError> {
    if max_batch_size == 0 {
        return Err(CoreError::Validation(
            "max_batch_size must be at least 1".to_string(),
        ));
    }
    let max_wait = chrono::Duration::from_std(max_wait)
        .map_err(|e| CoreError::Validation(format!("max_wait out of range: {e}")))?;

    let mut ordered: Vec<&PendingJob> = pending.iter().collect();
    ordered.sort_by_key(|j| j.submitted_at);

    let mut groups: Vec<((String, &str), Vec<&PendingJob>)> = Vec::new();
    let mut index: HashMap<(String, &str), usize> = HashMap::new();
    for job in ordered {
        let key = (provider_key(&job.provider), job.action.as_str());
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(job);
    }

    let mut batches = Vec::new();
    for ((provider, action), jobs) in groups {
        let mut chunks = jobs.chunks(max_batch_size).peekable();
        while let Some(chunk) = chunks.next() {
            let is_remainder = chunks.peek().is_none() && chunk.len() < max_batch_size;
            if is_remainder {
                let waited = now - chunk[0].submitted_at;
                if waited <= max_wait {
                    continue;
                }
            }
            batches.push(AssembledBatch {
                provider: provider.clone(),
                action: action.to_string(),
                jobs: chunk.iter().map(|j| (*j).clone()).collect(),
            });
        }
    }

    Ok(batches)
}
