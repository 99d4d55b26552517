//! In-process intake used by single-node runs and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use rpa_core::job::{Job, JobReport, JobStatus, PendingJob};
use rpa_core::types::{JobId, Timestamp};
use tokio::sync::Mutex;

use super::{IntakeError, JobIntake};

#[derive(Debug, Default)]
struct State {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
    reports: Vec<JobReport>,
}

#[derive(Debug, Default)]
pub struct MemoryIntake {
    state: Mutex<State>,
}

impl MemoryIntake {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submit(
        &self,
        provider: &str,
        action: &str,
        parameters: serde_json::Value,
        submitted_at: Timestamp,
    ) -> JobId {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(
            id,
            Job {
                id,
                provider: provider.to_string(),
                action: action.to_string(),
                parameters,
                status: JobStatus::Pending,
                batch_id: None,
                result: None,
                error: None,
                submitted_at,
                updated_at: submitted_at,
            },
        );
        id
    }

    pub async fn job(&self, id: JobId) -> Option<Job> {
        self.state.lock().await.jobs.get(&id).cloned()
    }

    pub async fn jobs_with_status(&self, status: JobStatus) -> Vec<Job> {
        let state = self.state.lock().await;
        state.jobs.values().filter(|j| j.status == status).cloned().collect()
    }

    /// Every report received, in arrival order.
    pub async fn reports(&self) -> Vec<JobReport> {
        self.state.lock().await.reports.clone()
    }
}

fn transition(job: &mut Job, to: JobStatus) -> Result<(), IntakeError> {
    if !job.status.can_transition(to) {
        return Err(IntakeError::InvalidTransition {
            job_id: job.id,
            from: job.status,
            to,
        });
    }
    job.status = to;
    job.updated_at = Utc::now();
    Ok(())
}

#[async_trait]
impl JobIntake for MemoryIntake {
    async fn pull_pending(&self, limit: usize) -> Result<Vec<PendingJob>, IntakeError> {
        let state = self.state.lock().await;
        let mut pending: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|j| (j.submitted_at, j.id));
        Ok(pending.into_iter().take(limit).map(Job::to_pending).collect())
    }

    async fn mark_assigned(&self, job_ids: &[JobId], batch_id: &str) -> Result<(), IntakeError> {
        let mut state = self.state.lock().await;
        for id in job_ids {
            let job = state.jobs.get_mut(id).ok_or(IntakeError::NotFound(*id))?;
            transition(job, JobStatus::Assigned)?;
            job.batch_id = Some(batch_id.to_string());
        }
        Ok(())
    }

    async fn mark_status(&self, job_id: JobId, status: JobStatus) -> Result<(), IntakeError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&job_id).ok_or(IntakeError::NotFound(job_id))?;
        transition(job, status)
    }

    async fn fetch_jobs(&self, job_ids: &[JobId]) -> Result<Vec<PendingJob>, IntakeError> {
        let state = self.state.lock().await;
        job_ids
            .iter()
            .map(|id| {
                state
                    .jobs
                    .get(id)
                    .map(Job::to_pending)
                    .ok_or(IntakeError::NotFound(*id))
            })
            .collect()
    }

    async fn report(&self, report: &JobReport) -> Result<(), IntakeError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&report.job_id)
            .ok_or(IntakeError::NotFound(report.job_id))?;
        if job.status != JobStatus::Running {
            // Jobs can finish without an explicit running update (e.g. a
            // batch whose session was already lost).
            if job.status.can_transition(JobStatus::Running) {
                transition(job, JobStatus::Running)?;
            }
        }
        transition(job, report.status)?;
        job.result = report.result.clone();
        job.error = report.error.clone();
        state.reports.push(report.clone());
        Ok(())
    }

    async fn requeue(&self, job_ids: &[JobId]) -> Result<(), IntakeError> {
        let mut state = self.state.lock().await;
        for id in job_ids {
            let job = state.jobs.get_mut(id).ok_or(IntakeError::NotFound(*id))?;
            if job.status.is_terminal() || job.status == JobStatus::Pending {
                continue;
            }
            transition(job, JobStatus::Pending)?;
            job.batch_id = None;
        }
        Ok(())
    }

    async fn reassign(&self, job_ids: &[JobId], batch_id: &str) -> Result<Vec<JobId>, IntakeError> {
        let mut state = self.state.lock().await;
        let mut moved = Vec::with_capacity(job_ids.len());
        for id in job_ids {
            let job = state.jobs.get_mut(id).ok_or(IntakeError::NotFound(*id))?;
            if job.status.is_terminal() {
                continue;
            }
            job.status = JobStatus::Assigned;
            job.batch_id = Some(batch_id.to_string());
            job.updated_at = Utc::now();
            moved.push(*id);
        }
        Ok(moved)
    }
}
