//! Per-job idempotency markers.
//!
//! A marker is claimed with set-if-not-exists before a job runs and
//! overwritten with the terminal report afterwards, so a redelivered job
//! either observes the in-flight claim or replays the recorded outcome.

use std::time::Duration;

use rpa_core::batch::job_marker_key;
use rpa_core::job::JobReport;
use rpa_core::types::{JobId, Timestamp, WorkerId};
use serde::{Deserialize, Serialize};

use crate::cas::load_json;
use crate::error::StoreError;
use crate::store::{Expiry, StateStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobMarker {
    InFlight {
        worker_id: WorkerId,
        started_at: Timestamp,
    },
    Terminal {
        report: JobReport,
    },
}

impl JobMarker {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobMarker::Terminal { .. })
    }
}

/// Outcome of [`JobMarkerRepo::claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerClaim {
    /// The caller owns this execution of the job.
    Claimed,
    /// Another delivery is executing the job.
    InFlight { worker_id: WorkerId },
    /// The job already finished; replay this report.
    Terminal(JobReport),
}

pub struct JobMarkerRepo;

impl JobMarkerRepo {
    pub async fn claim(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        job_id: JobId,
        worker_id: &str,
        now: Timestamp,
        ttl: Duration,
    ) -> Result<MarkerClaim, StoreError> {
        let key = job_marker_key(provider, batch_id, job_id);
        let marker = JobMarker::InFlight {
            worker_id: worker_id.to_string(),
            started_at: now,
        };
        if store
            .set_nx(&key, &serde_json::to_string(&marker)?, Expiry::After(ttl))
            .await?
        {
            return Ok(MarkerClaim::Claimed);
        }
        match load_json::<JobMarker>(store, &key).await? {
            Some(JobMarker::Terminal { report }) => Ok(MarkerClaim::Terminal(report)),
            Some(JobMarker::InFlight { worker_id, .. }) => Ok(MarkerClaim::InFlight { worker_id }),
            // Expired between the two calls; report it as still running.
            None => Ok(MarkerClaim::InFlight {
                worker_id: worker_id.to_string(),
            }),
        }
    }

    pub async fn complete(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        report: &JobReport,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let marker = JobMarker::Terminal {
            report: report.clone(),
        };
        store
            .set(
                &job_marker_key(provider, batch_id, report.job_id),
                &serde_json::to_string(&marker)?,
                Expiry::After(ttl),
            )
            .await
    }

    pub async fn find(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        job_id: JobId,
    ) -> Result<Option<JobMarker>, StoreError> {
        load_json(store, &job_marker_key(provider, batch_id, job_id)).await
    }

    /// Jobs of the batch without a terminal marker, in batch order.
    pub async fn unfinished(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        job_ids: &[JobId],
    ) -> Result<Vec<JobId>, StoreError> {
        let mut remaining = Vec::new();
        for &job_id in job_ids {
            let done = Self::find(store, provider, batch_id, job_id)
                .await?
                .is_some_and(|m| m.is_terminal());
            if !done {
                remaining.push(job_id);
            }
        }
        Ok(remaining)
    }
}
