//! Worker registry parsing, load scoring and selection strategies.
//!
//! Pure functions used by the dispatcher. The live load figures come from
//! each worker's status endpoint.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::WorkerId;
use crate::wire::WorkerStatus;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Weight of the active-batch ratio in the load score.
pub const LOAD_WEIGHT_BATCHES: f64 = 0.7;

/// Weight of the in-flight job count in the load score.
pub const LOAD_WEIGHT_JOBS: f64 = 0.3;

/// In-flight jobs at which a worker counts as fully loaded for scoring.
pub const MAX_JOBS_FOR_SCORING: u32 = 8;

/// Maximum length of a worker id.
const MAX_WORKER_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A worker the dispatcher can hand batches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    pub worker_id: WorkerId,
    pub url: String,
}

/// Parse a `WORKER_URLS` style list: `worker-a=http://host:8081,worker-b=http://host:8082`.
pub fn parse_worker_endpoints(raw: &str) -> Result<Vec<WorkerEndpoint>, CoreError> {
    let mut endpoints: Vec<WorkerEndpoint> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, url) = entry.split_once('=').ok_or_else(|| {
            CoreError::Validation(format!("Worker entry '{entry}' must look like id=url"))
        })?;
        let id = id.trim();
        validate_worker_id(id)?;
        if endpoints.iter().any(|e| e.worker_id == id) {
            return Err(CoreError::Validation(format!("Duplicate worker id '{id}'")));
        }
        endpoints.push(WorkerEndpoint {
            worker_id: id.to_string(),
            url: url.trim().trim_end_matches('/').to_string(),
        });
    }
    Ok(endpoints)
}

/// Worker ids are embedded in store values and logs, so keep them plain.
pub fn validate_worker_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation("Worker id must not be empty".to_string()));
    }
    if id.len() > MAX_WORKER_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Worker id must not exceed {MAX_WORKER_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(
            "Worker id may only contain alphanumeric characters, hyphens, underscores, or dots"
                .to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Load scoring
// ---------------------------------------------------------------------------

/// Composite load in `0.0..=1.0`, 0 meaning idle.
pub fn calculate_load_score(status: &WorkerStatus) -> f64 {
    let capacity = status.capacity.max(1) as f64;
    let batch_norm = (status.active_batches as f64 / capacity).clamp(0.0, 1.0);
    let job_norm = (status.active_jobs as f64 / MAX_JOBS_FOR_SCORING as f64).clamp(0.0, 1.0);
    (LOAD_WEIGHT_BATCHES * batch_norm + LOAD_WEIGHT_JOBS * job_norm).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerSelection {
    #[default]
    RoundRobin,
    LeastLoaded,
}

impl FromStr for WorkerSelection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "least-loaded" => Ok(Self::LeastLoaded),
            other => Err(CoreError::Validation(format!(
                "Unknown worker selection '{other}' (expected round-robin or least-loaded)"
            ))),
        }
    }
}

/// Round-robin cursor shared across dispatch calls.
#[derive(Debug, Default)]
pub struct RoundRobinCursor(AtomicUsize);

impl RoundRobinCursor {
    /// Next worker after the cursor that is not excluded.
    pub fn pick<'a>(
        &self,
        workers: &'a [WorkerEndpoint],
        exclude: &[WorkerId],
    ) -> Option<&'a WorkerEndpoint> {
        if workers.is_empty() {
            return None;
        }
        let start = self.0.fetch_add(1, Ordering::Relaxed);
        (0..workers.len())
            .map(|offset| &workers[(start + offset) % workers.len()])
            .find(|w| !exclude.contains(&w.worker_id))
    }
}

/// Least-loaded worker among those that reported status and have spare
/// capacity. Ties go to the lower worker id so selection is deterministic.
pub fn pick_least_loaded<'a>(
    candidates: &'a [(WorkerEndpoint, WorkerStatus)],
    exclude: &[WorkerId],
) -> Option<&'a WorkerEndpoint> {
    candidates
        .iter()
        .filter(|(w, s)| !exclude.contains(&w.worker_id) && s.has_capacity())
        .min_by(|(wa, sa), (wb, sb)| {
            calculate_load_score(sa)
                .total_cmp(&calculate_load_score(sb))
                .then_with(|| wa.worker_id.cmp(&wb.worker_id))
        })
        .map(|(w, _)| w)
}
