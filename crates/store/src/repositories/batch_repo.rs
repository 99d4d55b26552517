//! Batch records and their liveness heartbeats.
//!
//! Every mutation goes through [`update_json`], so ownership checks and
//! counter increments are evaluated against the latest stored record.

use std::time::Duration;

use rpa_core::batch::{
    batch_key, heartbeat_key, Batch, BatchFailure, BatchStatus, BatchTerminalPolicy,
    BATCH_KEY_PREFIX, HEARTBEAT_KEY_SUFFIX,
};
use rpa_core::job::JobErrorKind;
use rpa_core::types::Timestamp;

use crate::cas::{load_json, update_json, CasOutcome};
use crate::error::StoreError;
use crate::store::{Expiry, StateStore};

pub struct BatchRepo;

impl BatchRepo {
    // ── Records ──────────────────────────────────────────────────────────

    /// Persist a new batch. Fails with [`StoreError::AlreadyExists`] if the
    /// id is taken.
    pub async fn create(store: &dyn StateStore, batch: &Batch, ttl: Duration) -> Result<(), StoreError> {
        let key = batch_key(&batch.provider, &batch.batch_id);
        let value = serde_json::to_string(batch)?;
        if store.set_nx(&key, &value, Expiry::After(ttl)).await? {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists(key))
        }
    }

    pub async fn find(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
    ) -> Result<Option<Batch>, StoreError> {
        load_json(store, &batch_key(provider, batch_id)).await
    }

    pub async fn get(store: &dyn StateStore, provider: &str, batch_id: &str) -> Result<Batch, StoreError> {
        Self::find(store, provider, batch_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(batch_key(provider, batch_id)))
    }

    /// Every live batch record. Unreadable records are skipped.
    pub async fn list(store: &dyn StateStore) -> Result<Vec<Batch>, StoreError> {
        let entries = store.scan_prefix(BATCH_KEY_PREFIX).await?;
        let mut batches = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key.ends_with(HEARTBEAT_KEY_SUFFIX) {
                continue;
            }
            match serde_json::from_str::<Batch>(&value) {
                Ok(batch) => batches.push(batch),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable batch record"),
            }
        }
        Ok(batches)
    }

    /// Conditional update of a batch record; its TTL is preserved.
    pub async fn update<F>(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        mutate: F,
    ) -> Result<CasOutcome<Batch>, StoreError>
    where
        F: FnMut(&mut Batch) -> Result<bool, rpa_core::error::CoreError> + Send,
    {
        update_json(store, &batch_key(provider, batch_id), Expiry::Keep, mutate).await
    }

    // ── Ownership ────────────────────────────────────────────────────────

    /// Record the TOTP code reserved for a batch that is not yet assigned,
    /// replacing any code left over from an earlier dispatch attempt.
    pub async fn set_totp_code(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        code: &str,
    ) -> Result<CasOutcome<Batch>, StoreError> {
        Self::update(store, provider, batch_id, |b| {
            if b.status != BatchStatus::Created || b.worker_id.is_some() {
                return Ok(false);
            }
            b.totp_code = Some(code.to_string());
            Ok(true)
        })
        .await
    }

    /// `Created -> Assigned(worker_id)`. Loses if any worker already owns it.
    pub async fn claim(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        worker_id: &str,
    ) -> Result<CasOutcome<Batch>, StoreError> {
        Self::update(store, provider, batch_id, |b| {
            if b.status != BatchStatus::Created || b.worker_id.is_some() {
                return Ok(false);
            }
            b.status = BatchStatus::Assigned;
            b.worker_id = Some(worker_id.to_string());
            Ok(true)
        })
        .await
    }

    /// `Assigned -> InProgress`, only by the assigned worker.
    pub async fn accept(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        worker_id: &str,
        now: Timestamp,
    ) -> Result<CasOutcome<Batch>, StoreError> {
        Self::update(store, provider, batch_id, |b| {
            if b.status != BatchStatus::Assigned || !b.is_owned_by(worker_id) {
                return Ok(false);
            }
            b.status = BatchStatus::InProgress;
            b.started_at = Some(now);
            Ok(true)
        })
        .await
    }

    // ── Session ──────────────────────────────────────────────────────────

    /// Write the session established for the batch. Loses if a session is
    /// already attached or the worker no longer owns the batch.
    pub async fn attach_session(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        worker_id: &str,
        session_id: &str,
        service_id: &str,
    ) -> Result<CasOutcome<Batch>, StoreError> {
        Self::update(store, provider, batch_id, |b| {
            if b.status != BatchStatus::InProgress
                || !b.is_owned_by(worker_id)
                || b.session_id.is_some()
            {
                return Ok(false);
            }
            b.session_id = Some(session_id.to_string());
            b.service_id = Some(service_id.to_string());
            Ok(true)
        })
        .await
    }

    /// Consume the batch's single re-login allowance.
    pub async fn take_relogin(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        worker_id: &str,
    ) -> Result<CasOutcome<Batch>, StoreError> {
        Self::update(store, provider, batch_id, |b| {
            if b.status != BatchStatus::InProgress || !b.is_owned_by(worker_id) || b.relogin_attempted {
                return Ok(false);
            }
            b.relogin_attempted = true;
            Ok(true)
        })
        .await
    }

    /// Mark the session unusable; every remaining job fails with `kind`.
    pub async fn mark_session_terminal(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        worker_id: &str,
        kind: JobErrorKind,
    ) -> Result<CasOutcome<Batch>, StoreError> {
        Self::update(store, provider, batch_id, |b| {
            if !b.is_owned_by(worker_id) || b.session_terminal.is_some() {
                return Ok(false);
            }
            b.session_terminal = Some(kind);
            Ok(true)
        })
        .await
    }

    // ── Progress ─────────────────────────────────────────────────────────

    /// Count one finished job on a batch the worker still owns.
    ///
    /// Exceeding `batch_size` surfaces as [`StoreError::Core`] with an
    /// invariant violation.
    pub async fn record_outcome(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        worker_id: &str,
        success: bool,
    ) -> Result<CasOutcome<Batch>, StoreError> {
        Self::update(store, provider, batch_id, |b| {
            if b.status != BatchStatus::InProgress || !b.is_owned_by(worker_id) {
                return Ok(false);
            }
            b.record_outcome(success)?;
            Ok(true)
        })
        .await
    }

    /// Set the terminal status of a fully attempted batch. Only the first
    /// caller wins.
    pub async fn finalize(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        worker_id: &str,
        policy: BatchTerminalPolicy,
        now: Timestamp,
    ) -> Result<CasOutcome<Batch>, StoreError> {
        Self::update(store, provider, batch_id, |b| {
            if b.status != BatchStatus::InProgress
                || !b.is_owned_by(worker_id)
                || !b.is_fully_attempted()
            {
                return Ok(false);
            }
            let (status, failure) = b.terminal_status(policy);
            b.status = status;
            b.failure = failure;
            b.completed_at = Some(now);
            Ok(true)
        })
        .await
    }

    /// Move a batch in one of `from` to `Failed(failure)`.
    pub async fn fail(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        from: &[BatchStatus],
        failure: BatchFailure,
        now: Timestamp,
    ) -> Result<CasOutcome<Batch>, StoreError> {
        Self::update(store, provider, batch_id, |b| {
            if !from.contains(&b.status) {
                return Ok(false);
            }
            b.status = BatchStatus::Failed;
            b.failure = Some(failure);
            b.completed_at = Some(now);
            Ok(true)
        })
        .await
    }

    // ── Heartbeat ────────────────────────────────────────────────────────

    /// Create the heartbeat with the owning worker's id. Only one caller
    /// can start it; `false` means someone else is already dispatching.
    pub async fn start_heartbeat(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        store
            .set_nx(&heartbeat_key(provider, batch_id), worker_id, Expiry::After(ttl))
            .await
    }

    /// Extend the heartbeat if it is still held by `worker_id`.
    ///
    /// An expired heartbeat cannot be revived: `false` means the worker has
    /// lost the batch.
    pub async fn refresh_heartbeat(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        store
            .compare_and_set(
                &heartbeat_key(provider, batch_id),
                worker_id,
                worker_id,
                Expiry::After(ttl),
            )
            .await
    }

    pub async fn heartbeat_owner(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
    ) -> Result<Option<String>, StoreError> {
        store.get(&heartbeat_key(provider, batch_id)).await
    }

    pub async fn clear_heartbeat(
        store: &dyn StateStore,
        provider: &str,
        batch_id: &str,
    ) -> Result<(), StoreError> {
        store.delete(&heartbeat_key(provider, batch_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryStore;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use rpa_core::error::CoreError;

    const TTL: Duration = Duration::from_secs(3600);

    async fn seeded(store: &MemoryStore, size: usize) -> Batch {
        let batch = Batch::new("b1".into(), "acme", "login", (1..=size as i64).collect(), Utc::now());
        BatchRepo::create(store, &batch, TTL).await.unwrap();
        batch
    }

    async fn in_progress(store: &MemoryStore, size: usize, worker: &str) -> Batch {
        seeded(store, size).await;
        BatchRepo::claim(store, "acme", "b1", worker).await.unwrap();
        BatchRepo::accept(store, "acme", "b1", worker, Utc::now())
            .await
            .unwrap()
            .into_inner()
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = MemoryStore::new();
        let batch = seeded(&store, 3).await;
        assert_matches!(
            BatchRepo::create(&store, &batch, TTL).await,
            Err(StoreError::AlreadyExists(_))
        );
    }

    #[tokio::test]
    async fn worker_id_never_changes_once_claimed() {
        let store = MemoryStore::new();
        seeded(&store, 3).await;
        assert!(BatchRepo::claim(&store, "acme", "b1", "w1").await.unwrap().is_applied());
        let second = BatchRepo::claim(&store, "acme", "b1", "w2").await.unwrap();
        assert!(!second.is_applied());
        let batch = BatchRepo::get(&store, "acme", "b1").await.unwrap();
        assert_eq!(batch.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        seeded(&store, 3).await;
        let tasks = (0..16).map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                BatchRepo::claim(store.as_ref(), "acme", "b1", &format!("w{i}"))
                    .await
                    .unwrap()
                    .is_applied()
            })
        });
        let wins = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn only_assigned_worker_can_accept() {
        let store = MemoryStore::new();
        seeded(&store, 3).await;
        BatchRepo::claim(&store, "acme", "b1", "w1").await.unwrap();
        assert!(!BatchRepo::accept(&store, "acme", "b1", "w2", Utc::now())
            .await
            .unwrap()
            .is_applied());
        let accepted = BatchRepo::accept(&store, "acme", "b1", "w1", Utc::now())
            .await
            .unwrap();
        assert_matches!(accepted, CasOutcome::Applied(b) if b.status == BatchStatus::InProgress);
    }

    #[tokio::test]
    async fn counters_never_exceed_batch_size() {
        let store = MemoryStore::new();
        in_progress(&store, 2, "w1").await;
        BatchRepo::record_outcome(&store, "acme", "b1", "w1", true).await.unwrap();
        BatchRepo::record_outcome(&store, "acme", "b1", "w1", false).await.unwrap();
        let over = BatchRepo::record_outcome(&store, "acme", "b1", "w1", true).await;
        assert_matches!(over, Err(StoreError::Core(CoreError::InvariantViolation(_))));

        let batch = BatchRepo::get(&store, "acme", "b1").await.unwrap();
        assert_eq!(batch.jobs_completed, 1);
        assert_eq!(batch.jobs_failed, 1);
    }

    #[tokio::test]
    async fn concurrent_outcomes_are_all_counted() {
        let store = Arc::new(MemoryStore::new());
        in_progress(&store, 20, "w1").await;
        let tasks = (0..20).map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                BatchRepo::record_outcome(store.as_ref(), "acme", "b1", "w1", i % 2 == 0)
                    .await
                    .unwrap()
            })
        });
        futures::future::join_all(tasks).await;
        let batch = BatchRepo::get(store.as_ref(), "acme", "b1").await.unwrap();
        assert_eq!(batch.jobs_completed, 10);
        assert_eq!(batch.jobs_failed, 10);
    }

    #[tokio::test]
    async fn finalize_happens_once_and_only_when_fully_attempted() {
        let store = MemoryStore::new();
        in_progress(&store, 1, "w1").await;
        let early = BatchRepo::finalize(&store, "acme", "b1", "w1", BatchTerminalPolicy::AllAttempted, Utc::now())
            .await
            .unwrap();
        assert!(!early.is_applied());

        BatchRepo::record_outcome(&store, "acme", "b1", "w1", true).await.unwrap();
        let first = BatchRepo::finalize(&store, "acme", "b1", "w1", BatchTerminalPolicy::AllAttempted, Utc::now())
            .await
            .unwrap();
        assert_matches!(first, CasOutcome::Applied(b) if b.status == BatchStatus::Completed);
        let second = BatchRepo::finalize(&store, "acme", "b1", "w1", BatchTerminalPolicy::AllAttempted, Utc::now())
            .await
            .unwrap();
        assert!(!second.is_applied());
    }

    #[tokio::test]
    async fn session_attaches_once() {
        let store = MemoryStore::new();
        in_progress(&store, 2, "w1").await;
        assert!(BatchRepo::attach_session(&store, "acme", "b1", "w1", "s1", "u1")
            .await
            .unwrap()
            .is_applied());
        let again = BatchRepo::attach_session(&store, "acme", "b1", "w1", "s2", "u2")
            .await
            .unwrap();
        assert_matches!(again, CasOutcome::Rejected(b) if b.session_id.as_deref() == Some("s1"));
    }

    #[tokio::test]
    async fn relogin_allowance_is_single_use() {
        let store = MemoryStore::new();
        in_progress(&store, 2, "w1").await;
        assert!(BatchRepo::take_relogin(&store, "acme", "b1", "w1").await.unwrap().is_applied());
        assert!(!BatchRepo::take_relogin(&store, "acme", "b1", "w1").await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn failed_batches_reject_worker_progress() {
        let store = MemoryStore::new();
        in_progress(&store, 2, "w1").await;
        BatchRepo::fail(
            &store,
            "acme",
            "b1",
            &[BatchStatus::InProgress],
            BatchFailure::Abandoned,
            Utc::now(),
        )
        .await
        .unwrap();
        let outcome = BatchRepo::record_outcome(&store, "acme", "b1", "w1", true).await.unwrap();
        assert!(!outcome.is_applied());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_heartbeat_cannot_be_refreshed() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(BatchRepo::start_heartbeat(&store, "acme", "b1", "w1", ttl).await.unwrap());
        assert!(!BatchRepo::start_heartbeat(&store, "acme", "b1", "w2", ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(BatchRepo::refresh_heartbeat(&store, "acme", "b1", "w1", ttl).await.unwrap());
        assert!(!BatchRepo::refresh_heartbeat(&store, "acme", "b1", "w2", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!BatchRepo::refresh_heartbeat(&store, "acme", "b1", "w1", ttl).await.unwrap());
        assert!(BatchRepo::heartbeat_owner(&store, "acme", "b1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_skips_heartbeat_keys() {
        let store = MemoryStore::new();
        seeded(&store, 1).await;
        assert!(BatchRepo::start_heartbeat(&store, "acme", "b1", "w1", TTL).await.unwrap());
        let batches = BatchRepo::list(&store).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].batch_id, "b1");
    }
}
