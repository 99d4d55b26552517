//! Worker batch processor.
//!
//! A batch moves through `Received -> SessionEstablishing -> SessionReady ->
//! ProcessingJob(i).. -> Finalizing -> Completed`, or fails. Only the batch
//! record in the shared store says where it is: the first job attaches the
//! session, later jobs reuse it, and every finished job bumps the counters
//! that decide when the batch is done.
//!
//! Jobs run strictly in assembly order. Each job is guarded by an
//! idempotency marker, so a redelivered request either sees the in-flight
//! run or replays the recorded outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rpa_browser::{AutomationSession, ExecutionUnitError, ExecutionUnitManager};
use rpa_core::batch::{Batch, BatchFailure, BatchStatus, BatchTerminalPolicy};
use rpa_core::clock::Clock;
use rpa_core::config::CoordinationConfig;
use rpa_core::job::{JobError, JobErrorKind, JobReport, JobStatus};
use rpa_core::types::{BatchId, JobId, WorkerId};
use rpa_core::wire::{
    BatchAssignment, DispatchAck, DispatchRequest, DispatchResponse, WorkerStatus,
};
use rpa_store::cas::CasOutcome;
use rpa_store::intake::JobIntake;
use rpa_store::repositories::{BatchRepo, JobMarker, JobMarkerRepo, MarkerClaim, TotpRepo};
use rpa_store::{StateStore, StoreError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::automation::{ProviderAutomation, ProviderRegistry};
use crate::credentials::CredentialStore;
use crate::error::{AutomationError, ProcessorError};

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub worker_id: WorkerId,
    /// Batches processed concurrently.
    pub capacity: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_ttl: Duration,
    /// Lifetime of per-job idempotency markers.
    pub marker_ttl: Duration,
    pub terminal_policy: BatchTerminalPolicy,
}

impl ProcessorConfig {
    pub fn from_coordination(worker_id: WorkerId, capacity: u32, config: &CoordinationConfig) -> Self {
        Self {
            worker_id,
            capacity,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_ttl: config.heartbeat_ttl,
            marker_ttl: config.batch_ttl,
            terminal_policy: config.terminal_policy,
        }
    }
}

/// Why a batch has no usable session.
enum SessionFailure {
    /// No execution unit could be obtained. The batch fails as a whole.
    Provisioning(ExecutionUnitError),
    /// The session cannot be used; remaining jobs fail with this kind.
    Terminal(JobErrorKind, String),
    Processor(ProcessorError),
}

impl From<StoreError> for SessionFailure {
    fn from(e: StoreError) -> Self {
        SessionFailure::Processor(e.into())
    }
}

pub struct BatchProcessor {
    config: ProcessorConfig,
    store: Arc<dyn StateStore>,
    intake: Arc<dyn JobIntake>,
    units: Arc<ExecutionUnitManager>,
    automations: ProviderRegistry,
    credentials: CredentialStore,
    clock: Arc<dyn Clock>,
    active: Mutex<HashMap<BatchId, CancellationToken>>,
    active_jobs: AtomicU32,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl BatchProcessor {
    pub fn new(
        config: ProcessorConfig,
        store: Arc<dyn StateStore>,
        intake: Arc<dyn JobIntake>,
        units: Arc<ExecutionUnitManager>,
        automations: ProviderRegistry,
        credentials: CredentialStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            intake,
            units,
            automations,
            credentials,
            clock,
            active: Mutex::new(HashMap::new()),
            active_jobs: AtomicU32::new(0),
            jobs_processed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn active(&self) -> MutexGuard<'_, HashMap<BatchId, CancellationToken>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Handoff ──────────────────────────────────────────────────────────

    /// Take ownership of a handed-off batch and start processing it in the
    /// background. Declines when at capacity or when the batch is not
    /// assigned to this worker.
    pub async fn accept(self: &Arc<Self>, assignment: BatchAssignment) -> Result<DispatchAck, ProcessorError> {
        let batch_id = assignment.batch_id.clone();
        let ack = |accepted: bool, reason: Option<String>| DispatchAck {
            batch_id: batch_id.clone(),
            worker_id: self.config.worker_id.clone(),
            accepted,
            reason,
        };

        let cancel = {
            let mut active = self.active();
            if active.contains_key(&batch_id) {
                return Ok(ack(true, None));
            }
            if active.len() as u32 >= self.config.capacity {
                tracing::warn!(batch_id = %batch_id, capacity = self.config.capacity, "Declining batch, at capacity");
                return Ok(ack(false, Some("worker at capacity".to_string())));
            }
            let cancel = self.shutdown.child_token();
            active.insert(batch_id.clone(), cancel.clone());
            cancel
        };

        let outcome = BatchRepo::accept(
            self.store.as_ref(),
            &assignment.provider,
            &batch_id,
            &self.config.worker_id,
            self.clock.now(),
        )
        .await;
        match outcome {
            Ok(CasOutcome::Applied(_)) => {}
            Ok(CasOutcome::Rejected(b)) => {
                self.active().remove(&batch_id);
                tracing::warn!(
                    batch_id = %batch_id,
                    status = ?b.status,
                    owner = ?b.worker_id,
                    "Declining batch not assigned to this worker",
                );
                return Ok(ack(
                    false,
                    Some(format!("batch is {:?} for {:?}", b.status, b.worker_id)),
                ));
            }
            Err(e) => {
                self.active().remove(&batch_id);
                return Err(e.into());
            }
        }

        tracing::info!(
            batch_id = %batch_id,
            provider = %assignment.provider,
            jobs = assignment.jobs.len(),
            "Batch accepted",
        );
        self.tasks.spawn(Arc::clone(self).run_batch(assignment, cancel));
        Ok(ack(true, None))
    }

    /// Process every job of an accepted batch in order, then finalize.
    async fn run_batch(self: Arc<Self>, assignment: BatchAssignment, cancel: CancellationToken) {
        let provider = assignment.provider.clone();
        let batch_id = assignment.batch_id.clone();
        let stop_heartbeat = cancel.child_token();
        let heartbeat = tokio::spawn(Arc::clone(&self).keep_alive(
            provider.clone(),
            batch_id.clone(),
            cancel.clone(),
            stop_heartbeat.clone(),
        ));

        for job in &assignment.jobs {
            if cancel.is_cancelled() {
                tracing::warn!(batch_id = %batch_id, "Batch processing interrupted");
                break;
            }
            let request = assignment.request_for(job, None);
            match self.process_job(&request).await {
                Ok(response) => {
                    tracing::debug!(batch_id = %batch_id, job_id = job.id, status = ?response.status, "Job processed");
                }
                Err(e) => {
                    tracing::error!(batch_id = %batch_id, job_id = job.id, error = %e, "Batch processing stopped");
                    break;
                }
            }
        }

        stop_heartbeat.cancel();
        let _ = heartbeat.await;

        match self.finalize(&provider, &batch_id).await {
            Ok(Some(_)) => {}
            Ok(None) => self.release_unfinished(&provider, &batch_id).await,
            Err(e) => tracing::error!(batch_id = %batch_id, error = %e, "Failed to finalize batch"),
        }
        self.active().remove(&batch_id);
    }

    /// Refresh the batch heartbeat until `stop` fires. Losing the heartbeat
    /// cancels `owner`.
    async fn keep_alive(
        self: Arc<Self>,
        provider: String,
        batch_id: BatchId,
        owner: CancellationToken,
        stop: CancellationToken,
    ) {
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    match BatchRepo::refresh_heartbeat(
                        self.store.as_ref(),
                        &provider,
                        &batch_id,
                        &self.config.worker_id,
                        self.config.heartbeat_ttl,
                    )
                    .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(batch_id = %batch_id, "Heartbeat lost, giving up the batch");
                            owner.cancel();
                            break;
                        }
                        Err(e) => tracing::warn!(batch_id = %batch_id, error = %e, "Heartbeat refresh failed"),
                    }
                }
            }
        }
    }

    // ── Jobs ─────────────────────────────────────────────────────────────

    /// Run one job of a batch this worker owns and report its outcome.
    ///
    /// Redelivery of a finished job replays the recorded report without
    /// touching the provider. A delivery racing an in-flight run gets
    /// [`DispatchResponse::in_progress`].
    pub async fn process_job(&self, request: &DispatchRequest) -> Result<DispatchResponse, ProcessorError> {
        let provider = request.provider.as_str();
        let batch_id = request.batch_id.as_str();
        let job_id = request.job.id;

        if let Some(JobMarker::Terminal { report }) =
            JobMarkerRepo::find(self.store.as_ref(), provider, batch_id, job_id).await?
        {
            tracing::debug!(batch_id, job_id, "Replaying finished job");
            return Ok(DispatchResponse::from_report(report));
        }

        let batch = BatchRepo::get(self.store.as_ref(), provider, batch_id).await?;
        if !batch.contains_job(job_id) {
            return Err(ProcessorError::UnknownJob {
                batch_id: batch_id.to_string(),
                job_id,
            });
        }
        if batch.status != BatchStatus::InProgress || !batch.is_owned_by(&self.config.worker_id) {
            return Err(ProcessorError::NotOwner {
                batch_id: batch_id.to_string(),
            });
        }

        match JobMarkerRepo::claim(
            self.store.as_ref(),
            provider,
            batch_id,
            job_id,
            &self.config.worker_id,
            self.clock.now(),
            self.config.marker_ttl,
        )
        .await?
        {
            MarkerClaim::Claimed => {}
            MarkerClaim::InFlight { worker_id } => {
                tracing::debug!(batch_id, job_id, running_on = %worker_id, "Job already running");
                return Ok(DispatchResponse::in_progress());
            }
            MarkerClaim::Terminal(report) => return Ok(DispatchResponse::from_report(report)),
        }

        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        let outcome = self.run_job(&batch, request).await;
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
        let report = outcome?;

        self.record(&batch, &report).await?;
        Ok(DispatchResponse::from_report(report))
    }

    async fn run_job(&self, batch: &Batch, request: &DispatchRequest) -> Result<JobReport, ProcessorError> {
        let job_id = request.job.id;
        let failed = |kind: JobErrorKind, message: String| JobReport::failed(job_id, JobError::new(kind, message));

        if let Err(e) = self.intake.mark_status(job_id, JobStatus::Running).await {
            tracing::warn!(batch_id = %batch.batch_id, job_id, error = %e, "Could not mark job running");
        }

        if let Some(kind) = batch.session_terminal {
            return Ok(failed(kind, "batch session is no longer usable".to_string()));
        }

        let Some(automation) = self.automations.get(&batch.provider) else {
            return Ok(failed(
                JobErrorKind::Automation,
                format!("no automation for provider {}", batch.provider),
            ));
        };

        let session = match self.ensure_session(batch, automation.as_ref()).await {
            Ok(session) => session,
            Err(SessionFailure::Provisioning(e)) => return Err(self.fail_provisioning(batch, e).await),
            Err(SessionFailure::Terminal(kind, message)) => {
                self.mark_session_terminal(batch, kind).await?;
                return Ok(failed(kind, message));
            }
            Err(SessionFailure::Processor(e)) => return Err(e),
        };

        match automation
            .execute(&self.units, &session, &batch.action, &request.job)
            .await
        {
            Ok(result) => Ok(JobReport::completed(job_id, result)),
            Err(AutomationError::SessionInvalid(reason)) => {
                self.relogin(batch, automation.as_ref(), &session, job_id, reason)
                    .await
            }
            Err(e) => Ok(failed(JobErrorKind::Automation, e.to_string())),
        }
    }

    /// Report the outcome, then mark the job finished, then count it.
    async fn record(&self, batch: &Batch, report: &JobReport) -> Result<(), ProcessorError> {
        let provider = batch.provider.as_str();
        let batch_id = batch.batch_id.as_str();

        self.intake.report(report).await?;
        JobMarkerRepo::complete(self.store.as_ref(), provider, batch_id, report, self.config.marker_ttl)
            .await?;

        self.jobs_processed.fetch_add(1, Ordering::SeqCst);
        if !report.is_success() {
            self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        }

        match BatchRepo::record_outcome(
            self.store.as_ref(),
            provider,
            batch_id,
            &self.config.worker_id,
            report.is_success(),
        )
        .await?
        {
            CasOutcome::Applied(b) => {
                tracing::info!(
                    batch_id,
                    job_id = report.job_id,
                    status = report.status.as_str(),
                    attempted = b.jobs_attempted(),
                    batch_size = b.batch_size,
                    "Job finished",
                );
                if b.is_fully_attempted() {
                    self.finalize(provider, batch_id).await?;
                }
            }
            CasOutcome::Rejected(b) => {
                tracing::warn!(
                    batch_id,
                    job_id = report.job_id,
                    status = ?b.status,
                    "Outcome reported but the batch is no longer ours to count",
                );
            }
        }
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Reuse the batch session, or establish it on the first job.
    async fn ensure_session(
        &self,
        batch: &Batch,
        automation: &dyn ProviderAutomation,
    ) -> Result<AutomationSession, SessionFailure> {
        let provider = batch.provider.as_str();
        let batch_id = batch.batch_id.as_str();

        if let (Some(service_id), Some(session_id)) = (&batch.service_id, &batch.session_id) {
            return self
                .units
                .resume_session(service_id, session_id)
                .await
                .map_err(|e| SessionFailure::Terminal(JobErrorKind::SessionExpired, e.to_string()));
        }

        let Some(credentials) = self.credentials.get(provider) else {
            return Err(SessionFailure::Terminal(
                JobErrorKind::LoginFailed,
                format!("no credentials configured for provider {provider}"),
            ));
        };

        let unit = self
            .units
            .acquire(batch_id)
            .await
            .map_err(SessionFailure::Provisioning)?;
        let session = match self.units.open_session(&unit).await {
            Ok(session) => session,
            Err(e) => {
                self.release(&unit.service_id, None).await;
                return Err(SessionFailure::Provisioning(e));
            }
        };

        let code = batch.totp_code.as_deref();
        let login = automation.login(&self.units, &session, credentials, code).await;
        if let Some(code) = code {
            TotpRepo::record_use(self.store.as_ref(), provider, code, batch_id, login.is_ok()).await?;
        }
        if let Err(e) = login {
            tracing::warn!(batch_id, provider, error = %e, "Login failed");
            self.release(&unit.service_id, Some(&session)).await;
            return Err(SessionFailure::Terminal(JobErrorKind::LoginFailed, e.to_string()));
        }

        match BatchRepo::attach_session(
            self.store.as_ref(),
            provider,
            batch_id,
            &self.config.worker_id,
            &session.session_id,
            &session.service_id,
        )
        .await?
        {
            CasOutcome::Applied(_) => {
                tracing::info!(batch_id, provider, service_id = %session.service_id, "Session established");
                Ok(session)
            }
            CasOutcome::Rejected(current) => {
                self.release(&unit.service_id, Some(&session)).await;
                match (current.service_id.as_deref(), current.session_id.as_deref()) {
                    (Some(service_id), Some(session_id))
                        if current.status == BatchStatus::InProgress
                            && current.is_owned_by(&self.config.worker_id) =>
                    {
                        self.units
                            .resume_session(service_id, session_id)
                            .await
                            .map_err(|e| SessionFailure::Terminal(JobErrorKind::SessionExpired, e.to_string()))
                    }
                    _ => Err(SessionFailure::Processor(ProcessorError::NotOwner {
                        batch_id: batch_id.to_string(),
                    })),
                }
            }
        }
    }

    /// One re-login with the batch's reserved code. The interrupted job is
    /// never repeated, since the provider may already have acted on it: it
    /// ends as `SessionExpired` and only the jobs after it use the restored
    /// session. Without a re-login the session expires for the rest of the
    /// batch.
    async fn relogin(
        &self,
        batch: &Batch,
        automation: &dyn ProviderAutomation,
        session: &AutomationSession,
        job_id: JobId,
        reason: String,
    ) -> Result<JobReport, ProcessorError> {
        let provider = batch.provider.as_str();
        let batch_id = batch.batch_id.as_str();
        tracing::warn!(batch_id, job_id, reason = %reason, "Session invalidated");

        let allowed = BatchRepo::take_relogin(self.store.as_ref(), provider, batch_id, &self.config.worker_id)
            .await?
            .is_applied();
        if !allowed {
            return self
                .expire_session(batch, job_id, "re-login already used".to_string())
                .await;
        }

        let code = batch.totp_code.as_deref();
        if let Some(code) = code {
            if TotpRepo::reservation(self.store.as_ref(), provider, code).await?.is_none() {
                return self
                    .expire_session(batch, job_id, "reserved TOTP code has lapsed".to_string())
                    .await;
            }
        }
        let Some(credentials) = self.credentials.get(provider) else {
            return self
                .expire_session(batch, job_id, "no credentials for re-login".to_string())
                .await;
        };

        let login = automation.login(&self.units, session, credentials, code).await;
        if let Some(code) = code {
            TotpRepo::record_use(self.store.as_ref(), provider, code, batch_id, login.is_ok()).await?;
        }
        if let Err(e) = login {
            return self
                .expire_session(batch, job_id, format!("re-login failed: {e}"))
                .await;
        }
        tracing::info!(batch_id, job_id, "Re-login succeeded, interrupted job is not repeated");

        Ok(JobReport::failed(
            job_id,
            JobError::new(
                JobErrorKind::SessionExpired,
                format!("session dropped during the action ({reason}); not repeated"),
            ),
        ))
    }

    async fn expire_session(
        &self,
        batch: &Batch,
        job_id: JobId,
        message: String,
    ) -> Result<JobReport, ProcessorError> {
        tracing::warn!(batch_id = %batch.batch_id, job_id, reason = %message, "Session expired for the rest of the batch");
        self.mark_session_terminal(batch, JobErrorKind::SessionExpired).await?;
        Ok(JobReport::failed(
            job_id,
            JobError::new(JobErrorKind::SessionExpired, message),
        ))
    }

    async fn mark_session_terminal(&self, batch: &Batch, kind: JobErrorKind) -> Result<(), ProcessorError> {
        BatchRepo::mark_session_terminal(
            self.store.as_ref(),
            &batch.provider,
            &batch.batch_id,
            &self.config.worker_id,
            kind,
        )
        .await?;
        Ok(())
    }

    // ── Batch outcome ────────────────────────────────────────────────────

    /// Fail a batch that never got an execution unit and return its
    /// unfinished jobs to pending.
    async fn fail_provisioning(&self, batch: &Batch, cause: ExecutionUnitError) -> ProcessorError {
        tracing::error!(
            batch_id = %batch.batch_id,
            provider = %batch.provider,
            error = %cause,
            "No execution unit for batch",
        );
        match self.requeue_batch(batch, BatchFailure::Provisioning).await {
            Ok(()) => ProcessorError::BatchFailed {
                batch_id: batch.batch_id.clone(),
                failure: BatchFailure::Provisioning,
            },
            Err(e) => e,
        }
    }

    async fn requeue_batch(&self, batch: &Batch, failure: BatchFailure) -> Result<(), ProcessorError> {
        let provider = batch.provider.as_str();
        let batch_id = batch.batch_id.as_str();
        let outcome = BatchRepo::fail(
            self.store.as_ref(),
            provider,
            batch_id,
            &[BatchStatus::InProgress],
            failure,
            self.clock.now(),
        )
        .await?;
        let CasOutcome::Applied(failed) = outcome else {
            return Ok(());
        };
        BatchRepo::clear_heartbeat(self.store.as_ref(), provider, batch_id).await?;
        let unfinished =
            JobMarkerRepo::unfinished(self.store.as_ref(), provider, batch_id, &failed.job_ids).await?;
        self.intake.requeue(&unfinished).await?;
        tracing::warn!(batch_id, requeued = unfinished.len(), failure = ?failure, "Batch failed, jobs requeued");
        Ok(())
    }

    /// Set the terminal status of a fully attempted batch. The single winner
    /// closes the session, releases the unit and stops the heartbeat.
    pub async fn finalize(&self, provider: &str, batch_id: &str) -> Result<Option<Batch>, ProcessorError> {
        let outcome = BatchRepo::finalize(
            self.store.as_ref(),
            provider,
            batch_id,
            &self.config.worker_id,
            self.config.terminal_policy,
            self.clock.now(),
        )
        .await?;
        let CasOutcome::Applied(batch) = outcome else {
            return Ok(None);
        };

        tracing::info!(
            batch_id,
            provider,
            status = ?batch.status,
            jobs_completed = batch.jobs_completed,
            jobs_failed = batch.jobs_failed,
            "Batch finalized",
        );
        self.release_batch_unit(&batch).await;
        BatchRepo::clear_heartbeat(self.store.as_ref(), provider, batch_id).await?;
        Ok(Some(batch))
    }

    /// Free the unit of a batch that stopped before finalizing.
    async fn release_unfinished(&self, provider: &str, batch_id: &str) {
        match BatchRepo::find(self.store.as_ref(), provider, batch_id).await {
            Ok(Some(batch)) => {
                let stopped_early = match batch.status {
                    BatchStatus::InProgress => true,
                    BatchStatus::Failed => matches!(
                        batch.failure,
                        Some(BatchFailure::Abandoned | BatchFailure::Aborted)
                    ),
                    _ => false,
                };
                if stopped_early {
                    self.release_batch_unit(&batch).await;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(batch_id, error = %e, "Could not load batch to release its unit"),
        }
    }

    async fn release_batch_unit(&self, batch: &Batch) {
        let Some(service_id) = batch.service_id.as_deref() else {
            return;
        };
        let session = match batch.session_id.as_deref() {
            Some(session_id) => self.units.resume_session(service_id, session_id).await.ok(),
            None => None,
        };
        self.release(service_id, session.as_ref()).await;
    }

    /// Close the session if any and return the unit to the idle pool.
    async fn release(&self, service_id: &str, session: Option<&AutomationSession>) {
        if let Some(session) = session {
            if let Err(e) = self.units.close_session(session).await {
                tracing::warn!(service_id, error = %e, "Failed to close session");
            }
        }
        match self.units.mark_idle(service_id).await {
            Ok(true) => tracing::debug!(service_id, "Unit released"),
            Ok(false) => {}
            Err(e) => tracing::warn!(service_id, error = %e, "Failed to release unit"),
        }
    }

    // ── Introspection and shutdown ───────────────────────────────────────

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.config.worker_id.clone(),
            active_batches: self.active().len() as u32,
            active_jobs: self.active_jobs.load(Ordering::SeqCst),
            capacity: self.config.capacity,
            jobs_processed: self.jobs_processed.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
        }
    }

    /// Wait for every running batch to finish.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stop processing. Unfinished batches keep their state in the store and
    /// are recovered once their heartbeat expires.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.drain().await;
    }
}
