//! Execution-unit lifecycle manager.
//!
//! Unit state lives only in the shared store. Every state change is a
//! compare-and-set on the unit record, so the reaper, the warm pool and the
//! workers acquiring units can run in separate processes without racing.

use std::sync::Arc;
use std::time::Duration;

use rpa_core::backoff::BackoffConfig;
use rpa_core::clock::Clock;
use rpa_core::config::CoordinationConfig;
use rpa_core::execution_unit::{new_service_id, ExecutionUnit, ExecutionUnitState};
use rpa_core::types::ServiceId;
use rpa_store::cas::CasOutcome;
use rpa_store::repositories::UnitRepo;
use rpa_store::StateStore;

use crate::api::{ExecutionUnitApi, ProvisionRequest, Readiness};
use crate::error::ExecutionUnitError;
use crate::session::AutomationSession;

use ExecutionUnitState::*;

/// Lifecycle settings, usually derived from [`CoordinationConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct UnitManagerConfig {
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub provision_attempts: u32,
    pub provision_backoff: BackoffConfig,
    pub idle_timeout: Duration,
    pub warm_pool_size: usize,
}

impl UnitManagerConfig {
    pub fn from_coordination(config: &CoordinationConfig) -> Self {
        Self {
            ready_timeout: config.ready_timeout,
            ready_poll_interval: config.ready_poll_interval,
            provision_attempts: config.provision_attempts,
            provision_backoff: BackoffConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter: 0.2,
            },
            idle_timeout: config.idle_timeout,
            warm_pool_size: config.warm_pool_size,
        }
    }

    /// Units still starting after this long are treated as stuck.
    pub fn stale_startup_after(&self) -> Duration {
        self.ready_timeout * 2
    }
}

/// A ready unit bound to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredUnit {
    pub service_id: ServiceId,
    pub endpoint: String,
}

/// Counters returned by [`ExecutionUnitManager::shutdown_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub terminated: usize,
    pub failed: usize,
}

pub struct ExecutionUnitManager {
    store: Arc<dyn StateStore>,
    api: Arc<dyn ExecutionUnitApi>,
    clock: Arc<dyn Clock>,
    config: UnitManagerConfig,
}

impl ExecutionUnitManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        api: Arc<dyn ExecutionUnitApi>,
        clock: Arc<dyn Clock>,
        config: UnitManagerConfig,
    ) -> Self {
        Self {
            store,
            api,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &UnitManagerConfig {
        &self.config
    }

    // ── Provisioning ─────────────────────────────────────────────────────

    /// Record a new unit and ask the control plane to start it.
    ///
    /// Returns as soon as provisioning has started; use [`Self::wait_ready`]
    /// to block until the unit is usable.
    pub async fn provision(&self, batch_id: Option<&str>) -> Result<ServiceId, ExecutionUnitError> {
        let service_id = new_service_id();
        let unit = ExecutionUnit::requested(
            service_id.clone(),
            batch_id.map(str::to_string),
            self.clock.now(),
        );
        UnitRepo::create(self.store.as_ref(), &unit).await?;

        let request = ProvisionRequest {
            service_id: service_id.clone(),
            batch_id: batch_id.map(str::to_string),
        };
        let provisioned = match self.api.provision(&request).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(service_id = %service_id, error = %e, "Provision request failed");
                self.fail_unit(&service_id).await;
                return Err(e);
            }
        };

        let endpoint = provisioned.endpoint;
        UnitRepo::transition(self.store.as_ref(), &service_id, &[Requested], Provisioning, |u| {
            u.endpoint = Some(endpoint.clone());
            true
        })
        .await?;

        tracing::info!(service_id = %service_id, batch_id = ?batch_id, "Execution unit provisioning");
        Ok(service_id)
    }

    /// Poll the unit's functional readiness probe until it passes or
    /// `timeout` elapses on the manager's clock. On timeout or error the
    /// unit is marked failed and torn down.
    pub async fn wait_ready(&self, service_id: &str, timeout: Duration) -> Result<String, ExecutionUnitError> {
        match self.poll_until_ready(service_id, timeout).await {
            Ok(endpoint) => Ok(endpoint),
            Err(e) => {
                if matches!(e, ExecutionUnitError::ReadyTimeout { .. }) {
                    tracing::warn!(service_id, timeout_secs = timeout.as_secs(), "Execution unit readiness timed out");
                }
                self.fail_unit(service_id).await;
                Err(e)
            }
        }
    }

    async fn poll_until_ready(&self, service_id: &str, timeout: Duration) -> Result<String, ExecutionUnitError> {
        let started = self.clock.now();
        loop {
            let elapsed = (self.clock.now() - started).to_std().unwrap_or_default();
            let Some(remaining) = timeout.checked_sub(elapsed).filter(|r| !r.is_zero()) else {
                return Err(ExecutionUnitError::ReadyTimeout {
                    service_id: service_id.to_string(),
                    timeout,
                });
            };

            let unit = UnitRepo::get(self.store.as_ref(), service_id).await?;
            match (unit.state, unit.endpoint.as_deref()) {
                (Ready | InUse | Idle, Some(endpoint)) => return Ok(endpoint.to_string()),
                (Provisioning, Some(endpoint)) => {
                    // A hung probe must not outlive the readiness deadline.
                    let probe = tokio::time::timeout(remaining, self.api.readiness(endpoint)).await;
                    match probe {
                        Ok(Ok(Readiness::Ready)) => {
                            let outcome = UnitRepo::transition(
                                self.store.as_ref(),
                                service_id,
                                &[Provisioning],
                                Ready,
                                |_| true,
                            )
                            .await?;
                            if outcome.is_applied() {
                                tracing::info!(service_id, "Execution unit ready");
                                return Ok(endpoint.to_string());
                            }
                            continue;
                        }
                        Ok(Ok(Readiness::NotReady(reason))) => {
                            tracing::debug!(service_id, reason = %reason, "Execution unit not ready yet");
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(service_id, error = %e, "Readiness probe failed");
                        }
                        Err(_) => {
                            tracing::debug!(service_id, "Readiness probe did not answer in time");
                        }
                    }
                }
                (Requested | Provisioning, _) => {}
                (state, _) => {
                    return Err(ExecutionUnitError::Unavailable {
                        service_id: service_id.to_string(),
                        state,
                    })
                }
            }
            self.clock
                .sleep(self.config.ready_poll_interval.min(remaining))
                .await;
        }
    }

    /// Mark a starting unit failed and ask the control plane to remove it.
    async fn fail_unit(&self, service_id: &str) {
        let outcome = UnitRepo::transition(
            self.store.as_ref(),
            service_id,
            &[Requested, Provisioning],
            Failed,
            |_| true,
        )
        .await;
        match outcome {
            Ok(CasOutcome::Applied(_)) => {}
            Ok(CasOutcome::Rejected(unit)) => {
                tracing::debug!(service_id, state = ?unit.state, "Unit no longer starting, leaving it alone");
                return;
            }
            Err(e) => tracing::warn!(service_id, error = %e, "Failed to mark execution unit failed"),
        }
        if let Err(e) = self.api.terminate(service_id).await {
            tracing::warn!(service_id, error = %e, "Failed to tear down execution unit");
        }
    }

    // ── Acquisition ──────────────────────────────────────────────────────

    /// A ready unit bound to `batch_id`: an idle one if available, otherwise
    /// a freshly provisioned one, retrying with backoff.
    pub async fn acquire(&self, batch_id: &str) -> Result<AcquiredUnit, ExecutionUnitError> {
        if let Some(unit) = UnitRepo::claim_idle(self.store.as_ref(), batch_id, self.clock.now()).await? {
            if let Some(endpoint) = unit.endpoint {
                tracing::info!(service_id = %unit.service_id, batch_id, "Reusing idle execution unit");
                return Ok(AcquiredUnit {
                    service_id: unit.service_id,
                    endpoint,
                });
            }
        }

        let attempts = self.config.provision_attempts.max(1);
        for attempt in 1..=attempts {
            match self.provision_for(batch_id).await {
                Ok(unit) => return Ok(unit),
                Err(e) => {
                    tracing::warn!(batch_id, attempt, attempts, error = %e, "Execution unit provisioning attempt failed");
                    if attempt < attempts {
                        self.clock
                            .sleep(self.config.provision_backoff.jittered_delay_for(attempt))
                            .await;
                    }
                }
            }
        }
        Err(ExecutionUnitError::ProvisioningExhausted { attempts })
    }

    async fn provision_for(&self, batch_id: &str) -> Result<AcquiredUnit, ExecutionUnitError> {
        let service_id = self.provision(Some(batch_id)).await?;
        let endpoint = self.wait_ready(&service_id, self.config.ready_timeout).await?;
        let now = self.clock.now();
        let outcome = UnitRepo::transition(self.store.as_ref(), &service_id, &[Ready], InUse, |u| {
            u.bound_batch_id = Some(batch_id.to_string());
            u.last_used_at = now;
            true
        })
        .await?;
        match outcome {
            CasOutcome::Applied(_) => Ok(AcquiredUnit {
                service_id,
                endpoint,
            }),
            CasOutcome::Rejected(unit) => Err(ExecutionUnitError::Unavailable {
                service_id,
                state: unit.state,
            }),
        }
    }

    /// Release a unit after its batch finished. Returns `false` if the unit
    /// was not in use.
    pub async fn mark_idle(&self, service_id: &str) -> Result<bool, ExecutionUnitError> {
        let now = self.clock.now();
        let outcome = UnitRepo::transition(self.store.as_ref(), service_id, &[InUse], Idle, |u| {
            u.bound_batch_id = None;
            u.last_used_at = now;
            true
        })
        .await?;
        Ok(outcome.is_applied())
    }

    // ── Termination ──────────────────────────────────────────────────────

    /// Terminate a unit regardless of use. Starting units are failed instead.
    pub async fn terminate(&self, service_id: &str) -> Result<(), ExecutionUnitError> {
        let unit = UnitRepo::get(self.store.as_ref(), service_id).await?;
        if unit.state.is_starting() {
            self.fail_unit(service_id).await;
            return Ok(());
        }
        let outcome = UnitRepo::transition(
            self.store.as_ref(),
            service_id,
            &[Ready, InUse, Idle],
            Terminating,
            |_| true,
        )
        .await?;
        if outcome.is_applied() {
            self.finish_termination(service_id).await?;
        }
        Ok(())
    }

    /// Tear down a unit already in `Terminating`.
    pub(crate) async fn finish_termination(&self, service_id: &str) -> Result<(), ExecutionUnitError> {
        match self.api.terminate(service_id).await {
            Ok(()) => {
                UnitRepo::transition(self.store.as_ref(), service_id, &[Terminating], Terminated, |_| true)
                    .await?;
                tracing::info!(service_id, "Execution unit terminated");
                Ok(())
            }
            Err(e) => {
                tracing::error!(service_id, error = %e, "Execution unit termination failed");
                UnitRepo::transition(self.store.as_ref(), service_id, &[Terminating], Failed, |_| true)
                    .await?;
                Err(e)
            }
        }
    }

    /// Units that are not yet terminated or failed.
    pub async fn active_units(&self) -> Result<Vec<ExecutionUnit>, ExecutionUnitError> {
        let units = UnitRepo::list(self.store.as_ref()).await?;
        Ok(units.into_iter().filter(|u| !u.state.is_terminal()).collect())
    }

    /// Terminate every active unit, e.g. on orchestrator shutdown.
    pub async fn shutdown_all(&self) -> Result<ShutdownSummary, ExecutionUnitError> {
        let units = self.active_units().await?;
        tracing::info!(count = units.len(), "Terminating all execution units");

        let results = futures::future::join_all(
            units.iter().map(|u| self.terminate(&u.service_id)),
        )
        .await;

        let mut summary = ShutdownSummary::default();
        for (unit, result) in units.iter().zip(results) {
            match result {
                Ok(()) => summary.terminated += 1,
                Err(e) => {
                    tracing::warn!(service_id = %unit.service_id, error = %e, "Unit did not shut down cleanly");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    // ── Reclamation ──────────────────────────────────────────────────────

    /// Terminate idle units past the idle timeout, keeping the
    /// `warm_pool_size` most recently used ones.
    ///
    /// The idle check is repeated inside the compare-and-set, so a unit
    /// claimed for a batch in the meantime is never touched.
    pub async fn reap_idle(&self) -> Result<usize, ExecutionUnitError> {
        let now = self.clock.now();
        let idle_timeout = self.config.idle_timeout;

        let mut idle: Vec<ExecutionUnit> = UnitRepo::list(self.store.as_ref())
            .await?
            .into_iter()
            .filter(|u| u.state == Idle)
            .collect();
        idle.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));

        let mut reclaimed = 0;
        for unit in idle.into_iter().skip(self.config.warm_pool_size) {
            if !unit.is_idle_expired(now, idle_timeout) {
                continue;
            }
            let outcome = UnitRepo::transition(
                self.store.as_ref(),
                &unit.service_id,
                &[Idle],
                Terminating,
                |u| u.is_idle_expired(now, idle_timeout),
            )
            .await?;
            if !outcome.is_applied() {
                continue;
            }
            tracing::info!(service_id = %unit.service_id, "Reclaiming idle execution unit");
            if self.finish_termination(&unit.service_id).await.is_ok() {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Fail units stuck in startup well past the readiness timeout.
    pub async fn reap_stale_startups(&self) -> Result<usize, ExecutionUnitError> {
        let now = self.clock.now();
        let limit = self.config.stale_startup_after();
        let stale: Vec<ExecutionUnit> = UnitRepo::list(self.store.as_ref())
            .await?
            .into_iter()
            .filter(|u| u.is_stale_startup(now, limit))
            .collect();
        for unit in &stale {
            tracing::warn!(service_id = %unit.service_id, state = ?unit.state, "Failing stale execution unit");
            self.fail_unit(&unit.service_id).await;
        }
        Ok(stale.len())
    }

    /// Provision idle units until `warm_pool_size` are available.
    pub async fn maintain_warm_pool(&self) -> Result<usize, ExecutionUnitError> {
        let target = self.config.warm_pool_size;
        if target == 0 {
            return Ok(0);
        }
        let available = UnitRepo::list(self.store.as_ref())
            .await?
            .into_iter()
            .filter(|u| {
                u.state == Idle
                    || ((u.state.is_starting() || u.state == Ready) && u.bound_batch_id.is_none())
            })
            .count();
        let deficit = target.saturating_sub(available);
        if deficit == 0 {
            return Ok(0);
        }

        tracing::info!(available, target, "Topping up warm execution-unit pool");
        let results = futures::future::join_all((0..deficit).map(|_| self.provision_warm())).await;
        Ok(results.into_iter().filter(Result::is_ok).count())
    }

    async fn provision_warm(&self) -> Result<ServiceId, ExecutionUnitError> {
        let service_id = self.provision(None).await?;
        self.wait_ready(&service_id, self.config.ready_timeout).await?;
        let now = self.clock.now();
        UnitRepo::transition(self.store.as_ref(), &service_id, &[Ready], Idle, |u| {
            u.last_used_at = now;
            true
        })
        .await?;
        Ok(service_id)
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Open a browser session on an acquired unit.
    pub async fn open_session(&self, unit: &AcquiredUnit) -> Result<AutomationSession, ExecutionUnitError> {
        let response = self
            .api
            .command(&unit.endpoint, &serde_json::json!({ "type": "session.create" }))
            .await?;
        let session_id = response
            .get("session_id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ExecutionUnitError::InvalidResponse(format!("no session_id in {response}")))?;
        Ok(AutomationSession {
            service_id: unit.service_id.clone(),
            endpoint: unit.endpoint.clone(),
            session_id: session_id.to_string(),
        })
    }

    /// Rebuild a session handle from the ids stored on a batch.
    pub async fn resume_session(
        &self,
        service_id: &str,
        session_id: &str,
    ) -> Result<AutomationSession, ExecutionUnitError> {
        let unit = UnitRepo::get(self.store.as_ref(), service_id).await?;
        match (unit.state, unit.endpoint) {
            (InUse, Some(endpoint)) => Ok(AutomationSession {
                service_id: unit.service_id,
                endpoint,
                session_id: session_id.to_string(),
            }),
            (state, _) => Err(ExecutionUnitError::Unavailable {
                service_id: service_id.to_string(),
                state,
            }),
        }
    }

    pub async fn close_session(&self, session: &AutomationSession) -> Result<(), ExecutionUnitError> {
        self.api
            .command(
                &session.endpoint,
                &serde_json::json!({ "type": "session.close", "session_id": session.session_id }),
            )
            .await?;
        Ok(())
    }

    /// Send a command scoped to `session`.
    pub async fn command(
        &self,
        session: &AutomationSession,
        mut command: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionUnitError> {
        if let Some(obj) = command.as_object_mut() {
            obj.insert(
                "session_id".to_string(),
                serde_json::Value::String(session.session_id.clone()),
            );
        }
        self.api.command(&session.endpoint, &command).await
    }
}
