//! Execution-unit records.

use std::time::Duration;

use rpa_core::error::CoreError;
use rpa_core::execution_unit::{unit_key, ExecutionUnit, ExecutionUnitState, UNIT_KEY_PREFIX};
use rpa_core::types::Timestamp;

use crate::cas::{load_json, update_json, CasOutcome};
use crate::error::StoreError;
use crate::store::{Expiry, StateStore};

/// How long terminated and failed unit records stay readable.
pub const TERMINAL_RETENTION: Duration = Duration::from_secs(3600);

pub struct UnitRepo;

impl UnitRepo {
    pub async fn create(store: &dyn StateStore, unit: &ExecutionUnit) -> Result<(), StoreError> {
        let key = unit_key(&unit.service_id);
        if store
            .set_nx(&key, &serde_json::to_string(unit)?, Expiry::Never)
            .await?
        {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists(key))
        }
    }

    pub async fn find(store: &dyn StateStore, service_id: &str) -> Result<Option<ExecutionUnit>, StoreError> {
        load_json(store, &unit_key(service_id)).await
    }

    pub async fn get(store: &dyn StateStore, service_id: &str) -> Result<ExecutionUnit, StoreError> {
        Self::find(store, service_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(unit_key(service_id)))
    }

    pub async fn list(store: &dyn StateStore) -> Result<Vec<ExecutionUnit>, StoreError> {
        let entries = store.scan_prefix(UNIT_KEY_PREFIX).await?;
        let mut units = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_str::<ExecutionUnit>(&value) {
                Ok(unit) => units.push(unit),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable unit record"),
            }
        }
        Ok(units)
    }

    /// Move a unit to `to` if it is currently in one of `from` and `guard`
    /// accepts it. `guard` may also adjust the record before it is written.
    ///
    /// Terminal states start the retention TTL.
    pub async fn transition<F>(
        store: &dyn StateStore,
        service_id: &str,
        from: &[ExecutionUnitState],
        to: ExecutionUnitState,
        mut guard: F,
    ) -> Result<CasOutcome<ExecutionUnit>, StoreError>
    where
        F: FnMut(&mut ExecutionUnit) -> bool + Send,
    {
        let expiry = if to.is_terminal() {
            Expiry::After(TERMINAL_RETENTION)
        } else {
            Expiry::Keep
        };
        update_json(store, &unit_key(service_id), expiry, |unit: &mut ExecutionUnit| {
            if !from.contains(&unit.state) {
                return Ok(false);
            }
            if !unit.state.can_transition(to) {
                return Err(CoreError::InvariantViolation(format!(
                    "unit {} cannot move from {:?} to {:?}",
                    unit.service_id, unit.state, to
                )));
            }
            if !guard(unit) {
                return Ok(false);
            }
            unit.state = to;
            Ok(true)
        })
        .await
    }

    /// Claim any idle unit for `batch_id`. Each candidate is claimed with
    /// its own compare-and-set, so a unit the reaper got first is skipped.
    pub async fn claim_idle(
        store: &dyn StateStore,
        batch_id: &str,
        now: Timestamp,
    ) -> Result<Option<ExecutionUnit>, StoreError> {
        let idle = Self::list(store)
            .await?
            .into_iter()
            .filter(|u| u.state == ExecutionUnitState::Idle);
        for candidate in idle {
            let outcome = Self::transition(
                store,
                &candidate.service_id,
                &[ExecutionUnitState::Idle],
                ExecutionUnitState::InUse,
                |u| {
                    u.bound_batch_id = Some(batch_id.to_string());
                    u.last_used_at = now;
                    true
                },
            )
            .await;
            match outcome {
                Ok(CasOutcome::Applied(unit)) => return Ok(Some(unit)),
                Ok(CasOutcome::Rejected(_)) | Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}
