//! Ephemeral browser-automation execution units.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{BatchId, ServiceId, Timestamp};

pub const UNIT_KEY_PREFIX: &str = "unit:";

pub fn unit_key(service_id: &str) -> String {
    format!("{UNIT_KEY_PREFIX}{service_id}")
}

pub fn new_service_id() -> ServiceId {
    format!("unit-{}", uuid::Uuid::now_v7().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionUnitState {
    Requested,
    Provisioning,
    Ready,
    InUse,
    Idle,
    Terminating,
    Terminated,
    Failed,
}

impl ExecutionUnitState {
    pub fn valid_transitions(self) -> &'static [ExecutionUnitState] {
        use ExecutionUnitState::*;
        match self {
            Requested => &[Provisioning, Failed],
            Provisioning => &[Ready, Failed],
            Ready => &[InUse, Idle, Terminating, Failed],
            InUse => &[Idle, Terminating, Failed],
            Idle => &[InUse, Terminating],
            Terminating => &[Terminated, Failed],
            Terminated | Failed => &[],
        }
    }

    pub fn can_transition(self, to: ExecutionUnitState) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionUnitState::Terminated | ExecutionUnitState::Failed)
    }

    /// Still starting up, not yet usable.
    pub fn is_starting(self) -> bool {
        matches!(
            self,
            ExecutionUnitState::Requested | ExecutionUnitState::Provisioning
        )
    }
}

/// Execution-unit record as persisted under [`unit_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    pub service_id: ServiceId,
    pub state: ExecutionUnitState,
    pub endpoint: Option<String>,
    pub bound_batch_id: Option<BatchId>,
    pub created_at: Timestamp,
    pub last_used_at: Timestamp,
}

impl ExecutionUnit {
    pub fn requested(service_id: ServiceId, bound_batch_id: Option<BatchId>, now: Timestamp) -> Self {
        Self {
            service_id,
            state: ExecutionUnitState::Requested,
            endpoint: None,
            bound_batch_id,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Idle for at least `idle_timeout`. Only meaningful in `Idle`.
    pub fn is_idle_expired(&self, now: Timestamp, idle_timeout: Duration) -> bool {
        self.state == ExecutionUnitState::Idle && elapsed(self.last_used_at, now) >= idle_timeout
    }

    /// Stuck in startup for longer than `limit`.
    pub fn is_stale_startup(&self, now: Timestamp, limit: Duration) -> bool {
        self.state.is_starting() && elapsed(self.created_at, now) > limit
    }
}

fn elapsed(since: Timestamp, now: Timestamp) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn failed_only_from_startup_or_active_states() {
        use ExecutionUnitState::*;
        assert!(Provisioning.can_transition(Failed));
        assert!(Requested.can_transition(Failed));
        assert!(!Idle.can_transition(Failed));
        assert!(!Terminated.can_transition(Failed));
    }

    #[test]
    fn idle_units_can_be_reused_or_reclaimed() {
        use ExecutionUnitState::*;
        assert!(Idle.can_transition(InUse));
        assert!(Idle.can_transition(Terminating));
        assert!(!Idle.can_transition(Ready));
    }

    #[test]
    fn terminal_states() {
        assert!(ExecutionUnitState::Terminated.is_terminal());
        assert!(ExecutionUnitState::Failed.is_terminal());
        assert!(!ExecutionUnitState::Terminating.is_terminal());
    }

    #[test]
    fn idle_expiry_only_applies_to_idle_units() {
        let mut unit = ExecutionUnit::requested("u1".into(), None, at(0));
        unit.state = ExecutionUnitState::Idle;
        assert!(!unit.is_idle_expired(at(599), Duration::from_secs(600)));
        assert!(unit.is_idle_expired(at(600), Duration::from_secs(600)));

        unit.state = ExecutionUnitState::InUse;
        assert!(!unit.is_idle_expired(at(10_000), Duration::from_secs(600)));
    }

    #[test]
    fn stale_startup_detection() {
        let unit = ExecutionUnit::requested("u1".into(), None, at(0));
        assert!(!unit.is_stale_startup(at(30), Duration::from_secs(30)));
        assert!(unit.is_stale_startup(at(31), Duration::from_secs(30)));
    }

    #[test]
    fn clock_skew_counts_as_no_time_elapsed() {
        let mut unit = ExecutionUnit::requested("u1".into(), None, at(100));
        unit.state = ExecutionUnitState::Idle;
        assert!(!unit.is_idle_expired(at(50), Duration::from_secs(1)));
    }
}
