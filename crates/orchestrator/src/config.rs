use std::time::Duration;

use rpa_core::config::CoordinationConfig;
use rpa_core::error::CoreError;
use rpa_core::worker_pool::{parse_worker_endpoints, WorkerEndpoint};
use rpa_store::StateStoreKind;

/// Orchestrator process configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub coordination: CoordinationConfig,
    pub state_store: StateStoreKind,
    pub workers: Vec<WorkerEndpoint>,
    /// Remote intake service. `None` runs an in-process intake.
    pub intake_url: Option<String>,
    pub unit_control_url: String,
    pub dispatch_poll_interval: Duration,
    pub recovery_interval: Duration,
    pub reap_interval: Duration,
    /// How long shutdown waits for each background loop.
    pub shutdown_timeout: Duration,
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                   | Default                 |
    /// |---------------------------|-------------------------|
    /// | `STATE_STORE`             | `postgres`              |
    /// | `DATABASE_URL`            | required for postgres   |
    /// | `WORKER_URLS`             | required                |
    /// | `INTAKE_URL`              | unset (in-process)      |
    /// | `UNIT_CONTROL_URL`        | `http://localhost:9000` |
    /// | `DISPATCH_POLL_MS`        | `1000`                  |
    /// | `RECOVERY_INTERVAL_SECS`  | `15`                    |
    /// | `REAP_INTERVAL_SECS`      | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`   | `10`                    |
    ///
    /// Coordination settings are read by [`CoordinationConfig::from_env`].
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let coordination = CoordinationConfig::from_lookup(&lookup)?;

        let state_store = StateStoreKind::from_lookup(&lookup)?;

        let workers = parse_worker_endpoints(&lookup("WORKER_URLS").unwrap_or_default())?;
        if workers.is_empty() {
            return Err(CoreError::Validation("WORKER_URLS must list at least one worker".into()));
        }

        let number = |key: &str, default: u64| -> Result<u64, CoreError> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|e| CoreError::Validation(format!("{key} is invalid: {e}"))),
            }
        };

        Ok(Self {
            coordination,
            state_store,
            workers,
            intake_url: lookup("INTAKE_URL").filter(|u| !u.trim().is_empty()),
            unit_control_url: lookup("UNIT_CONTROL_URL")
                .unwrap_or_else(|| "http://localhost:9000".into()),
            dispatch_poll_interval: Duration::from_millis(number("DISPATCH_POLL_MS", 1000)?),
            recovery_interval: Duration::from_secs(number("RECOVERY_INTERVAL_SECS", 15)?),
            reap_interval: Duration::from_secs(number("REAP_INTERVAL_SECS", 30)?),
            shutdown_timeout: Duration::from_secs(number("SHUTDOWN_TIMEOUT_SECS", 10)?),
        })
    }
}
