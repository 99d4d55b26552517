use std::time::Duration;

use rpa_core::config::CoordinationConfig;
use rpa_core::error::CoreError;
use rpa_core::types::WorkerId;
use rpa_core::worker_pool::validate_worker_id;
use rpa_store::StateStoreKind;

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub host: String,
    pub port: u16,
    /// Batches processed concurrently.
    pub capacity: u32,
    pub coordination: CoordinationConfig,
    pub state_store: StateStoreKind,
    /// Remote intake service. `None` runs an in-process intake.
    pub intake_url: Option<String>,
    pub unit_control_url: String,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                 | Default                 |
    /// |-------------------------|-------------------------|
    /// | `WORKER_ID`             | required                |
    /// | `HOST`                  | `0.0.0.0`               |
    /// | `PORT`                  | `8081`                  |
    /// | `WORKER_CAPACITY`       | `4`                     |
    /// | `STATE_STORE`           | `postgres`              |
    /// | `DATABASE_URL`          | required for postgres   |
    /// | `INTAKE_URL`            | unset (in-process)      |
    /// | `UNIT_CONTROL_URL`      | `http://localhost:9000` |
    /// | `REQUEST_TIMEOUT_SECS`  | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `30`                    |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let worker_id = lookup("WORKER_ID")
            .ok_or_else(|| CoreError::Validation("WORKER_ID must be set".into()))?;
        validate_worker_id(&worker_id)?;

        let number = |key: &str, default: u64| -> Result<u64, CoreError> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|e| CoreError::Validation(format!("{key} is invalid: {e}"))),
            }
        };

        let port = u16::try_from(number("PORT", 8081)?)
            .map_err(|_| CoreError::Validation("PORT is out of range".into()))?;
        let capacity = u32::try_from(number("WORKER_CAPACITY", 4)?)
            .map_err(|_| CoreError::Validation("WORKER_CAPACITY is out of range".into()))?;
        if capacity == 0 {
            return Err(CoreError::Validation("WORKER_CAPACITY must be at least 1".into()));
        }

        Ok(Self {
            worker_id,
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            capacity,
            coordination: CoordinationConfig::from_lookup(&lookup)?,
            state_store: StateStoreKind::from_lookup(&lookup)?,
            intake_url: lookup("INTAKE_URL").filter(|u| !u.trim().is_empty()),
            unit_control_url: lookup("UNIT_CONTROL_URL")
                .unwrap_or_else(|| "http://localhost:9000".into()),
            request_timeout: Duration::from_secs(number("REQUEST_TIMEOUT_SECS", 30)?),
            shutdown_timeout: Duration::from_secs(number("SHUTDOWN_TIMEOUT_SECS", 30)?),
        })
    }
}
