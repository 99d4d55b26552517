use std::str::FromStr;
use std::time::Duration;

use crate::batch::BatchTerminalPolicy;
use crate::error::CoreError;
use crate::totp::{ReservationTtlPolicy, TotpAlgorithm, TotpParams};
use crate::worker_pool::WorkerSelection;

/// Coordination settings shared by the orchestrator and the workers.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationConfig {
    pub max_batch_size: usize,
    /// Partial batches flush once their oldest job waited this long.
    pub max_batch_wait: Duration,
    pub totp: TotpParams,
    /// Codes with less remaining validity than this are never reserved.
    pub totp_validity_margin: Duration,
    pub reservation_ttl: ReservationTtlPolicy,
    pub batch_ttl: Duration,
    pub heartbeat_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub warm_pool_size: usize,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub provision_attempts: u32,
    pub dispatch_attempts: u32,
    pub terminal_policy: BatchTerminalPolicy,
    pub worker_selection: WorkerSelection,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_batch_wait: Duration::from_secs(30),
            totp: TotpParams::default(),
            totp_validity_margin: Duration::from_secs(5),
            reservation_ttl: ReservationTtlPolicy::NextWindow,
            batch_ttl: Duration::from_secs(3600),
            heartbeat_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(600),
            warm_pool_size: 0,
            ready_timeout: Duration::from_secs(15),
            ready_poll_interval: Duration::from_millis(1000),
            provision_attempts: 2,
            dispatch_attempts: 3,
            terminal_policy: BatchTerminalPolicy::AllAttempted,
            worker_selection: WorkerSelection::RoundRobin,
        }
    }
}

impl CoordinationConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default         |
    /// |-----------------------------|-----------------|
    /// | `MAX_BATCH_SIZE`            | `50`            |
    /// | `MAX_BATCH_WAIT_SECS`       | `30`            |
    /// | `TOTP_PERIOD_SECS`          | `30`            |
    /// | `TOTP_DIGITS`               | `6`             |
    /// | `TOTP_ALGORITHM`            | `sha1`          |
    /// | `TOTP_VALIDITY_MARGIN_SECS` | `5`             |
    /// | `TOTP_RESERVATION_TTL`      | `next-window`   |
    /// | `BATCH_TTL_SECS`            | `3600`          |
    /// | `HEARTBEAT_TTL_SECS`        | `60`            |
    /// | `HEARTBEAT_INTERVAL_SECS`   | `15`            |
    /// | `IDLE_TIMEOUT_SECS`         | `600`           |
    /// | `WARM_POOL_SIZE`            | `0`             |
    /// | `READY_TIMEOUT_SECS`        | `15`            |
    /// | `READY_POLL_INTERVAL_MS`    | `1000`          |
    /// | `PROVISION_ATTEMPTS`        | `2`             |
    /// | `DISPATCH_ATTEMPTS`         | `3`             |
    /// | `BATCH_TERMINAL_POLICY`     | `all-attempted` |
    /// | `WORKER_SELECTION`          | `round-robin`   |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration, CoreError> {
            parse_or(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };

        let config = Self {
            max_batch_size: parse_or(&lookup, "MAX_BATCH_SIZE", d.max_batch_size)?,
            max_batch_wait: secs("MAX_BATCH_WAIT_SECS", d.max_batch_wait)?,
            totp: TotpParams {
                period_secs: parse_or(&lookup, "TOTP_PERIOD_SECS", d.totp.period_secs)?,
                digits: parse_or(&lookup, "TOTP_DIGITS", d.totp.digits)?,
                algorithm: parse_or::<TotpAlgorithm, _>(&lookup, "TOTP_ALGORITHM", d.totp.algorithm)?,
            },
            totp_validity_margin: secs("TOTP_VALIDITY_MARGIN_SECS", d.totp_validity_margin)?,
            reservation_ttl: parse_or(&lookup, "TOTP_RESERVATION_TTL", d.reservation_ttl)?,
            batch_ttl: secs("BATCH_TTL_SECS", d.batch_ttl)?,
            heartbeat_ttl: secs("HEARTBEAT_TTL_SECS", d.heartbeat_ttl)?,
            heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", d.heartbeat_interval)?,
            idle_timeout: secs("IDLE_TIMEOUT_SECS", d.idle_timeout)?,
            warm_pool_size: parse_or(&lookup, "WARM_POOL_SIZE", d.warm_pool_size)?,
            ready_timeout: secs("READY_TIMEOUT_SECS", d.ready_timeout)?,
            ready_poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "READY_POLL_INTERVAL_MS",
                d.ready_poll_interval.as_millis() as u64,
            )?),
            provision_attempts: parse_or(&lookup, "PROVISION_ATTEMPTS", d.provision_attempts)?,
            dispatch_attempts: parse_or(&lookup, "DISPATCH_ATTEMPTS", d.dispatch_attempts)?,
            terminal_policy: parse_or(&lookup, "BATCH_TERMINAL_POLICY", d.terminal_policy)?,
            worker_selection: parse_or(&lookup, "WORKER_SELECTION", d.worker_selection)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_batch_size == 0 {
            return invalid("MAX_BATCH_SIZE must be at least 1");
        }
        if self.totp.period_secs == 0 {
            return invalid("TOTP_PERIOD_SECS must be at least 1");
        }
        if !(6..=8).contains(&self.totp.digits) {
            return invalid("TOTP_DIGITS must be between 6 and 8");
        }
        if self.totp_validity_margin >= self.totp.period() {
            return invalid("TOTP_VALIDITY_MARGIN_SECS must be shorter than TOTP_PERIOD_SECS");
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.heartbeat_ttl {
            return invalid("HEARTBEAT_INTERVAL_SECS must be non-zero and below HEARTBEAT_TTL_SECS");
        }
        if self.ready_poll_interval.is_zero() {
            return invalid("READY_POLL_INTERVAL_MS must be non-zero");
        }
        if self.provision_attempts == 0 || self.dispatch_attempts == 0 {
            return invalid("PROVISION_ATTEMPTS and DISPATCH_ATTEMPTS must be at least 1");
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Result<(), CoreError> {
    Err(CoreError::Validation(message.to_string()))
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CoreError::Validation(format!("{key} is invalid: {e}"))),
    }
}
