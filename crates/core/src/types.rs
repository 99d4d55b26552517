/// Job identifiers are issued by the job intake system.
pub type JobId = i64;

/// Batch identifiers are unique per provider.
pub type BatchId = String;

/// Stable identifier of a worker process (e.g. `worker-a`).
pub type WorkerId = String;

/// Identifier of an ephemeral execution unit.
pub type ServiceId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Canonical provider name. Batch keys, TOTP state, credentials and
/// automations are all looked up under this form.
pub fn provider_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
