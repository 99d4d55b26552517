//! TOTP coordinator.
//!
//! Hands out passcodes that are exclusively reserved in the shared store, so
//! no two batches ever log in with the same code. Reservations are never
//! released early; a used code stays blocked until its TTL runs out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rpa_core::clock::Clock;
use rpa_core::config::CoordinationConfig;
use rpa_core::totp::{
    code_at, remaining_validity, ReservationTtlPolicy, TotpCounter, TotpMetrics, TotpParams,
    TotpReservation, TotpSecret,
};
use rpa_core::types::provider_key;
use rpa_store::repositories::TotpRepo;
use rpa_store::StateStore;

use crate::error::TotpError;

/// Suffix of the per-provider secret variables, e.g. `ACME_TOTP_SECRET`.
const SECRET_ENV_SUFFIX: &str = "_TOTP_SECRET";

/// A code reserved for one requester.
#[derive(Clone, PartialEq, Eq)]
pub struct ReservedCode {
    pub provider: String,
    pub code: String,
    pub owner_batch_id: String,
    /// Validity left on the code when it was reserved.
    pub valid_for: Duration,
}

impl fmt::Debug for ReservedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservedCode")
            .field("provider", &self.provider)
            .field("code", &"<redacted>")
            .field("owner_batch_id", &self.owner_batch_id)
            .field("valid_for", &self.valid_for)
            .finish()
    }
}

/// Collect `{PROVIDER}_TOTP_SECRET` variables into per-provider secrets,
/// keyed by canonical provider name.
pub fn secrets_from_vars<I>(vars: I) -> Result<HashMap<String, TotpSecret>, TotpError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut secrets = HashMap::new();
    for (key, value) in vars {
        let Some(provider) = key.strip_suffix(SECRET_ENV_SUFFIX) else {
            continue;
        };
        if provider.is_empty() || value.trim().is_empty() {
            continue;
        }
        let secret = TotpSecret::from_base32(&value)?;
        secrets.insert(provider_key(provider), secret);
    }
    Ok(secrets)
}

pub struct TotpCoordinator {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    secrets: HashMap<String, TotpSecret>,
    params: TotpParams,
    validity_margin: Duration,
    ttl_policy: ReservationTtlPolicy,
}

impl TotpCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        secrets: HashMap<String, TotpSecret>,
        config: &CoordinationConfig,
    ) -> Self {
        let secrets = secrets
            .into_iter()
            .map(|(provider, secret)| (provider_key(&provider), secret))
            .collect();
        Self {
            store,
            clock,
            secrets,
            params: config.totp,
            validity_margin: config.totp_validity_margin,
            ttl_policy: config.reservation_ttl,
        }
    }

    /// Load secrets from the process environment.
    pub fn from_env(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: &CoordinationConfig,
    ) -> Result<Self, TotpError> {
        let secrets = secrets_from_vars(std::env::vars())?;
        tracing::info!(providers = secrets.len(), "Loaded TOTP secrets");
        Ok(Self::new(store, clock, secrets, config))
    }

    /// Providers without a secret log in without a code.
    pub fn provider_requires_totp(&self, provider: &str) -> bool {
        self.secrets.contains_key(&provider_key(provider))
    }

    /// Reserve the current code for `requester_id`.
    ///
    /// If the code is taken, or expires within the validity margin, waits for
    /// the next time step and tries once more before giving up with
    /// [`TotpError::CodeContention`].
    pub async fn get_fresh_code(
        &self,
        provider: &str,
        requester_id: &str,
    ) -> Result<ReservedCode, TotpError> {
        let provider = provider_key(provider);
        let provider = provider.as_str();
        let secret = self
            .secrets
            .get(provider)
            .ok_or_else(|| TotpError::NoSecret(provider.to_string()))?;
        let period = self.params.period();

        for attempt in 1..=2 {
            let now = self.clock.now();
            let remaining = remaining_validity(now, self.params.period_secs);

            if remaining >= self.validity_margin {
                let code = code_at(secret, now, &self.params)?;
                let reservation = TotpReservation {
                    owner_batch_id: requester_id.to_string(),
                    reserved_at: now,
                };
                let ttl = self.ttl_policy.ttl(remaining, period);
                if TotpRepo::reserve(self.store.as_ref(), provider, &code, &reservation, ttl).await? {
                    TotpRepo::increment(self.store.as_ref(), provider, TotpCounter::Generated).await?;
                    tracing::info!(
                        provider,
                        requester_id,
                        valid_for_ms = remaining.as_millis() as u64,
                        "TOTP code reserved",
                    );
                    return Ok(ReservedCode {
                        provider: provider.to_string(),
                        code,
                        owner_batch_id: requester_id.to_string(),
                        valid_for: remaining,
                    });
                }
                tracing::debug!(provider, requester_id, attempt, "TOTP code already reserved");
            } else {
                tracing::debug!(
                    provider,
                    requester_id,
                    remaining_ms = remaining.as_millis() as u64,
                    "TOTP code too close to expiry",
                );
            }

            if attempt == 1 {
                self.clock.sleep(remaining).await;
            }
        }

        tracing::warn!(provider, requester_id, "TOTP code contention");
        Err(TotpError::CodeContention {
            provider: provider.to_string(),
        })
    }

    /// Record the outcome of a login with a reserved code. The reservation
    /// itself is left to expire.
    pub async fn consume(
        &self,
        provider: &str,
        code: &str,
        requester_id: &str,
        success: bool,
    ) -> Result<(), TotpError> {
        TotpRepo::record_use(self.store.as_ref(), &provider_key(provider), code, requester_id, success).await?;
        Ok(())
    }

    pub async fn metrics(&self, provider: &str) -> Result<TotpMetrics, TotpError> {
        Ok(TotpRepo::metrics(self.store.as_ref(), &provider_key(provider)).await?)
    }

    pub async fn reset_metrics(&self, provider: &str) -> Result<(), TotpError> {
        TotpRepo::reset_metrics(self.store.as_ref(), &provider_key(provider)).await?;
        tracing::info!(provider, "TOTP metrics reset");
        Ok(())
    }

    /// The store answers and at least one secret is configured.
    pub async fn health_check(&self) -> Result<(), TotpError> {
        self.store.ping().await?;
        if self.secrets.is_empty() {
            return Err(TotpError::NoSecret("<any>".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn secrets_are_read_from_suffixed_variables() {
        let vars = vec![
            ("ACME_TOTP_SECRET".to_string(), "GEZDGNBVGY3TQOJQ".to_string()),
            ("ACME_USERNAME".to_string(), "bot".to_string()),
            ("EMPTY_TOTP_SECRET".to_string(), " ".to_string()),
        ];
        let secrets = secrets_from_vars(vars).unwrap();
        assert_eq!(secrets.len(), 1);
        assert!(secrets.contains_key("acme"));
    }

    #[test]
    fn malformed_secret_is_rejected() {
        let vars = vec![("ACME_TOTP_SECRET".to_string(), "not base32!".to_string())];
        assert_matches!(secrets_from_vars(vars), Err(TotpError::Core(_)));
    }

    #[test]
    fn reserved_code_debug_hides_the_code() {
        let code = ReservedCode {
            provider: "acme".into(),
            code: "123456".into(),
            owner_batch_id: "b1".into(),
            valid_for: Duration::from_secs(20),
        };
        assert!(!format!("{code:?}").contains("123456"));
    }
}
