//! TOTP reservations and per-provider counters.

use std::time::Duration;

use rpa_core::totp::{metrics_key, reservation_key, TotpCounter, TotpMetrics, TotpReservation};

use crate::cas::load_json;
use crate::error::StoreError;
use crate::store::{Expiry, StateStore};

pub struct TotpRepo;

impl TotpRepo {
    /// Reserve `(provider, code)` for `ttl`. Exactly one concurrent caller
    /// gets `true`.
    pub async fn reserve(
        store: &dyn StateStore,
        provider: &str,
        code: &str,
        reservation: &TotpReservation,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let value = serde_json::to_string(reservation)?;
        store
            .set_nx(&reservation_key(provider, code), &value, Expiry::After(ttl))
            .await
    }

    pub async fn reservation(
        store: &dyn StateStore,
        provider: &str,
        code: &str,
    ) -> Result<Option<TotpReservation>, StoreError> {
        load_json(store, &reservation_key(provider, code)).await
    }

    pub async fn increment(
        store: &dyn StateStore,
        provider: &str,
        counter: TotpCounter,
    ) -> Result<i64, StoreError> {
        store.incr(&metrics_key(provider, counter), 1).await
    }

    /// Count one login attempt with `code`. The reservation is untouched.
    pub async fn record_use(
        store: &dyn StateStore,
        provider: &str,
        code: &str,
        requester_id: &str,
        success: bool,
    ) -> Result<(), StoreError> {
        match Self::reservation(store, provider, code).await? {
            Some(r) if r.owner_batch_id != requester_id => {
                tracing::warn!(
                    provider,
                    requester_id,
                    owner = %r.owner_batch_id,
                    "TOTP code used by a requester that did not reserve it",
                );
            }
            None => tracing::debug!(provider, requester_id, "TOTP reservation already expired"),
            Some(_) => {}
        }
        Self::increment(store, provider, TotpCounter::Consumed).await?;
        if success {
            Self::increment(store, provider, TotpCounter::Successful).await?;
        }
        Ok(())
    }

    pub async fn metrics(store: &dyn StateStore, provider: &str) -> Result<TotpMetrics, StoreError> {
        let mut values = [0u64; 3];
        for (slot, counter) in values.iter_mut().zip(TotpCounter::ALL) {
            let key = metrics_key(provider, counter);
            *slot = match store.get(&key).await? {
                Some(raw) => raw.parse::<u64>().map_err(|e| StoreError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?,
                None => 0,
            };
        }
        let [generated, consumed, successful] = values;
        Ok(TotpMetrics {
            provider: provider.to_string(),
            generated,
            consumed,
            successful,
        })
    }

    pub async fn reset_metrics(store: &dyn StateStore, provider: &str) -> Result<(), StoreError> {
        for counter in TotpCounter::ALL {
            store.delete(&metrics_key(provider, counter)).await?;
        }
        Ok(())
    }
}
