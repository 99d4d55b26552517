//! Read-modify-write of JSON records through compare-and-set.

use rpa_core::error::CoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::store::{Expiry, StateStore};

/// Upper bound on CAS retries before giving up with [`StoreError::Contention`].
pub const MAX_CAS_ATTEMPTS: u32 = 32;

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T> {
    /// The mutation was written; holds the new record.
    Applied(T),
    /// The precondition did not hold; holds the record as read.
    Rejected(T),
}

impl<T> CasOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            CasOutcome::Applied(t) | CasOutcome::Rejected(t) => t,
        }
    }

    pub fn applied(self) -> Option<T> {
        match self {
            CasOutcome::Applied(t) => Some(t),
            CasOutcome::Rejected(_) => None,
        }
    }
}

pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Apply `mutate` to the record under `key` until the write lands.
///
/// `mutate` returns `Ok(false)` to leave the record untouched, which yields
/// [`CasOutcome::Rejected`]. It may run several times when writers race, so
/// it must only depend on the record it is given.
pub async fn update_json<T, F>(
    store: &dyn StateStore,
    key: &str,
    expiry: Expiry,
    mut mutate: F,
) -> Result<CasOutcome<T>, StoreError>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnMut(&mut T) -> Result<bool, CoreError> + Send,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let raw = store
            .get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let mut record: T = serde_json::from_str(&raw)?;
        if !mutate(&mut record)? {
            return Ok(CasOutcome::Rejected(record));
        }
        let next = serde_json::to_string(&record)?;
        if store.compare_and_set(key, &raw, &next, expiry).await? {
            return Ok(CasOutcome::Applied(record));
        }
        tracing::debug!(key, "Compare-and-set lost a race, retrying");
    }
    Err(StoreError::Contention {
        key: key.to_string(),
        attempts: MAX_CAS_ATTEMPTS,
    })
}
