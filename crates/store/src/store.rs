use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Expiry applied by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The key never expires.
    Never,
    /// The key expires after the given duration.
    After(Duration),
    /// Keep the current expiry of an existing key; new keys never expire.
    Keep,
}

/// Atomic key-value store with TTL and compare-and-set.
///
/// Expired keys behave exactly like missing keys for every operation.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write.
    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> Result<(), StoreError>;

    /// Write only if the key is absent. Returns `true` for the single winner.
    async fn set_nx(&self, key: &str, value: &str, expiry: Expiry) -> Result<bool, StoreError>;

    /// Replace `expected` with `new`. Returns `false` if the current value
    /// differs or the key is absent.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        expiry: Expiry,
    ) -> Result<bool, StoreError>;

    /// Add `delta` to an integer counter, creating it at zero.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Live entries whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
