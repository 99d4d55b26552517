//! In-process [`StateStore`] for single-node runs and tests.
//!
//! Expiry uses `tokio::time::Instant`, so tests running with paused time can
//! expire heartbeats and reservations with `tokio::time::advance`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::store::{Expiry, StateStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn deadline(expiry: Expiry, now: Instant, current: Option<Instant>) -> Option<Instant> {
    match expiry {
        Expiry::Never => None,
        Expiry::After(ttl) => Some(now + ttl),
        Expiry::Keep => current,
    }
}

/// Remove `key` if it has expired so callers only ever see live entries.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let current = live(&mut entries, key, now).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(expiry, now, current),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, expiry: Expiry) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(expiry, now, None),
            },
        );
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        expiry: Expiry,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = deadline(expiry, now, entry.expires_at);
                entry.value = new.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let (current, expires_at) = match live(&mut entries, key, now) {
            Some(entry) => {
                let value = entry.value.parse::<i64>().map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("counter is not an integer: {e}"),
                })?;
                (value, entry.expires_at)
            }
            None => (0, None),
        };
        let next = current + delta;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        let existed = live(&mut entries, key, Instant::now()).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut found: Vec<(String, String)> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok((before - entries.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn set_nx_has_one_winner() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "a", Expiry::Never).await.unwrap());
        assert!(!store.set_nx("k", "b", Expiry::Never).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn concurrent_set_nx_has_exactly_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let attempts = (0..32).map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.set_nx("race", &i.to_string(), Expiry::Never).await })
        });
        let wins = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(true))))
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_read_as_missing() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Expiry::After(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.set_nx("k", "w", Expiry::Never).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_set_requires_matching_value() {
        let store = MemoryStore::new();
        store.set("k", "1", Expiry::Never).await.unwrap();
        assert!(!store.compare_and_set("k", "0", "2", Expiry::Keep).await.unwrap());
        assert!(store.compare_and_set("k", "1", "2", Expiry::Keep).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
        assert!(!store.compare_and_set("missing", "1", "2", Expiry::Keep).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn compare_and_set_can_extend_or_keep_expiry() {
        let store = MemoryStore::new();
        store
            .set("hb", "w1", Expiry::After(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store
            .compare_and_set("hb", "w1", "w1", Expiry::After(Duration::from_secs(10)))
            .await
            .unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get("hb").await.unwrap().is_some());

        assert!(store.compare_and_set("hb", "w1", "w2", Expiry::Keep).await.unwrap());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get("hb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn incr_starts_at_zero_and_rejects_text() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c", 1).await.unwrap(), 1);
        assert_eq!(store.incr("c", 2).await.unwrap(), 3);
        store.set("t", "abc", Expiry::Never).await.unwrap();
        assert!(matches!(
            store.incr("t", 1).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_and_purge_skip_expired_entries() {
        let store = MemoryStore::new();
        store.set("a:1", "x", Expiry::Never).await.unwrap();
        store
            .set("a:2", "y", Expiry::After(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set("b:1", "z", Expiry::Never).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let found = store.scan_prefix("a:").await.unwrap();
        assert_eq!(found, vec![("a:1".to_string(), "x".to_string())]);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = MemoryStore::new();
        store.set("k", "v", Expiry::Never).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
