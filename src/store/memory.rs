//! Process-local counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{StoreBackend, WindowHit};
use crate::error::{Result, TollgateError};

/// A stored value and its expiry.
#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: impl Into<String>, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value: value.into(),
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }

    fn as_integer(&self, key: &str) -> Result<i64> {
        self.value.parse::<i64>().map_err(|_| {
            TollgateError::Store(format!("value at '{}' is not an integer", key))
        })
    }
}

/// In-memory counter store.
///
/// Entries live in a sharded map. Read-modify-write operations hold the
/// shard lock of their key for the whole update and never suspend while
/// holding it, so concurrent increments on one key are serialized. Expired
/// entries are dropped lazily on access and by [`MemoryStore::purge_expired`].
///
/// Time is read from `tokio::time`, so tests can drive expiry with a paused clock.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired entries from local store");
        }
        purged
    }

    /// Spawn a task that purges expired entries every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.purge_expired();
            }
        })
    }

    /// Live copy of the value at `key`, dropping it if it has expired.
    fn live(&self, key: &str, now: Instant) -> Option<StoredValue> {
        self.entries.remove_if(key, |_, v| v.is_expired(now));
        self.entries.get(key).map(|v| v.clone())
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowHit> {
        let now = Instant::now();
        let mut slot = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| StoredValue::new("0", Some(window), now));

        if slot.is_expired(now) {
            *slot = StoredValue::new("0", Some(window), now);
        }

        let count = slot.as_integer(key)? + 1;
        slot.value = count.to_string();
        if count == 1 || slot.expires_at.is_none() {
            slot.expires_at = Some(now + window);
        }

        let remaining = slot.remaining(now).unwrap_or(window);
        trace!(key = %key, count = count, "Incremented local counter");

        Ok(WindowHit {
            count: count.max(0) as u64,
            remaining,
        })
    }

    async fn peek(&self, key: &str) -> Result<Option<WindowHit>> {
        let now = Instant::now();
        match self.live(key, now) {
            Some(v) => {
                let count = v.as_integer(key)?;
                Ok(Some(WindowHit {
                    count: count.max(0) as u64,
                    remaining: v.remaining(now).unwrap_or(Duration::ZERO),
                }))
            }
            None => Ok(None),
        }
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        let now = Instant::now();
        self.entries
            .insert(key.to_owned(), StoredValue::new("1", Some(duration), now));
        Ok(())
    }

    async fn block_remaining(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .live(key, now)
            .and_then(|v| v.remaining(now))
            .filter(|d| !d.is_zero()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live(key, Instant::now()).map(|v| v.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        self.entries
            .insert(key.to_owned(), StoredValue::new(value, ttl, now));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, v)| !v.is_expired(now)))
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| TollgateError::Store(format!("invalid key pattern '{}': {}", pattern, e)))?;
        let now = Instant::now();

        // collect first so no shard lock is held while removing
        let matched: Vec<String> = self
            .entries
            .iter()
            .filter(|e| matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let removed = matched
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .filter(|(_, v)| !v.is_expired(now))
            .count();

        Ok(removed as u64)
    }

    async fn increment_by(&self, key: &str, by: i64) -> Result<i64> {
        let now = Instant::now();
        let mut slot = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| StoredValue::new("0", None, now));

        if slot.is_expired(now) {
            *slot = StoredValue::new("0", None, now);
        }

        let value = slot.as_integer(key)?.checked_add(by).ok_or_else(|| {
            TollgateError::Store(format!("increment of '{}' would overflow", key))
        })?;
        slot.value = value.to_string();
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|k| self.live(k, now).map(|v| v.value))
            .collect())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    #[tokio::test(start_paused = true)]
    async fn test_increment_starts_window() {
        let store = MemoryStore::new();

        let hit = store.increment("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(hit.count, 1);
        assert_eq!(hit.remaining, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(10)).await;

        // the second hit keeps the original expiry
        let hit = store.increment("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(hit.count, 2);
        assert_eq!(hit.remaining, Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_resets_after_window() {
        let store = MemoryStore::new();

        for _ in 0..3 {
            store.increment("k", Duration::from_secs(5)).await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(5)).await;

        let hit = store.increment("k", Duration::from_secs(5)).await.unwrap();
        assert_eq!(hit.count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = MemoryStore::new();

        let tasks = (0..64).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.increment("hot", Duration::from_secs(60)).await })
        });

        let mut counts: Vec<u64> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap().count)
            .collect();
        counts.sort_unstable();

        assert_eq!(counts, (1..=64).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires() {
        let store = MemoryStore::new();

        store.block("b", Duration::from_secs(30)).await.unwrap();
        assert_eq!(
            store.block_remaining("b").await.unwrap(),
            Some(Duration::from_secs(30))
        );

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.block_remaining("b").await.unwrap(), None);
        assert!(!store.is_blocked("b").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_after_ttl_is_none() {
        let store = MemoryStore::new();

        store
            .set("k", "v", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_pattern_only_removes_matches() {
        let store = MemoryStore::new();
        store.set("rate_limit:public:1.2.3.4", "1", None).await.unwrap();
        store.set("rate_limit:public:5.6.7.8", "1", None).await.unwrap();
        store.set("rate_limit:auth:1.2.3.4", "1", None).await.unwrap();
        store.set("session:abc", "{}", None).await.unwrap();

        let removed = store.delete_pattern("rate_limit:public:*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("rate_limit:auth:1.2.3.4").await.unwrap().is_some());
        assert!(store.get("session:abc").await.unwrap().is_some());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_pattern_rejects_invalid_glob() {
        let store = MemoryStore::new();
        assert!(store.delete_pattern("a[").await.is_err());
    }

    #[tokio::test]
    async fn test_increment_by_on_non_integer_fails() {
        let store = MemoryStore::new();
        store.set("k", "hello", None).await.unwrap();
        assert!(store.increment_by("k", 1).await.is_err());

        assert_eq!(store.increment_by("n", 5).await.unwrap(), 5);
        assert_eq!(store.increment_by("n", -2).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set("short", "1", Some(Duration::from_secs(1))).await.unwrap();
        store.set("long", "1", Some(Duration::from_secs(100))).await.unwrap();
        store.set("forever", "1", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_in_background() {
        let store = MemoryStore::new();
        store.set("short", "1", Some(Duration::from_secs(1))).await.unwrap();

        let handle = store.spawn_sweeper(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(store.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_get_many_preserves_order() {
        let store = MemoryStore::new();
        store.set("a", "1", None).await.unwrap();
        store.set("c", "3", None).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = store.get_many(&keys).await.unwrap();
        assert_eq!(
            values,
            vec![Some("1".to_string()), None, Some("3".to_string())]
        );
    }
}
