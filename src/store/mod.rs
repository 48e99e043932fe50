//! Counter store backends.
//!
//! The store is the only shared mutable state in the admission path. Every
//! mutation goes through an atomic operation of the backend: a single Lua
//! round-trip on the distributed backend, a per-key shard lock on the local
//! one.

mod memory;
mod distributed;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::distributed::RedisStore;

/// Result of counting one hit inside a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Hits recorded in the current window, including this one
    pub count: u64,
    /// Time left before the window expires
    pub remaining: Duration,
}

/// Operations every counter store backend provides.
///
/// Values are stored as strings. Counters are strings holding an integer,
/// so `increment` and `increment_by` on the same key interoperate.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Atomically add one hit to `key`. A missing or expired key starts a new
    /// window of length `window`; an existing key keeps its expiry.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowHit>;

    /// Read a window counter without counting a hit.
    async fn peek(&self, key: &str) -> Result<Option<WindowHit>>;

    /// Write a block marker for `key` that expires after `duration`.
    async fn block(&self, key: &str, duration: Duration) -> Result<()>;

    /// Remaining lifetime of the block marker for `key`, if any.
    async fn block_remaining(&self, key: &str) -> Result<Option<Duration>>;

    /// Whether a block marker for `key` is currently active.
    async fn is_blocked(&self, key: &str) -> Result<bool> {
        Ok(self.block_remaining(key).await?.is_some())
    }

    /// Read a raw value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a raw value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key matching a glob pattern and return how many were removed.
    ///
    /// Keys are matched against a scan of the keyspace; keys written while the
    /// scan runs may or may not be included.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64>;

    /// Atomically add `by` to an integer value, creating it at zero.
    async fn increment_by(&self, key: &str, by: i64) -> Result<i64>;

    /// Read several raw values at once, in the order of `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Cheap liveness probe.
    async fn healthy(&self) -> bool;
}

/// Which backend a [`CounterStore`] is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shared store visible to every instance
    Distributed,
    /// Process-local fallback
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Distributed => write!(f, "distributed"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// The counter store the process runs with, chosen once at startup.
pub enum CounterStore {
    /// Redis-backed store shared across instances
    Distributed(RedisStore),
    /// In-memory store used when the distributed backend is unreachable
    Local(MemoryStore),
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            CounterStore::Distributed($store) => $call,
            CounterStore::Local($store) => $call,
        }
    };
}

impl CounterStore {
    /// Build the store described by `config`.
    ///
    /// The distributed backend is used only if it connects and answers a ping
    /// within the configured timeout. Otherwise the local store is used and a
    /// warning is logged; this never fails.
    pub async fn connect(config: &StoreConfig) -> Self {
        let Some(url) = config.redis_url.as_deref() else {
            info!("No distributed store configured, using local counter store");
            return CounterStore::Local(MemoryStore::new());
        };

        match RedisStore::connect(url, config.connect_timeout()).await {
            Ok(store) if store.healthy().await => {
                info!(url = %url, "Connected to distributed counter store");
                CounterStore::Distributed(store)
            }
            Ok(_) => {
                warn!(
                    url = %url,
                    "Distributed counter store did not answer ping, falling back to local store"
                );
                CounterStore::Local(MemoryStore::new())
            }
            Err(e) => {
                warn!(
                    url = %url,
                    error = %e,
                    "Distributed counter store unavailable, falling back to local store"
                );
                CounterStore::Local(MemoryStore::new())
            }
        }
    }

    /// Create a store backed by local memory.
    pub fn local() -> Self {
        CounterStore::Local(MemoryStore::new())
    }

    /// The backend this store is bound to.
    pub fn kind(&self) -> BackendKind {
        match self {
            CounterStore::Distributed(_) => BackendKind::Distributed,
            CounterStore::Local(_) => BackendKind::Local,
        }
    }

    /// The local store, if this store is bound to it.
    pub fn as_local(&self) -> Option<&MemoryStore> {
        match self {
            CounterStore::Local(store) => Some(store),
            CounterStore::Distributed(_) => None,
        }
    }
}

#[async_trait]
impl StoreBackend for CounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowHit> {
        dispatch!(self, s => s.increment(key, window).await)
    }

    async fn peek(&self, key: &str) -> Result<Option<WindowHit>> {
        dispatch!(self, s => s.peek(key).await)
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        dispatch!(self, s => s.block(key, duration).await)
    }

    async fn block_remaining(&self, key: &str) -> Result<Option<Duration>> {
        dispatch!(self, s => s.block_remaining(key).await)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        dispatch!(self, s => s.get(key).await)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        dispatch!(self, s => s.set(key, value, ttl).await)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        dispatch!(self, s => s.delete(key).await)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        dispatch!(self, s => s.delete_pattern(pattern).await)
    }

    async fn increment_by(&self, key: &str, by: i64) -> Result<i64> {
        dispatch!(self, s => s.increment_by(key, by).await)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        dispatch!(self, s => s.get_many(keys).await)
    }

    async fn healthy(&self) -> bool {
        dispatch!(self, s => s.healthy().await)
    }
}
