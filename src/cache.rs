//! JSON cache on top of the counter store.
//!
//! The cache is an optimization layer: every backend error is logged and
//! turned into a miss or a negative result (`None`, `false`, `0`) instead of
//! being returned to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};

use crate::store::{BackendKind, CounterStore, StoreBackend};

/// General-purpose cache facade.
#[derive(Clone)]
pub struct Cache {
    store: Arc<CounterStore>,
}

impl Cache {
    /// Create a cache over `store`.
    pub fn new(store: Arc<CounterStore>) -> Self {
        Self { store }
    }

    /// The backend the cache writes to.
    pub fn backend_kind(&self) -> BackendKind {
        self.store.kind()
    }

    /// Read and deserialize the value at `key`.
    ///
    /// Missing, expired and malformed entries all read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(raw)) => decode(key, &raw),
            Ok(None) => None,
            Err(e) => {
                error!(key = %key, error = %e, "Cache get failed");
                None
            }
        }
    }

    /// Serialize `value` and store it under `key`. `None` keeps it until deleted.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                error!(key = %key, error = %e, "Cache value could not be serialized");
                return false;
            }
        };

        match self.store.set(key, &raw, ttl).await {
            Ok(()) => true,
            Err(e) => {
                error!(key = %key, error = %e, "Cache set failed");
                false
            }
        }
    }

    /// Delete `key`. Returns whether an entry was removed.
    pub async fn delete(&self, key: &str) -> bool {
        self.store.delete(key).await.unwrap_or_else(|e| {
            error!(key = %key, error = %e, "Cache delete failed");
            false
        })
    }

    /// Delete every key matching a glob pattern such as `rate_limit:public:*`.
    ///
    /// Best effort: keys created while the scan runs are not guaranteed to be
    /// included.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        self.store.delete_pattern(pattern).await.unwrap_or_else(|e| {
            error!(pattern = %pattern, error = %e, "Cache pattern delete failed");
            0
        })
    }

    /// Add `by` to the integer at `key` and return the new value, or 0 on failure.
    pub async fn increment(&self, key: &str, by: i64) -> i64 {
        self.store.increment_by(key, by).await.unwrap_or_else(|e| {
            error!(key = %key, error = %e, "Cache increment failed");
            0
        })
    }

    /// Read several keys at once. Every requested key is present in the result.
    pub async fn get_batch<T: DeserializeOwned>(&self, keys: &[String]) -> HashMap<String, Option<T>> {
        let values = match self.store.get_many(keys).await {
            Ok(values) => values,
            Err(e) => {
                error!(keys = keys.len(), error = %e, "Cache batch get failed");
                vec![None; keys.len()]
            }
        };

        keys.iter()
            .zip(values)
            .map(|(key, raw)| {
                let value = raw.and_then(|raw| decode(key, &raw));
                (key.clone(), value)
            })
            .collect()
    }

    /// Whether the underlying store answers.
    pub async fn healthy(&self) -> bool {
        self.store.healthy().await
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    serde_json::from_str(raw)
        .map_err(|e| warn!(key = %key, error = %e, "Discarding malformed cache entry"))
        .ok()
}
