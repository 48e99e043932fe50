//! Policy registry.
//!
//! Holds the named policies and lazily creates one limiter per policy
//! signature, all bound to the single counter store picked at startup.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::limiter::FixedWindowLimiter;
use super::policy::{configured_policies, Policy, PolicySignature};
use crate::cache::Cache;
use crate::config::TollgateConfig;
use crate::error::Result;
use crate::store::{BackendKind, CounterStore};

/// Registry of policies and their limiters.
///
/// Built once at startup and shared for the lifetime of the process.
pub struct PolicyRegistry {
    store: Arc<CounterStore>,
    policies: RwLock<HashMap<String, Policy>>,
    limiters: DashMap<PolicySignature, Arc<FixedWindowLimiter>>,
    sweeper: Option<JoinHandle<()>>,
}

impl PolicyRegistry {
    /// Create an empty registry over `store`.
    pub fn new(store: Arc<CounterStore>) -> Self {
        Self {
            store,
            policies: RwLock::new(HashMap::new()),
            limiters: DashMap::new(),
            sweeper: None,
        }
    }

    /// Build the registry described by `config`.
    ///
    /// Probes the distributed store and falls back to the local one when it
    /// cannot be reached; only invalid settings or policies make this fail. A local
    /// store gets a background sweeper for expired entries.
    pub async fn from_config(config: &TollgateConfig) -> Result<Self> {
        config.validate()?;
        let policies = configured_policies(&config.store.key_prefix, &config.policies)?;

        let store = Arc::new(CounterStore::connect(&config.store).await);
        let mut registry = Self::new(store);

        if let Some(local) = registry.store.as_local() {
            registry.sweeper = Some(local.spawn_sweeper(config.store.sweep_interval()));
        }

        for policy in policies {
            registry.register(policy)?;
        }

        info!(
            backend = %registry.backend_kind(),
            policies = registry.policies.read().len(),
            "Policy registry ready"
        );

        Ok(registry)
    }

    /// Register `policy` under its name, replacing any previous one.
    pub fn register(&self, policy: Policy) -> Result<()> {
        policy.validate()?;
        debug!(
            name = %policy.name,
            signature = %policy.signature(),
            "Registered policy"
        );
        self.policies.write().insert(policy.name.clone(), policy);
        Ok(())
    }

    /// Look up a policy by name.
    pub fn policy(&self, name: &str) -> Option<Policy> {
        self.policies.read().get(name).cloned()
    }

    /// Names of all registered policies, sorted.
    pub fn policy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// The limiter enforcing `policy`.
    ///
    /// Policies with the same signature share one limiter. Creation holds the
    /// map shard lock, so concurrent first use yields a single instance.
    pub fn limiter_for(&self, policy: &Policy) -> Arc<FixedWindowLimiter> {
        let signature = policy.signature();
        if let Some(limiter) = self.limiters.get(&signature) {
            return limiter.clone();
        }

        self.limiters
            .entry(signature.clone())
            .or_insert_with(|| {
                debug!(signature = %signature, "Creating limiter");
                Arc::new(FixedWindowLimiter::new(signature.clone(), self.store.clone()))
            })
            .clone()
    }

    /// Number of limiters created so far.
    pub fn limiter_count(&self) -> usize {
        self.limiters.len()
    }

    /// The counter store every limiter is bound to.
    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    /// A cache facade over the same store.
    pub fn cache(&self) -> Cache {
        Cache::new(self.store.clone())
    }

    /// The backend chosen at startup.
    pub fn backend_kind(&self) -> BackendKind {
        self.store.kind()
    }
}

impl Drop for PolicyRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
