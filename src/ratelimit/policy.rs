//! Named rate limiting policies.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::key::RequestInfo;
use crate::config::PolicyOverride;
use crate::error::{Result, TollgateError};

/// Derives a client key from a request. Returning `None` (or a blank string)
/// lets key resolution fall back to the client address.
pub type KeyGenerator = Arc<dyn Fn(&RequestInfo) -> Option<String> + Send + Sync>;

/// Name of the policy guarding public read endpoints.
pub const PUBLIC: &str = "public";
/// Name of the policy guarding login and registration attempts.
pub const AUTH: &str = "auth";
/// Name of the policy guarding the contact form.
pub const CONTACT: &str = "contact";
/// Name of the policy guarding the admin API.
pub const ADMIN: &str = "admin";

/// A named fixed-window rate limiting policy.
#[derive(Clone)]
pub struct Policy {
    /// Name the policy is registered under
    pub name: String,
    /// Prefix of every key the policy writes
    pub key_prefix: String,
    /// Requests allowed per window
    pub points: u32,
    /// Window length
    pub duration: Duration,
    /// How long a client stays blocked after exceeding the window (zero = never)
    pub block_duration: Duration,
    /// Custom client key derivation
    pub key_generator: Option<KeyGenerator>,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("key_prefix", &self.key_prefix)
            .field("points", &self.points)
            .field("duration", &self.duration)
            .field("block_duration", &self.block_duration)
            .field("key_generator", &self.key_generator.is_some())
            .finish()
    }
}

/// The parameters that make two policies share one limiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicySignature {
    pub key_prefix: String,
    pub points: u32,
    pub duration: Duration,
    pub block_duration: Duration,
}

impl fmt::Display for PolicySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}/{}s block={}s]",
            self.key_prefix,
            self.points,
            self.duration.as_secs(),
            self.block_duration.as_secs()
        )
    }
}

impl PolicySignature {
    /// Key of the window counter for `client_key`.
    pub fn counter_key(&self, client_key: &str) -> String {
        format!("{}:{}", self.key_prefix, client_key)
    }

    /// Key of the block marker for `client_key`.
    pub fn block_key(&self, client_key: &str) -> String {
        format!("{}:block:{}", self.key_prefix, client_key)
    }

    /// Whether exceeding the window also blocks the client.
    pub fn blocks(&self) -> bool {
        !self.block_duration.is_zero()
    }
}

impl Policy {
    /// Create a policy with no block duration and the default key resolution.
    pub fn new(
        name: impl Into<String>,
        key_prefix: impl Into<String>,
        points: u32,
        duration_secs: u64,
    ) -> Self {
        Self {
            name: name.into(),
            key_prefix: key_prefix.into(),
            points,
            duration: Duration::from_secs(duration_secs),
            block_duration: Duration::ZERO,
            key_generator: None,
        }
    }

    /// Block clients for `secs` seconds once they exceed the window.
    pub fn with_block_duration(mut self, secs: u64) -> Self {
        self.block_duration = Duration::from_secs(secs);
        self
    }

    /// Derive client keys with `generator`.
    pub fn with_key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&RequestInfo) -> Option<String> + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    /// The identity used to share limiters between equal policies.
    pub fn signature(&self) -> PolicySignature {
        PolicySignature {
            key_prefix: self.key_prefix.clone(),
            points: self.points,
            duration: self.duration,
            block_duration: self.block_duration,
        }
    }

    /// Check that the policy can be enforced.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TollgateError::Config("policy name must not be empty".to_string()));
        }
        if self.key_prefix.is_empty() {
            return Err(TollgateError::Config(format!(
                "policy '{}': key prefix must not be empty",
                self.name
            )));
        }
        if self.points == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}': points must be greater than zero",
                self.name
            )));
        }
        if self.duration.is_zero() {
            return Err(TollgateError::Config(format!(
                "policy '{}': duration must be greater than zero",
                self.name
            )));
        }
        if !self.block_duration.is_zero() && self.block_duration < self.duration {
            return Err(TollgateError::Config(format!(
                "policy '{}': block duration ({}s) must not be shorter than the window ({}s)",
                self.name,
                self.block_duration.as_secs(),
                self.duration.as_secs()
            )));
        }
        Ok(())
    }

    /// Apply a configuration override on top of this policy.
    pub fn apply(&mut self, overrides: &PolicyOverride) {
        if let Some(points) = overrides.points {
            self.points = points;
        }
        if let Some(duration) = overrides.duration {
            self.duration = Duration::from_secs(duration);
        }
        if let Some(block) = overrides.block_duration {
            self.block_duration = Duration::from_secs(block);
        }
    }

    /// Public read endpoints: 100 requests per 15 minutes per address.
    pub fn public(prefix: &str) -> Self {
        Policy::new(PUBLIC, format!("{}:{}", prefix, PUBLIC), 100, 900)
    }

    /// Authentication: 10 attempts per 15 minutes, then blocked for an hour.
    pub fn auth(prefix: &str) -> Self {
        Policy::new(AUTH, format!("{}:{}", prefix, AUTH), 10, 900).with_block_duration(3600)
    }

    /// Contact form: 5 submissions per hour, then blocked for an hour.
    pub fn contact(prefix: &str) -> Self {
        Policy::new(CONTACT, format!("{}:{}", prefix, CONTACT), 5, 3600).with_block_duration(3600)
    }

    /// Admin API: 1000 requests per 15 minutes per signed-in user.
    pub fn admin(prefix: &str) -> Self {
        Policy::new(ADMIN, format!("{}:{}", prefix, ADMIN), 1000, 900).with_key_generator(|req| {
            req.identity.as_ref().map(|id| format!("user:{}", id))
        })
    }

    /// The built-in policies under `prefix`.
    pub fn builtin(prefix: &str) -> Vec<Policy> {
        vec![
            Policy::public(prefix),
            Policy::auth(prefix),
            Policy::contact(prefix),
            Policy::admin(prefix),
        ]
    }
}

/// Build the policy table from the built-ins and configured overrides.
///
/// An override naming a built-in adjusts it; any other name defines a new
/// policy and must set both `points` and `duration`.
pub fn configured_policies(
    prefix: &str,
    overrides: &HashMap<String, PolicyOverride>,
) -> Result<Vec<Policy>> {
    let mut policies = Policy::builtin(prefix);

    for (name, over) in overrides {
        match policies.iter_mut().find(|p| &p.name == name) {
            Some(policy) => policy.apply(over),
            None => {
                let (Some(points), Some(duration)) = (over.points, over.duration) else {
                    return Err(TollgateError::Config(format!(
                        "policy '{}' is not built in and must set points and duration",
                        name
                    )));
                };
                let policy = Policy::new(name.clone(), format!("{}:{}", prefix, name), points, duration)
                    .with_block_duration(over.block_duration.unwrap_or(0));
                policies.push(policy);
            }
        }
    }

    for policy in &policies {
        policy.validate()?;
    }

    Ok(policies)
}
