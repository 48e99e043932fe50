//! Configuration management for Tollgate.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `TOLLGATE__*` environment variables (for example
//! `TOLLGATE__STORE__REDIS_URL` or `TOLLGATE__POLICIES__AUTH__POINTS`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-policy overrides, keyed by policy name
    #[serde(default)]
    pub policies: HashMap<String, PolicyOverride>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Whether `X-Forwarded-For` / `X-Real-IP` are trusted as the client
    /// address. Enable only behind a proxy that sets them.
    #[serde(default = "default_trust_forwarded")]
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_forwarded_headers: default_trust_forwarded(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_trust_forwarded() -> bool {
    false
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL of the distributed backend. When absent the local
    /// in-memory store is used without probing.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// How long the startup probe waits for the distributed backend
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Prefix prepended to every policy's counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Interval between expiry sweeps of the local store
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            connect_timeout_ms: default_connect_timeout(),
            key_prefix: default_key_prefix(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "store.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

/// Override of a policy's limits. Any field left unset keeps the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// Requests allowed per window
    #[serde(default)]
    pub points: Option<u32>,

    /// Window length in seconds
    #[serde(default)]
    pub duration: Option<u64>,

    /// Block length in seconds once the window is exceeded (0 = none)
    #[serde(default)]
    pub block_duration: Option<u64>,
}

impl TollgateConfig {
    /// Load configuration from defaults, an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .and_then(|c| c.try_deserialize::<TollgateConfig>())
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings that serde defaults cannot guard.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert!(!config.server.trust_forwarded_headers);
        assert!(config.store.redis_url.is_none());
        assert_eq!(config.store.key_prefix, "rate_limit");
        assert_eq!(config.store.connect_timeout(), Duration::from_secs(2));
        assert!(config.policies.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
store:
  redis_url: "redis://cache:6379"
  connect_timeout_ms: 500
policies:
  auth:
    points: 20
  newsletter:
    points: 2
    duration: 86400
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.store.connect_timeout_ms, 500);
        // untouched fields keep their defaults
        assert_eq!(config.store.key_prefix, "rate_limit");

        let auth = &config.policies["auth"];
        assert_eq!(auth.points, Some(20));
        assert_eq!(auth.duration, None);

        let newsletter = &config.policies["newsletter"];
        assert_eq!(newsletter.duration, Some(86400));
        assert_eq!(newsletter.block_duration, None);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = TollgateConfig::from_yaml("server: [not, a, map]");
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let config = TollgateConfig::from_yaml("store:\n  sweep_interval_secs: 0\n").unwrap();
        assert!(matches!(config.validate(), Err(TollgateError::Config(_))));

        let config = TollgateConfig::from_yaml("store:\n  connect_timeout_ms: 0\n").unwrap();
        assert!(matches!(config.validate(), Err(TollgateError::Config(_))));

        assert!(TollgateConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TollgateConfig::load(None).unwrap();
        assert_eq!(config.store.sweep_interval_secs, 60);
    }
}
