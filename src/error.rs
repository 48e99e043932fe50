//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy name that was never registered
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// Counter store errors that are not tied to a specific backend client
    #[error("Store error: {0}")]
    Store(String),

    /// Errors reported by the distributed backend
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
