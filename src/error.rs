//! Error types for the ThrottleX service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for ThrottleX operations.
#[derive(Error, Debug)]
pub enum ThrottlexError {
    /// Input rejected at the boundary (empty ids, out-of-range limits)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The state store could not be reached or failed the operation
    #[error("Backend unavailable: {0}")]
    Backend(String),

    /// The state store round trip exceeded the configured timeout
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    /// The state store does not know the mutation script handle
    #[error("Unknown script handle: {0}")]
    UnknownScript(String),

    /// Admin delete of a policy that does not exist
    #[error("Policy not found")]
    PolicyNotFound,

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Policy record (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metric registration or encoding errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ThrottlexError {
    /// Whether this error means the backing store is unavailable.
    ///
    /// Redis errors count only when the connection itself failed. Server
    /// replies such as `WRONGTYPE` are not outages.
    pub fn is_backend_unavailable(&self) -> bool {
        match self {
            ThrottlexError::Backend(_) | ThrottlexError::Timeout(_) => true,
            ThrottlexError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            _ => false,
        }
    }
}

/// Result type alias for ThrottleX operations.
pub type Result<T> = std::result::Result<T, ThrottlexError>;
