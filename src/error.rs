//! Error types for the Rampart engine.
//!
//! Only configuration errors surface to callers. Infrastructure failures
//! (store unreachable or unhealthy) are resolved inside the limiter via the
//! policy's failure mode and never propagate as errors.

use thiserror::Error;

/// Main error type for Rampart operations.
#[derive(Error, Debug)]
pub enum RampartError {
    /// A policy name was requested that is not registered.
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    /// Configuration-related errors (malformed thresholds, bad YAML, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors while loading configuration files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Rampart operations.
pub type Result<T> = std::result::Result<T, RampartError>;
