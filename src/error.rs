//! Error types for the Bouncer service.

use thiserror::Error;

/// Main error type for Bouncer operations.
#[derive(Error, Debug)]
pub enum BouncerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The attempt was rejected; the caller may retry after the given delay
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// The counting store could not be read or written
    #[error("Rate limit storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A caller passed an empty key or a non-positive limit
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bouncer operations.
pub type Result<T> = std::result::Result<T, BouncerError>;
