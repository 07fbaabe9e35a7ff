//! Errors surfaced to authentication callers.

use thiserror::Error;

use crate::error::BouncerError;

/// Failure of a login or registration attempt.
///
/// The `Display` text of each variant is safe to show to the client. Rate
/// limit rejections carry a retry hint but never say which limit tripped.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Too many attempts from this client or for this account
    #[error("Too many attempts. Please try again later.")]
    RateLimited { retry_after_secs: u64 },

    /// Unknown email or wrong password; deliberately indistinguishable
    #[error("Invalid email or password")]
    InvalidCredentials,

    /// The account exists but its email address is unconfirmed
    #[error("Please confirm your email address before logging in")]
    EmailNotConfirmed,

    /// The request itself is malformed
    #[error("{0}")]
    Validation(String),

    /// The upstream provider or the limiter's store is unreachable
    #[error("{0}")]
    Unavailable(String),

    /// Anything else; the detail is for logs only
    #[error("An unexpected error occurred")]
    Internal(String),
}

impl From<BouncerError> for AuthError {
    fn from(error: BouncerError) -> Self {
        match error {
            BouncerError::RateLimitExceeded { retry_after_secs } => {
                AuthError::RateLimited { retry_after_secs }
            }
            BouncerError::StorageUnavailable(_) => AuthError::Unavailable(
                "Service temporarily unavailable. Please try again later.".to_string(),
            ),
            other => AuthError::Internal(other.to_string()),
        }
    }
}
