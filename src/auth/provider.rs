//! Port to the upstream authentication service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Email and password for a sign-in.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// A new account request.
#[derive(Clone)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
    pub phone: Option<String>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("full_name", &self.full_name)
            .field("phone", &self.phone)
            .finish()
    }
}

/// The public view of an upstream user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub role: String,
    pub email_confirmed: bool,
    pub created_at: Option<String>,
}

/// An authenticated upstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: UserProfile,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

/// Result of a successful sign-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpOutcome {
    pub user: UserProfile,
    /// Present when the provider signed the new user straight in
    pub session: Option<Session>,
}

impl SignUpOutcome {
    /// Whether the user must confirm their email before logging in.
    pub fn confirmation_required(&self) -> bool {
        self.session.is_none() && !self.user.email_confirmed
    }
}

/// How the upstream provider refused or failed a request.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Wrong email or password
    #[error("credentials rejected")]
    Rejected,

    /// The account's email address is unconfirmed
    #[error("email address not confirmed")]
    Unconfirmed,

    /// Sign-up for an email that already has an account
    #[error("account already registered")]
    AlreadyRegistered,

    /// The provider refused the request content
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The provider is rate limiting us
    #[error("upstream throttled the request")]
    Throttled,

    /// Transport failure, 5xx, or an unreadable response
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

/// Trait for upstream authentication providers.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Exchange credentials for a session.
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, ProviderError>;

    /// Create an account.
    async fn sign_up(&self, registration: &Registration) -> Result<SignUpOutcome, ProviderError>;
}
