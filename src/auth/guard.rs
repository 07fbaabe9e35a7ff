//! Login and registration flows.
//!
//! Every attempt is checked against the limiter before the upstream provider
//! is contacted, and the provider's verdict is fed back afterwards:
//!
//! 1. per-IP check for the action
//! 2. (login only) per-email check with a stricter threshold, so one account
//!    cannot be attacked from many addresses
//! 3. upstream call
//! 4. `record_success` / `record_failure` for every key checked in 1-2

use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info, instrument, warn};

use super::error::AuthError;
use super::provider::{AuthProvider, Credentials, ProviderError, Registration, Session, SignUpOutcome};
use super::validation::{is_valid_email, normalize_email, validate_password};
use crate::ratelimit::{LimitRule, RateLimitRules, RateLimiter};

/// Action name for login attempts.
pub const LOGIN_ACTION: &str = "login";
/// Action name for registration attempts.
pub const REGISTER_ACTION: &str = "register";

/// Retry hint used when the upstream provider throttles us without saying for how long.
const UPSTREAM_RETRY_AFTER_SECS: u64 = 60;

/// Proof that a login attempt passed the per-IP check.
///
/// HTTP handlers take one before reading the request body, so malformed
/// requests count against the client too.
#[derive(Debug)]
pub struct LoginAdmission {
    ip: String,
}

/// Proof that a registration attempt passed the per-IP check.
#[derive(Debug)]
pub struct RegisterAdmission {
    ip: String,
}

/// Coordinates the limiter and the upstream provider for auth requests.
pub struct AuthGuard {
    limiter: Arc<RateLimiter>,
    provider: Arc<dyn AuthProvider>,
    rules: RateLimitRules,
}

impl AuthGuard {
    /// Create a guard.
    pub fn new(
        limiter: Arc<RateLimiter>,
        provider: Arc<dyn AuthProvider>,
        rules: RateLimitRules,
    ) -> Self {
        Self {
            limiter,
            provider,
            rules,
        }
    }

    /// The limiter shared with the rest of the service.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Count a login attempt against the client IP.
    pub async fn admit_login(&self, ip: &str) -> Result<LoginAdmission, AuthError> {
        self.enforce(ip, LOGIN_ACTION, self.rules.login_ip).await?;
        Ok(LoginAdmission { ip: ip.to_string() })
    }

    /// Count a registration attempt against the client IP.
    pub async fn admit_register(&self, ip: &str) -> Result<RegisterAdmission, AuthError> {
        self.enforce(ip, REGISTER_ACTION, self.rules.register_ip)
            .await?;
        Ok(RegisterAdmission { ip: ip.to_string() })
    }

    /// Authenticate with email and password.
    pub async fn login(&self, ip: &str, email: &str, password: &str) -> Result<Session, AuthError> {
        let admission = self.admit_login(ip).await?;
        self.complete_login(&admission, email, password).await
    }

    /// Finish an admitted login: per-email check, then the upstream call.
    #[instrument(skip(self, admission, email, password), fields(ip = %admission.ip))]
    pub async fn complete_login(
        &self,
        admission: &LoginAdmission,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let ip = admission.ip.as_str();
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::Validation(
                "Email and password are required".to_string(),
            ));
        }

        self.enforce(&email, LOGIN_ACTION, self.rules.login_email)
            .await?;

        if !is_valid_email(&email) {
            return Err(AuthError::Validation("Invalid email format".to_string()));
        }

        let credentials = Credentials {
            email: email.clone(),
            password: password.to_string(),
        };
        let keys = [ip, email.as_str()];

        match self.provider.sign_in(&credentials).await {
            Ok(session) => {
                info!(user_id = %session.user.id, "User logged in");
                self.record_success(&keys, LOGIN_ACTION).await;
                Ok(session)
            }
            Err(ProviderError::Rejected) => {
                warn!(email = %email, "Failed login attempt");
                self.record_failure(&keys, LOGIN_ACTION).await;
                Err(AuthError::InvalidCredentials)
            }
            Err(ProviderError::Unconfirmed) => Err(AuthError::EmailNotConfirmed),
            Err(ProviderError::Invalid(message)) => Err(AuthError::Validation(message)),
            Err(ProviderError::AlreadyRegistered) => Err(AuthError::InvalidCredentials),
            Err(ProviderError::Throttled) => Err(AuthError::RateLimited {
                retry_after_secs: UPSTREAM_RETRY_AFTER_SECS,
            }),
            Err(ProviderError::Unavailable(reason)) => {
                error!(reason = %reason, "Auth provider unavailable during login");
                Err(AuthError::Unavailable(
                    "Authentication service temporarily unavailable. Please try again later."
                        .to_string(),
                ))
            }
        }
    }

    /// Create an account.
    pub async fn register(
        &self,
        ip: &str,
        registration: Registration,
    ) -> Result<SignUpOutcome, AuthError> {
        let admission = self.admit_register(ip).await?;
        self.complete_register(&admission, registration).await
    }

    /// Finish an admitted registration: validation, then the upstream call.
    #[instrument(skip(self, admission, registration), fields(ip = %admission.ip))]
    pub async fn complete_register(
        &self,
        admission: &RegisterAdmission,
        registration: Registration,
    ) -> Result<SignUpOutcome, AuthError> {
        let ip = admission.ip.as_str();
        let email = normalize_email(&registration.email);
        if email.is_empty() || registration.password.is_empty() {
            return Err(AuthError::Validation(
                "Email and password are required".to_string(),
            ));
        }
        if !is_valid_email(&email) {
            return Err(AuthError::Validation("Invalid email format".to_string()));
        }
        validate_password(&registration.password)
            .map_err(|message| AuthError::Validation(message.to_string()))?;

        let registration = Registration {
            email,
            full_name: trimmed(registration.full_name),
            phone: trimmed(registration.phone),
            ..registration
        };

        match self.provider.sign_up(&registration).await {
            Ok(outcome) => {
                info!(
                    user_id = %outcome.user.id,
                    confirmation_required = outcome.confirmation_required(),
                    "User registered"
                );
                self.record_success(&[ip], REGISTER_ACTION).await;
                Ok(outcome)
            }
            Err(ProviderError::AlreadyRegistered) => Err(AuthError::Validation(
                "An account with this email already exists".to_string(),
            )),
            Err(ProviderError::Invalid(message)) => Err(AuthError::Validation(message)),
            Err(ProviderError::Rejected) => Err(AuthError::Validation(
                "Invalid registration data".to_string(),
            )),
            Err(ProviderError::Throttled) => Err(AuthError::RateLimited {
                retry_after_secs: UPSTREAM_RETRY_AFTER_SECS,
            }),
            Err(e @ (ProviderError::Unconfirmed | ProviderError::Unavailable(_))) => {
                error!(error = %e, "Auth provider failed during registration");
                self.record_failure(&[ip], REGISTER_ACTION).await;
                Err(AuthError::Unavailable(
                    "Registration service temporarily unavailable. Please try again later."
                        .to_string(),
                ))
            }
        }
    }

    async fn enforce(&self, identifier: &str, action: &str, rule: LimitRule) -> Result<(), AuthError> {
        self.limiter
            .check_and_increment(identifier, action, rule.max_attempts, rule.window_secs)
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(action = action, error = %e, "Attempt refused by rate limiter");
                AuthError::from(e)
            })
    }

    async fn record_success(&self, identifiers: &[&str], action: &str) {
        let results = join_all(
            identifiers
                .iter()
                .map(|identifier| self.limiter.record_success(identifier, action)),
        )
        .await;

        for result in results {
            if let Err(e) = result {
                warn!(action = action, error = %e, "Failed to clear rate limit record");
            }
        }
    }

    async fn record_failure(&self, identifiers: &[&str], action: &str) {
        let results = join_all(
            identifiers
                .iter()
                .map(|identifier| self.limiter.record_failure(identifier, action)),
        )
        .await;

        for result in results {
            if let Err(e) = result {
                warn!(action = action, error = %e, "Failed to record auth failure");
            }
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
