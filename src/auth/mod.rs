//! Authentication flows guarded by the rate limiter.
//!
//! The upstream provider owns credentials and sessions; this module decides
//! whether an attempt may reach it and records how the attempt ended.

mod error;
mod guard;
mod provider;
mod upstream;
mod validation;

#[cfg(test)]
pub(crate) mod testing;

pub use error::AuthError;
pub use guard::{AuthGuard, LoginAdmission, RegisterAdmission, LOGIN_ACTION, REGISTER_ACTION};
pub use provider::{
    AuthProvider, Credentials, ProviderError, Registration, Session, SignUpOutcome, UserProfile,
};
pub use upstream::HttpAuthProvider;
pub use validation::{is_valid_email, normalize_email, validate_password};
