//! Scripted provider for flow tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::provider::{
    AuthProvider, Credentials, ProviderError, Registration, Session, SignUpOutcome, UserProfile,
};

pub(crate) fn profile(email: &str) -> UserProfile {
    UserProfile {
        id: format!("id-{email}"),
        email: email.to_string(),
        full_name: None,
        phone: None,
        role: "authenticated".to_string(),
        email_confirmed: true,
        created_at: None,
    }
}

pub(crate) fn session(email: &str) -> Session {
    Session {
        user: profile(email),
        access_token: "access".to_string(),
        refresh_token: Some("refresh".to_string()),
        expires_in: 3600,
    }
}

/// Accepts exactly one password per email and counts upstream calls.
pub(crate) struct FakeProvider {
    password: String,
    sign_ups: Mutex<VecDeque<Result<SignUpOutcome, ProviderError>>>,
    sign_in_calls: AtomicUsize,
    sign_up_calls: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn with_password(password: &str) -> Self {
        Self {
            password: password.to_string(),
            sign_ups: Mutex::new(VecDeque::new()),
            sign_in_calls: AtomicUsize::new(0),
            sign_up_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push_sign_up(&self, result: Result<SignUpOutcome, ProviderError>) {
        self.sign_ups.lock().push_back(result);
    }

    pub(crate) fn sign_in_calls(&self) -> usize {
        self.sign_in_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sign_up_calls(&self) -> usize {
        self.sign_up_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for FakeProvider {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, ProviderError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        if credentials.password == self.password {
            Ok(session(&credentials.email))
        } else {
            Err(ProviderError::Rejected)
        }
    }

    async fn sign_up(&self, registration: &Registration) -> Result<SignUpOutcome, ProviderError> {
        self.sign_up_calls.fetch_add(1, Ordering::SeqCst);
        self.sign_ups.lock().pop_front().unwrap_or_else(|| {
            Ok(SignUpOutcome {
                user: UserProfile {
                    email_confirmed: false,
                    ..profile(&registration.email)
                },
                session: None,
            })
        })
    }
}
