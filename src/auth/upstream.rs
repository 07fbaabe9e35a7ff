//! GoTrue-style HTTP implementation of the auth provider port.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use super::provider::{
    AuthProvider, Credentials, ProviderError, Registration, Session, SignUpOutcome, UserProfile,
};
use crate::config::UpstreamConfig;
use crate::error::{BouncerError, Result};

/// Access token lifetime assumed when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Auth provider that talks to a GoTrue-compatible REST API.
#[derive(Clone)]
pub struct HttpAuthProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    email_confirmed_at: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    user_metadata: UserMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamSession {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    user: UpstreamUser,
}

#[derive(Debug, Deserialize)]
struct UpstreamSignUp {
    #[serde(default)]
    user: Option<UpstreamUser>,
    #[serde(default)]
    session: Option<UpstreamSession>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamErrorBody {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

impl UpstreamErrorBody {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    fn text(self) -> Option<String> {
        self.error_description.or(self.message).or(self.msg)
    }
}

impl From<UpstreamUser> for UserProfile {
    fn from(user: UpstreamUser) -> Self {
        Self {
            id: user.id,
            email: user.email.unwrap_or_default(),
            full_name: user.user_metadata.full_name.filter(|s| !s.is_empty()),
            phone: user.user_metadata.phone.filter(|s| !s.is_empty()),
            role: user.role.unwrap_or_else(|| "authenticated".to_string()),
            email_confirmed: user.email_confirmed_at.is_some(),
            created_at: user.created_at,
        }
    }
}

impl From<UpstreamSession> for Session {
    fn from(session: UpstreamSession) -> Self {
        Self {
            user: session.user.into(),
            access_token: session.access_token,
            refresh_token: session.refresh_token,
            expires_in: session.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        }
    }
}

impl HttpAuthProvider {
    /// Create a provider from configuration.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BouncerError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> std::result::Result<(StatusCode, String), ProviderError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, path = path, "Upstream auth request failed");
                ProviderError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("failed to read response: {e}")))?;

        debug!(path = path, status = status.as_u16(), "Upstream auth response");
        Ok((status, text))
    }
}

/// Classify a non-success sign-in response.
fn sign_in_error(status: StatusCode, body: &str) -> ProviderError {
    match status {
        StatusCode::BAD_REQUEST => ProviderError::Rejected,
        StatusCode::UNPROCESSABLE_ENTITY => {
            let message = UpstreamErrorBody::parse(body)
                .text()
                .unwrap_or_else(|| "Invalid login data".to_string());
            if message.contains("not confirmed") {
                ProviderError::Unconfirmed
            } else {
                ProviderError::Invalid(message)
            }
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Throttled,
        status => ProviderError::Unavailable(format!("unexpected status {status}")),
    }
}

/// Classify a non-success sign-up response.
fn sign_up_error(status: StatusCode, body: &str) -> ProviderError {
    match status {
        StatusCode::UNPROCESSABLE_ENTITY => {
            let message = UpstreamErrorBody::parse(body)
                .text()
                .unwrap_or_else(|| "Validation error".to_string());
            // GoTrue phrases its duplicate-address refusals in terms of the email
            if message.contains("already registered") || message.contains("email") {
                ProviderError::AlreadyRegistered
            } else {
                ProviderError::Invalid(message)
            }
        }
        StatusCode::BAD_REQUEST => ProviderError::Invalid(
            UpstreamErrorBody::parse(body)
                .text()
                .unwrap_or_else(|| "Invalid registration data".to_string()),
        ),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Throttled,
        status => ProviderError::Unavailable(format!("unexpected status {status}")),
    }
}

fn parse_session(body: &str) -> std::result::Result<Session, ProviderError> {
    let session: UpstreamSession = serde_json::from_str(body)
        .map_err(|e| ProviderError::Unavailable(format!("invalid session response: {e}")))?;
    if session.user.email_confirmed_at.is_none() {
        return Err(ProviderError::Unconfirmed);
    }
    Ok(session.into())
}

fn parse_sign_up(body: &str) -> std::result::Result<SignUpOutcome, ProviderError> {
    let response: UpstreamSignUp = serde_json::from_str(body)
        .map_err(|e| ProviderError::Unavailable(format!("invalid sign-up response: {e}")))?;

    let session: Option<Session> = response.session.map(Into::into);
    let user = match (response.user, &session) {
        (Some(user), _) => user.into(),
        (None, Some(session)) => session.user.clone(),
        (None, None) => {
            return Err(ProviderError::Unavailable(
                "sign-up response contained no user".to_string(),
            ))
        }
    };

    Ok(SignUpOutcome { user, session })
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn sign_in(&self, credentials: &Credentials) -> std::result::Result<Session, ProviderError> {
        let (status, body) = self
            .post(
                "token?grant_type=password",
                json!({
                    "email": credentials.email,
                    "password": credentials.password,
                }),
            )
            .await?;

        if status.is_success() {
            parse_session(&body)
        } else {
            Err(sign_in_error(status, &body))
        }
    }

    async fn sign_up(
        &self,
        registration: &Registration,
    ) -> std::result::Result<SignUpOutcome, ProviderError> {
        let (status, body) = self
            .post(
                "signup",
                json!({
                    "email": registration.email,
                    "password": registration.password,
                    "data": {
                        "full_name": registration.full_name.clone().unwrap_or_default(),
                        "phone": registration.phone.clone().unwrap_or_default(),
                        "role": "authenticated",
                        "created_via": "api_registration",
                    },
                }),
            )
            .await?;

        if status.is_success() {
            parse_sign_up(&body)
        } else {
            Err(sign_up_error(status, &body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION_BODY: &str = r#"{
        "access_token": "at",
        "refresh_token": "rt",
        "expires_in": 3600,
        "user": {
            "id": "u1",
            "email": "a@b.com",
            "email_confirmed_at": "2024-01-01T00:00:00Z",
            "created_at": "2023-12-31T00:00:00Z",
            "user_metadata": {"full_name": "Ada", "phone": ""}
        }
    }"#;

    #[test]
    fn test_parse_session() {
        let session = parse_session(SESSION_BODY).unwrap();
        assert_eq!(session.access_token, "at");
        assert_eq!(session.refresh_token.as_deref(), Some("rt"));
        assert_eq!(session.user.full_name.as_deref(), Some("Ada"));
        assert_eq!(session.user.phone, None);
        assert_eq!(session.user.role, "authenticated");
        assert!(session.user.email_confirmed);
    }

    #[test]
    fn test_unconfirmed_session_rejected() {
        let body = r#"{"access_token": "at", "user": {"id": "u1", "email": "a@b.com"}}"#;
        assert!(matches!(parse_session(body), Err(ProviderError::Unconfirmed)));
    }

    #[test]
    fn test_garbage_session_is_unavailable() {
        assert!(matches!(parse_session("<html>"), Err(ProviderError::Unavailable(_))));
    }

    #[test]
    fn test_sign_in_error_classification() {
        assert!(matches!(
            sign_in_error(StatusCode::BAD_REQUEST, r#"{"error_description":"Invalid login credentials"}"#),
            ProviderError::Rejected
        ));
        assert!(matches!(
            sign_in_error(StatusCode::UNPROCESSABLE_ENTITY, r#"{"msg":"Email not confirmed"}"#),
            ProviderError::Unconfirmed
        ));
        assert!(matches!(
            sign_in_error(StatusCode::UNPROCESSABLE_ENTITY, r#"{"msg":"bad grant"}"#),
            ProviderError::Invalid(msg) if msg == "bad grant"
        ));
        assert!(matches!(
            sign_in_error(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::Throttled
        ));
        assert!(matches!(
            sign_in_error(StatusCode::BAD_GATEWAY, ""),
            ProviderError::Unavailable(_)
        ));
    }

    #[test]
    fn test_sign_up_error_classification() {
        assert!(matches!(
            sign_up_error(StatusCode::UNPROCESSABLE_ENTITY, r#"{"msg":"User already registered"}"#),
            ProviderError::AlreadyRegistered
        ));
        assert!(matches!(
            sign_up_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                r#"{"msg":"A user with this email address has already been registered"}"#
            ),
            ProviderError::AlreadyRegistered
        ));
        assert!(matches!(
            sign_up_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                r#"{"msg":"Password should be at least 6 characters"}"#
            ),
            ProviderError::Invalid(msg) if msg == "Password should be at least 6 characters"
        ));
        assert!(matches!(
            sign_up_error(StatusCode::UNPROCESSABLE_ENTITY, ""),
            ProviderError::Invalid(msg) if msg == "Validation error"
        ));
        assert!(matches!(
            sign_up_error(StatusCode::BAD_REQUEST, "not json"),
            ProviderError::Invalid(msg) if msg == "Invalid registration data"
        ));
    }

    #[test]
    fn test_parse_sign_up_pending_confirmation() {
        let body = r#"{"user": {"id": "u2", "email": "new@b.com"}}"#;
        let outcome = parse_sign_up(body).unwrap();
        assert_eq!(outcome.user.id, "u2");
        assert!(outcome.session.is_none());
        assert!(outcome.confirmation_required());
    }

    #[test]
    fn test_parse_sign_up_with_session() {
        let body = format!(r#"{{"session": {SESSION_BODY}}}"#);
        let outcome = parse_sign_up(&body).unwrap();
        assert_eq!(outcome.user.id, "u1");
        assert!(outcome.session.is_some());
        assert!(!outcome.confirmation_required());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let provider = HttpAuthProvider::new(&UpstreamConfig {
            base_url: "https://example.com/auth/v1/".to_string(),
            api_key: "key".to_string(),
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(provider.base_url, "https://example.com/auth/v1");
    }
}
