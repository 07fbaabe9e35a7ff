//! Endpoint handlers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use super::pipeline::ClientIp;
use super::response::success;
use crate::auth::{AuthError, AuthGuard, Registration, UserProfile};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<AuthGuard>,
}

#[derive(Debug, Default, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Default, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginData {
    user: UserProfile,
    access_token: String,
    refresh_token: Option<String>,
    token_type: &'static str,
    expires_in: u64,
}

#[derive(Debug, Serialize)]
struct RegisterData {
    user: UserProfile,
    email_confirmation_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<u64>,
}

/// Routes served by bouncer, without middleware.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/login", post(login))
        .route("/api/register", post(register))
        .route("/health", get(health))
}

fn payload<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    body.map(|Json(body)| body).map_err(|rejection| {
        debug!(error = %rejection, "Rejected request body");
        AuthError::Validation("Invalid JSON payload".to_string())
    })
}

#[instrument(skip_all)]
async fn login(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, AuthError> {
    let admission = state.guard.admit_login(&ip).await?;
    let request = payload(body)?;
    let session = state
        .guard
        .complete_login(&admission, &request.email, &request.password)
        .await?;

    Ok(success(
        StatusCode::OK,
        "Login successful",
        LoginData {
            user: session.user,
            access_token: session.access_token,
            refresh_token: session.refresh_token,
            token_type: "Bearer",
            expires_in: session.expires_in,
        },
    ))
}

#[instrument(skip_all)]
async fn register(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, AuthError> {
    let admission = state.guard.admit_register(&ip).await?;
    let request = payload(body)?;
    let outcome = state
        .guard
        .complete_register(
            &admission,
            Registration {
                email: request.email,
                password: request.password,
                full_name: request.full_name,
                phone: request.phone,
            },
        )
        .await?;

    let confirmation_required = outcome.confirmation_required();
    let message = if confirmation_required {
        "Registration successful. Please check your email to confirm your account."
    } else {
        "Registration successful"
    };

    // The provider may sign the new user straight in
    let session = outcome.session;
    Ok(success(
        StatusCode::CREATED,
        message,
        RegisterData {
            user: outcome.user,
            email_confirmation_required: confirmation_required,
            token_type: session.as_ref().map(|_| "Bearer"),
            expires_in: session.as_ref().map(|s| s.expires_in),
            refresh_token: session.as_ref().and_then(|s| s.refresh_token.clone()),
            access_token: session.map(|s| s.access_token),
        },
    ))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
