//! JSON envelopes shared by every endpoint.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::auth::AuthError;

#[derive(Debug, Serialize)]
pub struct SuccessBody<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub data: T,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

/// A `{success: true, message, data}` response with the given status.
pub fn success<T: Serialize>(status: StatusCode, message: &str, data: T) -> Response {
    let body = SuccessBody {
        success: true,
        message: message.to_string(),
        data,
    };
    (status, Json(body)).into_response()
}

/// A `{success: false, error}` response.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    error_body(status, message.into(), None)
}

/// A 429 carrying the retry hint in both the `Retry-After` header and the body.
pub fn too_many_requests(retry_after_secs: u64) -> Response {
    error_body(
        StatusCode::TOO_MANY_REQUESTS,
        AuthError::RateLimited { retry_after_secs }.to_string(),
        Some(retry_after_secs),
    )
}

fn error_body(status: StatusCode, error: String, retry_after: Option<u64>) -> Response {
    let body = ErrorBody {
        success: false,
        error,
        retry_after,
    };

    let mut response = (status, Json(body)).into_response();
    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::RateLimited { retry_after_secs } => too_many_requests(retry_after_secs),
            AuthError::InvalidCredentials | AuthError::EmailNotConfirmed => {
                error_response(StatusCode::UNAUTHORIZED, self.to_string())
            }
            AuthError::Validation(message) => error_response(StatusCode::BAD_REQUEST, message),
            AuthError::Unavailable(message) => {
                error_response(StatusCode::SERVICE_UNAVAILABLE, message)
            }
            AuthError::Internal(ref detail) => {
                tracing::error!(detail = %detail, "Internal error");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let response = AuthError::RateLimited {
            retry_after_secs: 120,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "120");

        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["retry_after"], 120);
        assert_eq!(body["error"], "Too many attempts. Please try again later.");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        assert_eq!(
            AuthError::InvalidCredentials.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::Validation("bad".to_string()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AuthError::Unavailable("down".to_string())
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_internal_detail_not_leaked() {
        let response = AuthError::Internal("db password wrong".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = json_body(response).await;
        assert_eq!(body["error"], "An unexpected error occurred");
        assert!(body.get("retry_after").is_none());
    }

    #[tokio::test]
    async fn test_success_envelope() {
        let response = success(StatusCode::CREATED, "Created", serde_json::json!({"id": 1}));
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Created");
        assert_eq!(body["data"]["id"], 1);
    }
}
