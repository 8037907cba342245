use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::service::ServiceError;

/// Error returned by every handler: a status plus a human readable message,
/// rendered as `{"error": <reason>, "message": <message>}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn too_many_requests() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "too many requests, try again later",
        )
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::UserNotFound
            | ServiceError::PostNotFound
            | ServiceError::CommentNotFound => StatusCode::NOT_FOUND,
            ServiceError::UserAlreadyExists => StatusCode::CONFLICT,
            ServiceError::InvalidCredentials
            | ServiceError::InvalidRefreshToken
            | ServiceError::RefreshTokenExpired
            | ServiceError::WeakPassword(_)
            | ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::TokenGeneration
            | ServiceError::PasswordHash
            | ServiceError::Database => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        warn!(error = %rejection.body_text(), "rejected request body");
        Self::bad_request("invalid request body")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let reason = self.status.canonical_reason().unwrap_or("Error");
        (
            self.status,
            Json(json!({"error": reason, "message": self.message})),
        )
            .into_response()
    }
}
