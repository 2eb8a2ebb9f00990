//! JSON error responses shared by every route and the idempotency layer.
//!
//! Body shape: `{"statusCode": 400, "error": "Bad Request", "message": "..."}`,
//! plus a machine-readable `reason` on idempotency conflicts.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

/// Why an idempotency key was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Key already bound to a different method, path or body
    DifferentRequestBody,
    /// Same request is still executing under this key
    AlreadyInProgress,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::DifferentRequestBody => "different_request_body",
            ConflictReason::AlreadyInProgress => "already_in_progress",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            ConflictReason::DifferentRequestBody => {
                "Idempotency key conflict - different request body"
            }
            ConflictReason::AlreadyInProgress => "Request is already in progress",
        }
    }
}

/// Error body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    status_code: u16,
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

/// Application error types for HTTP endpoints
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(ConflictReason),
    PayloadTooLarge(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, reason) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Conflict(reason) => (
                StatusCode::CONFLICT,
                reason.message().to_string(),
                Some(reason.as_str()),
            ),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg, None),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };

        let body = Json(ErrorResponse {
            status_code: status.as_u16(),
            error: status.canonical_reason().unwrap_or("Error"),
            message,
            reason,
        });

        (status, body).into_response()
    }
}
