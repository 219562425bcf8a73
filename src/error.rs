use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the admission engine and its admin surface.
///
/// Only `RuleConfig` is ever fatal. Everything that can happen while a request
/// is being admitted resolves to allow, deny or skip-this-rule inside the
/// engine and never reaches the host framework.
#[derive(Debug, Error)]
pub enum ThrottlerError {
    #[error("rule configuration error: {0}")]
    RuleConfig(String),

    #[error("counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("cannot derive rate limit subject: {0}")]
    InvalidSubject(&'static str),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ThrottlerResult<T> = Result<T, ThrottlerError>;

impl From<redis::RedisError> for ThrottlerError {
    fn from(err: redis::RedisError) -> Self {
        ThrottlerError::StoreUnavailable(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ThrottlerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottlerError::RuleConfig(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &ThrottlerError) -> Self {
        match err {
            ThrottlerError::RuleConfig(msg) => Self::new("configuration_error", msg, 422),
            ThrottlerError::ValidationError(msg) => Self::new("bad_request", msg, 400),
            ThrottlerError::InvalidSubject(msg) => Self::new("bad_request", msg, 400),
            ThrottlerError::Unauthorized(msg) => Self::new("unauthorized", msg, 401),
            ThrottlerError::StoreUnavailable(_) => {
                Self::new("service_unavailable", "Counter store unavailable", 503)
            }
            ThrottlerError::Internal(_) => {
                Self::new("internal_error", "Internal server error", 500)
            }
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(target: "gatekeeper::handlers", error = %self, "Request failed");
        }

        (status, Json(body)).into_response()
    }
}
