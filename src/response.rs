use crate::algorithms::Decision;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Attach `X-RateLimit-*` (and `Retry-After` on denial) for `decision`.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset_at));
    if let Some(retry_after) = decision.retry_after {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    }
}

#[derive(Debug, Serialize)]
pub struct RateLimitErrorBody {
    pub error: RateLimitErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct RateLimitErrorDetail {
    pub code: &'static str,
    pub message: &'static str,
    pub retry_after: u64,
}

/// The 429 returned when a request is denied. Carries nothing about which
/// rule denied it or why beyond the wait time.
#[derive(Debug)]
pub struct RateLimitExceeded {
    decision: Decision,
    emit_headers: bool,
}

impl RateLimitExceeded {
    pub fn new(decision: Decision, emit_headers: bool) -> Self {
        Self {
            decision,
            emit_headers,
        }
    }
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        let retry_after = self.decision.retry_after.unwrap_or(1);
        let body = RateLimitErrorBody {
            error: RateLimitErrorDetail {
                code: "RATE_LIMIT_EXCEEDED",
                message: "Too many requests. Please try again later.",
                retry_after,
            },
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        if self.emit_headers {
            apply_rate_limit_headers(response.headers_mut(), &self.decision);
        } else {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub message: String,
    pub config: serde_json::Value,
}

impl ConfigResponse {
    pub fn updated(config: serde_json::Value) -> Self {
        Self {
            message: "Configuration updated successfully".to_string(),
            config,
        }
    }

    pub fn current(config: serde_json::Value) -> Self {
        Self {
            message: "Current configuration".to_string(),
            config,
        }
    }
}
