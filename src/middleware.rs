use crate::error::ThrottlerError;
use crate::handlers::SharedState;
use crate::key_generator::RequestAttributes;
use crate::response::{apply_rate_limit_headers, RateLimitExceeded};
use crate::throttler::{Admission, Throttler};
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Identity set on the request by the host's authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Point in time after which the host no longer wants an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDeadline(pub tokio::time::Instant);

/// Admission control in front of the wrapped service.
///
/// Dropping the request future (client went away) abandons any pending store
/// round trip; a passed `RequestDeadline` does the same and answers 503
/// without forwarding.
pub async fn rate_limit_middleware(
    State(throttler): State<Arc<Throttler>>,
    request: Request,
    next: Next,
) -> Response {
    let attrs = request_attributes(&request);

    let admission = match request.extensions().get::<RequestDeadline>().copied() {
        Some(RequestDeadline(deadline)) => {
            match tokio::time::timeout_at(deadline, throttler.check(&attrs)).await {
                Ok(admission) => admission,
                Err(_) => {
                    warn!(
                        target: "gatekeeper::middleware",
                        method = %attrs.method,
                        path = %attrs.path,
                        "Request deadline passed during admission"
                    );
                    return (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(serde_json::json!({
                            "error": {
                                "code": "REQUEST_TIMEOUT",
                                "message": "Request deadline exceeded."
                            }
                        })),
                    )
                        .into_response();
                }
            }
        }
        None => throttler.check(&attrs).await,
    };

    match admission {
        Admission::Bypassed(_) => next.run(request).await,
        Admission::Evaluated {
            decision,
            emit_headers,
            ..
        } if decision.allowed => {
            let mut response = next.run(request).await;
            if emit_headers {
                apply_rate_limit_headers(response.headers_mut(), &decision);
            }
            response
        }
        Admission::Evaluated {
            decision,
            emit_headers,
            ..
        } => RateLimitExceeded::new(decision, emit_headers).into_response(),
    }
}

/// Bearer-token guard for the admin routes. Refuses everything when no
/// token is configured.
pub async fn admin_auth_middleware(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return ThrottlerError::Unauthorized("Admin API is disabled").into_response();
    };

    let verdict = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| tokens_match(token, expected));

    match verdict {
        Some(true) => next.run(request).await,
        Some(false) => {
            warn!(
                target: "gatekeeper::middleware",
                method = %request.method(),
                path = %request.uri().path(),
                peer = ?peer_ip(&request),
                "Rejected admin request with invalid token"
            );
            ThrottlerError::Unauthorized("Invalid admin token").into_response()
        }
        None => ThrottlerError::Unauthorized("Missing admin token").into_response(),
    }
}

// Fixed-length digests: comparison time does not depend on the token prefix.
fn tokens_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Collect what the engine needs from an axum request.
pub fn request_attributes(request: &Request) -> RequestAttributes {
    let headers = request.headers();

    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            Query::<HashMap<String, String>>::try_from_uri(request.uri())
                .ok()
                .and_then(|Query(mut params)| params.remove("api_key"))
        })
        .filter(|key| !key.is_empty());

    RequestAttributes {
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        peer_ip: peer_ip(request),
        forwarded_for: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        user_id: request
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|user| user.0.clone()),
        api_key,
    }
}

fn peer_ip(request: &Request) -> Option<std::net::IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .or_else(|| request.extensions().get::<SocketAddr>().map(|addr| addr.ip()))
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let peer = peer_ip(&request)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        target: "gatekeeper::middleware",
        method = %method,
        uri = %uri,
        peer = %peer,
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    info!(
        target: "gatekeeper::middleware",
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    response
}
