use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ThrottlerError;
use crate::health::HealthChecker;
use crate::rate_limit_config::{RateLimitConfig, Window};
use crate::response::ConfigResponse;
use crate::throttler::Throttler;
use crate::validation::RequestValidator;

/// Shared application state
pub type SharedState = Arc<AppState>;

/// Application state: the throttler, where its rules came from and the
/// bearer token guarding `/admin`. Without a token the admin API refuses
/// every request.
pub struct AppState {
    pub throttler: Arc<Throttler>,
    pub rules_file: Option<PathBuf>,
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(throttler: Arc<Throttler>, rules_file: Option<PathBuf>) -> Self {
        Self {
            throttler,
            rules_file,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.is_empty()).then_some(token);
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct BucketQuery {
    #[serde(default = "default_window")]
    pub window: Window,
}

fn default_window() -> Window {
    Window::Minute
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let status = HealthChecker::new(state.throttler.clone()).check_health().await;
    Json(status)
}

/// Readiness check endpoint. The service admits traffic without its store
/// (failing open), so it reports ready either way.
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let store = state.throttler.store();
    match store.ping().await {
        Ok(()) => Json(serde_json::json!({
            "status": "ready",
            "store": store.backend(),
            "store_connected": true
        })),
        Err(e) => {
            warn!(target: "gatekeeper::handlers", error = %e, "Counter store unreachable");
            Json(serde_json::json!({
                "status": "ready",
                "store": store.backend(),
                "store_connected": false,
                "note": "Admitting requests without rate limiting until the store recovers"
            }))
        }
    }
}

/// Admission counters
pub async fn get_metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.throttler.metrics().snapshot())
}

/// Configuration currently in force
pub async fn get_config(State(state): State<SharedState>) -> Result<impl IntoResponse, ThrottlerError> {
    let config = serde_json::to_value(&state.throttler.config().source)
        .map_err(|e| ThrottlerError::Internal(e.to_string()))?;
    Ok(Json(ConfigResponse::current(config)))
}

/// Replace the configuration. Nothing changes unless the new one compiles.
pub async fn update_config(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let config = RequestValidator::validate_config_request(body)?;
    state.throttler.reload(config)?;
    info!(target: "gatekeeper::handlers", "Configuration replaced via admin API");

    let current = serde_json::to_value(&state.throttler.config().source)
        .map_err(|e| ThrottlerError::Internal(e.to_string()))?;
    Ok(Json(ConfigResponse::updated(current)))
}

/// Re-read the rules file the service was started with.
pub async fn reload_config(State(state): State<SharedState>) -> Result<impl IntoResponse, ThrottlerError> {
    let path = state.rules_file.clone().ok_or_else(|| {
        ThrottlerError::ValidationError("No rules file configured".to_string())
    })?;

    let config = tokio::task::spawn_blocking(move || RateLimitConfig::from_file(&path))
        .await
        .map_err(|e| ThrottlerError::Internal(e.to_string()))??;
    state.throttler.reload(config)?;

    let current = serde_json::to_value(&state.throttler.config().source)
        .map_err(|e| ThrottlerError::Internal(e.to_string()))?;
    Ok(Json(ConfigResponse::updated(current)))
}

/// Inspect the usage of one bucket
pub async fn get_bucket(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Query(query): Query<BucketQuery>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let prefix = state.throttler.config().key_prefix.clone();
    RequestValidator::validate_bucket_key(&key, &prefix)?;

    let usage = state.throttler.bucket_usage(&key, query.window).await?;

    Ok(Json(serde_json::json!({
        "key": key,
        "window": query.window,
        "usage": usage
    })))
}

/// Clear one bucket
pub async fn delete_bucket(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let prefix = state.throttler.config().key_prefix.clone();
    RequestValidator::validate_bucket_key(&key, &prefix)?;

    let removed = state.throttler.reset_bucket(&key).await?;

    Ok(Json(serde_json::json!({
        "key": key,
        "removed": removed
    })))
}

/// Stand-in for the protected service behind the middleware
pub async fn passthrough() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
