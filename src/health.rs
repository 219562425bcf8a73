use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::throttler::Throttler;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub rate_limiting_enabled: bool,
    pub rules: usize,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub counter_store: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub backend: String,
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

/// Reported in place of the store's own error, which can name hosts.
const STORE_UNREACHABLE: &str = "counter store unreachable";

/// Upper bound on a health check of the counter store.
const CHECK_TIMEOUT: Duration = Duration::from_secs(1);

pub struct HealthChecker {
    throttler: Arc<Throttler>,
}

impl HealthChecker {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        Self { throttler }
    }

    /// Pin the uptime origin. Called at startup so uptime is not measured
    /// from the first health check.
    pub fn mark_started() {
        std::sync::LazyLock::force(&START_TIME);
    }

    pub fn started_at() -> SystemTime {
        *START_TIME
    }

    /// The service is "degraded" rather than unhealthy without its store:
    /// requests are still served, failing open.
    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let store_status = self.check_store().await;
        let overall_status = if store_status.status == "healthy" {
            "healthy"
        } else {
            "degraded"
        };

        let config = self.throttler.config();
        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            rate_limiting_enabled: config.enabled,
            rules: config.rules.len(),
            dependencies: DependencyStatus {
                counter_store: store_status,
            },
        }
    }

    async fn check_store(&self) -> ServiceStatus {
        let store = self.throttler.store();
        let start = Instant::now();
        let result = tokio::time::timeout(CHECK_TIMEOUT, store.ping()).await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                warn!(target: "gatekeeper::health", error = %err, "Counter store health check failed");
                Some(STORE_UNREACHABLE.to_string())
            }
            Err(_) => {
                warn!(target: "gatekeeper::health", "Counter store health check timed out");
                Some(STORE_UNREACHABLE.to_string())
            }
        };

        ServiceStatus {
            backend: store.backend().to_string(),
            status: if error.is_none() { "healthy" } else { "unavailable" }.to_string(),
            response_time_ms,
            error,
        }
    }
}
