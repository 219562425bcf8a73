//! Sliding window rate limiting algorithm
//!
//! Keeps a cost-weighted log of request timestamps per bucket and admits a
//! request when the sum over the trailing window, including the request
//! itself, stays within the rule's limit. There is no boundary at which the
//! count resets, so bursts straddling a window edge are still counted.

use super::{Clock, Decision, RateLimitAlgorithm, SystemClock};
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::rate_limit_config::{RateLimitRule, Window};
use crate::store::CounterStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Sliding window rate limiter implementation
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a new sliding window rate limiter
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn with_system_clock(store: Arc<dyn CounterStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

fn secs_ceil(ms: u64) -> u64 {
    ms.div_ceil(1_000)
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowLimiter {
    async fn evaluate(&self, key: &str, rule: &RateLimitRule, timeout: Duration) -> Decision {
        let now_ms = self.clock.now_ms();
        let window_ms = rule.window.as_millis();
        let limit = rule.max_requests;
        let reset_at = secs_ceil(now_ms + window_ms);

        let attempt = tokio::time::timeout(
            timeout,
            self.store.record(key, rule.cost, limit, now_ms, window_ms),
        )
        .await;

        let recorded = match attempt {
            Ok(Ok(recorded)) => recorded,
            Ok(Err(err)) => {
                warn!(
                    target: "gatekeeper::store",
                    key = %key,
                    backend = self.store.backend(),
                    error = %err,
                    "Counter store unavailable, allowing request"
                );
                return Decision::fail_open(limit, reset_at);
            }
            Err(_) => {
                warn!(
                    target: "gatekeeper::store",
                    key = %key,
                    backend = self.store.backend(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Counter store timed out, allowing request"
                );
                return Decision::fail_open(limit, reset_at);
            }
        };

        if recorded.total <= limit {
            return Decision::allowed(limit, limit - recorded.total, reset_at);
        }

        let retry_after = recorded
            .retry_after_ms
            .map(secs_ceil)
            .unwrap_or_else(|| rule.window.as_secs())
            .max(1);
        Decision::denied(limit, now_ms / 1_000 + retry_after, retry_after)
    }

    async fn usage(&self, key: &str, window: Window, timeout: Duration) -> ThrottlerResult<u64> {
        let now_ms = self.clock.now_ms();
        tokio::time::timeout(timeout, self.store.peek(key, now_ms, window.as_millis()))
            .await
            .map_err(|_| ThrottlerError::StoreUnavailable("peek timed out".to_string()))?
    }

    async fn reset(&self, key: &str) -> ThrottlerResult<bool> {
        self.store.reset(key).await
    }
}
