//! Rate limiting algorithms module
//!
//! Admission decisions are made per bucket against the shared counter store.
//! The sliding window log is the only algorithm the engine ships with.

pub mod sliding_window;

pub use sliding_window::SlidingWindowLimiter;

use crate::error::ThrottlerResult;
use crate::rate_limit_config::{RateLimitRule, Window};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Result of evaluating one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix timestamp (seconds)
    pub reset_at: u64,
    /// Seconds, set on denial only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// The counter store could not be consulted and the request was let through.
    #[serde(skip)]
    pub degraded: bool,
}

impl Decision {
    pub fn allowed(limit: u64, remaining: u64, reset_at: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after: None,
            degraded: false,
        }
    }

    pub fn denied(limit: u64, reset_at: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after: Some(retry_after),
            degraded: false,
        }
    }

    pub fn fail_open(limit: u64, reset_at: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at,
            retry_after: None,
            degraded: true,
        }
    }
}

/// Trait for rate limiting algorithms
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    /// Charge one request against `key`. Never fails: store problems resolve
    /// to a fail-open decision.
    async fn evaluate(&self, key: &str, rule: &RateLimitRule, timeout: Duration) -> Decision;

    /// Current in-window usage of `key` without consuming quota.
    async fn usage(&self, key: &str, window: Window, timeout: Duration) -> ThrottlerResult<u64>;

    /// Drop all recorded usage for `key`.
    async fn reset(&self, key: &str) -> ThrottlerResult<bool>;
}

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
