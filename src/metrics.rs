use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters exposed on the admin API.
///
/// `denied` counts traffic control working as intended; `store_failures`
/// counts rule evaluations that failed open because the counter store could
/// not be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    pub exempt_requests: u64,
    pub store_failures: u64,
    pub skipped_rules: u64,
    pub user_fallbacks: u64,
    pub since: u64,
}

#[derive(Debug)]
struct Counters {
    total: AtomicU64,
    allowed: AtomicU64,
    throttled: AtomicU64,
    exempt: AtomicU64,
    store_failures: AtomicU64,
    skipped_rules: AtomicU64,
    user_fallbacks: AtomicU64,
    since: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsCollector {
    counters: Arc<Counters>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters {
                total: AtomicU64::new(0),
                allowed: AtomicU64::new(0),
                throttled: AtomicU64::new(0),
                exempt: AtomicU64::new(0),
                store_failures: AtomicU64::new(0),
                skipped_rules: AtomicU64::new(0),
                user_fallbacks: AtomicU64::new(0),
                since: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            }),
        }
    }

    pub fn record_request(&self, allowed: bool) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.throttled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_exempt(&self) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters.exempt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_rule(&self) {
        self.counters.skipped_rules.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_user_fallback(&self) {
        self.counters.user_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ThrottleMetrics {
        let c = &self.counters;
        ThrottleMetrics {
            total_requests: c.total.load(Ordering::Relaxed),
            allowed_requests: c.allowed.load(Ordering::Relaxed),
            throttled_requests: c.throttled.load(Ordering::Relaxed),
            exempt_requests: c.exempt.load(Ordering::Relaxed),
            store_failures: c.store_failures.load(Ordering::Relaxed),
            skipped_rules: c.skipped_rules.load(Ordering::Relaxed),
            user_fallbacks: c.user_fallbacks.load(Ordering::Relaxed),
            since: c.since,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
