//! Counter store contract and the in-process implementation.
//!
//! A bucket is a log of `(timestamp, cost)` entries covering the trailing
//! window. Every operation on one key is atomic with respect to other
//! operations on the same key.

use crate::error::ThrottlerResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::algorithms::Clock;

/// Outcome of [`CounterStore::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    /// In-window total including the cost of this request.
    pub total: u64,
    /// Set when the request did not fit: milliseconds until enough of the
    /// oldest entries expire for it to fit.
    pub retry_after_ms: Option<u64>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically evict entries older than `now_ms - window_ms`, add `cost`
    /// to the in-window sum and, if the result is within `limit`, append the
    /// entry and refresh the bucket TTL to `window_ms`. A request that does
    /// not fit leaves the bucket untouched.
    async fn record(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        now_ms: u64,
        window_ms: u64,
    ) -> ThrottlerResult<Recorded>;

    /// In-window sum without modifying the bucket.
    async fn peek(&self, key: &str, now_ms: u64, window_ms: u64) -> ThrottlerResult<u64>;

    /// Delete a bucket; returns whether it existed.
    async fn reset(&self, key: &str) -> ThrottlerResult<bool>;

    async fn ping(&self) -> ThrottlerResult<()>;

    fn backend(&self) -> &'static str;
}

/// Time until enough of the oldest entries expire for `cost` more to fit
/// under `limit`. `entries` must be in ascending timestamp order.
pub fn release_after<I>(entries: I, used: u64, cost: u64, limit: u64, window_ms: u64, now_ms: u64) -> u64
where
    I: IntoIterator<Item = (u64, u64)>,
{
    if cost > limit {
        return window_ms;
    }

    let mut freed = 0;
    for (at_ms, entry_cost) in entries {
        freed += entry_cost;
        if used - freed + cost <= limit {
            return (at_ms + window_ms).saturating_sub(now_ms);
        }
    }
    window_ms
}

#[derive(Debug)]
struct Bucket {
    entries: VecDeque<(u64, u64)>,
    window_ms: u64,
    last_write_ms: u64,
}

impl Bucket {
    fn evict(&mut self, now_ms: u64) {
        while let Some(&(at_ms, _)) = self.entries.front() {
            if at_ms + self.window_ms <= now_ms {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn used(&self) -> u64 {
        self.entries.iter().map(|&(_, cost)| cost).sum()
    }
}

/// Counter store for a single replica. Buckets live in a sharded map, so
/// concurrent requests on one key are serialised by the shard lock.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    buckets: DashMap<String, Bucket>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets whose TTL has passed. Returns how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.last_write_ms + bucket.window_ms > now_ms);
        before.saturating_sub(self.buckets.len())
    }

    /// Periodically purge idle buckets.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, clock: Arc<dyn Clock>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let purged = self.purge_expired(clock.now_ms());
                if purged > 0 {
                    tracing::debug!(
                        target: "gatekeeper::store",
                        purged,
                        remaining = self.buckets.len(),
                        "Purged idle buckets"
                    );
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn record(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        now_ms: u64,
        window_ms: u64,
    ) -> ThrottlerResult<Recorded> {
        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            entries: VecDeque::new(),
            window_ms,
            last_write_ms: now_ms,
        });
        bucket.window_ms = window_ms;
        bucket.evict(now_ms);

        let used = bucket.used();
        let total = used.saturating_add(cost);
        if total <= limit {
            bucket.entries.push_back((now_ms, cost));
            bucket.last_write_ms = now_ms;
            return Ok(Recorded {
                total,
                retry_after_ms: None,
            });
        }

        let retry_after_ms =
            release_after(bucket.entries.iter().copied(), used, cost, limit, window_ms, now_ms);
        let empty = bucket.entries.is_empty();
        drop(bucket);
        if empty {
            self.buckets.remove_if(key, |_, b| b.entries.is_empty());
        }

        Ok(Recorded {
            total,
            retry_after_ms: Some(retry_after_ms),
        })
    }

    async fn peek(&self, key: &str, now_ms: u64, window_ms: u64) -> ThrottlerResult<u64> {
        Ok(self
            .buckets
            .get(key)
            .map(|bucket| {
                bucket
                    .entries
                    .iter()
                    .filter(|&&(at_ms, _)| at_ms + window_ms > now_ms)
                    .map(|&(_, cost)| cost)
                    .sum()
            })
            .unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> ThrottlerResult<bool> {
        Ok(self.buckets.remove(key).is_some())
    }

    async fn ping(&self) -> ThrottlerResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
