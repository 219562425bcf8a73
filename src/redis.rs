use crate::error::{ThrottlerError, ThrottlerResult};
use crate::store::{CounterStore, Recorded};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::sync::LazyLock;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

// KEYS[1] bucket
// ARGV now_ms, window_ms, cost, limit, member
// Returns {total, release_ms}; release_ms is 0 when the entry was stored.
static RECORD_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local entries = redis.call('ZRANGE', key, 0, -1, 'WITHSCORES')

local used = 0
for i = 1, #entries, 2 do
    used = used + tonumber(string.match(entries[i], ':(%d+)$'))
end

local total = used + cost
if total <= limit then
    redis.call('ZADD', key, ARGV[1], ARGV[5])
    redis.call('PEXPIRE', key, window)
    return {total, 0}
end

local release = window
if cost <= limit then
    local freed = 0
    for i = 1, #entries, 2 do
        freed = freed + tonumber(string.match(entries[i], ':(%d+)$'))
        if used - freed + cost <= limit then
            release = tonumber(entries[i + 1]) + window - now
            break
        end
    end
end
return {total, release}
"#,
    )
});

// KEYS[1] bucket
// ARGV now_ms, window_ms
static PEEK_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local members = redis.call('ZRANGEBYSCORE', KEYS[1], '(' .. string.format('%d', now - window), '+inf')
local used = 0
for i = 1, #members do
    used = used + tonumber(string.match(members[i], ':(%d+)$'))
end
return used
"#,
    )
});

/// Sorted-set member for one entry. The cost is the trailing `:<n>` so the
/// scripts can sum it; the UUID keeps members unique within a millisecond.
pub fn entry_member(now_ms: u64, cost: u64) -> String {
    format!("{}-{}:{}", now_ms, Uuid::new_v4().simple(), cost)
}

/// Counter store shared by every replica.
///
/// Each bucket is a sorted set scored by timestamp; `record` and `peek` are
/// single Lua scripts, so eviction, summation and insertion happen atomically
/// on the server. The connection is established lazily and re-established by
/// the connection manager after failures, so the service starts and keeps
/// serving (failing open) while Redis is down.
pub struct RedisCounterStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisCounterStore {
    pub fn new(redis_url: &str) -> ThrottlerResult<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            ThrottlerError::RuleConfig(format!("Failed to create Redis client: {}", e))
        })?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> ThrottlerResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!(target: "gatekeeper::store", "Connected to Redis");
                Ok::<_, ThrottlerError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn record(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        now_ms: u64,
        window_ms: u64,
    ) -> ThrottlerResult<Recorded> {
        let mut conn = self.connection().await?;
        let (total, release_ms): (u64, i64) = RECORD_SCRIPT
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(cost)
            .arg(limit)
            .arg(entry_member(now_ms, cost))
            .invoke_async(&mut conn)
            .await?;

        let retry_after_ms = (total > limit).then(|| release_ms.max(0) as u64);
        Ok(Recorded {
            total,
            retry_after_ms,
        })
    }

    async fn peek(&self, key: &str, now_ms: u64, window_ms: u64) -> ThrottlerResult<u64> {
        let mut conn = self.connection().await?;
        let used: u64 = PEEK_SCRIPT
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(used)
    }

    async fn reset(&self, key: &str) -> ThrottlerResult<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn ping(&self) -> ThrottlerResult<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
