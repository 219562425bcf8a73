//! Runs against a live Redis. Set `REDIS_URL` and use `cargo test -- --ignored`.

use gatekeeper::{CounterStore, RedisCounterStore};
use uuid::Uuid;

const T0: u64 = 1_700_000_000_000;

fn redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty())
}

fn bucket() -> String {
    format!("gatekeeper-test:{}", Uuid::new_v4().simple())
}

async fn raw_connection(url: &str) -> redis::aio::MultiplexedConnection {
    redis::Client::open(url)
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

#[tokio::test]
#[ignore]
async fn test_record_until_full() {
    let Some(url) = redis_url() else { return };
    let store = RedisCounterStore::new(&url).unwrap();
    let key = bucket();

    for expected in 1..=3 {
        let recorded = store.record(&key, 1, 3, T0, 60_000).await.unwrap();
        assert_eq!(recorded.total, expected);
        assert_eq!(recorded.retry_after_ms, None);
    }
    let rejected = store.record(&key, 1, 3, T0 + 500, 60_000).await.unwrap();
    assert_eq!(rejected.total, 4);
    assert_eq!(rejected.retry_after_ms, Some(59_500));
    assert_eq!(store.peek(&key, T0 + 500, 60_000).await.unwrap(), 3);

    store.reset(&key).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_entries_expire_after_window() {
    let Some(url) = redis_url() else { return };
    let store = RedisCounterStore::new(&url).unwrap();
    let key = bucket();

    store.record(&key, 2, 10, T0, 1_000).await.unwrap();
    assert_eq!(store.peek(&key, T0 + 999, 1_000).await.unwrap(), 2);
    assert_eq!(store.peek(&key, T0 + 1_000, 1_000).await.unwrap(), 0);
    let recorded = store.record(&key, 1, 10, T0 + 1_000, 1_000).await.unwrap();
    assert_eq!(recorded.total, 1);

    store.reset(&key).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_oversized_request_never_creates_bucket() {
    let Some(url) = redis_url() else { return };
    let store = RedisCounterStore::new(&url).unwrap();
    let key = bucket();

    let recorded = store.record(&key, 11, 10, T0, 60_000).await.unwrap();
    assert_eq!(recorded.total, 11);
    assert_eq!(recorded.retry_after_ms, Some(60_000));

    let mut conn = raw_connection(&url).await;
    let exists: i64 = redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await.unwrap();
    assert_eq!(exists, 0);
    assert!(!store.reset(&key).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_release_after_frees_oldest_first() {
    let Some(url) = redis_url() else { return };
    let store = RedisCounterStore::new(&url).unwrap();
    let key = bucket();

    store.record(&key, 3, 10, T0, 1_000).await.unwrap();
    store.record(&key, 3, 10, T0 + 100, 1_000).await.unwrap();
    store.record(&key, 3, 10, T0 + 200, 1_000).await.unwrap();

    // 9 used, 5 more needs the first two entries gone
    let rejected = store.record(&key, 5, 10, T0 + 300, 1_000).await.unwrap();
    assert_eq!(rejected.total, 14);
    assert_eq!(rejected.retry_after_ms, Some(800));
    assert_eq!(store.peek(&key, T0 + 300, 1_000).await.unwrap(), 9);

    store.reset(&key).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_bucket_ttl_bounded_by_window() {
    let Some(url) = redis_url() else { return };
    let store = RedisCounterStore::new(&url).unwrap();
    let key = bucket();

    store.record(&key, 1, 10, T0, 60_000).await.unwrap();

    let mut conn = raw_connection(&url).await;
    let pttl: i64 = redis::cmd("PTTL").arg(&key).query_async(&mut conn).await.unwrap();
    assert!(pttl > 0 && pttl <= 60_000, "unexpected PTTL {}", pttl);

    assert!(store.reset(&key).await.unwrap());
    store.ping().await.unwrap();
}
