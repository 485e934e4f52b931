//! Redis backend integration tests
//!
//! These need a running Redis server and are ignored by default:
//!
//! ```text
//! LEDGER_REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored
//! ```
//!
//! Every test uses a random key prefix and deletes its buckets when done.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use traffic_ledger::cold::{AggregateTarget, MemoryColdStore};
use traffic_ledger::config::LedgerConfig;
use traffic_ledger::hot::{CommitOutcome, HotStore, HotStoreSettings, RedisHotStore};
use traffic_ledger::key::{ResourceKey, ResourceType};
use traffic_ledger::redis::{RedisConfig, RedisPool};
use traffic_ledger::state::{RedisStateStore, StateStore};
use traffic_ledger::types::{BusinessZone, TrafficSummary};
use traffic_ledger::TrafficLedger;

fn redis_url() -> String {
    std::env::var("LEDGER_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique_prefix() -> String {
    format!("ledger-test-{:08x}", rand::random::<u32>())
}

async fn pool() -> Arc<RedisPool> {
    Arc::new(
        RedisPool::new(RedisConfig::with_url(redis_url()))
            .await
            .expect("Redis not reachable"),
    )
}

async fn hot_store(pool: Arc<RedisPool>, prefix: &str) -> RedisHotStore {
    RedisHotStore::new(
        pool,
        &HotStoreSettings {
            key_prefix: prefix.to_string(),
            record_ttl: Duration::from_secs(600),
        },
        BusinessZone::default(),
    )
}

fn current_key(resource_id: u64) -> ResourceKey {
    ResourceKey::new(
        BusinessZone::default().bucket_of(chrono::Utc::now()),
        1,
        ResourceType::Node,
        resource_id,
    )
}

#[tokio::test]
#[ignore]
async fn test_increment_and_read_back() {
    let prefix = unique_prefix();
    let hot = hot_store(pool().await, &prefix).await;
    let key = current_key(100);

    hot.increment(&key, 1000, 2000).await.unwrap();
    hot.increment(&key, 500, 300).await.unwrap();

    let value = hot.get(&key).await.unwrap();
    assert!(value.exists);
    assert_eq!(value.traffic, TrafficSummary::new(1500, 2300));

    let records = hot.get_all(key.bucket()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, key);

    assert!(hot.active_keys(10).await.unwrap().contains(&key));
    hot.cleanup(key.bucket()).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_compare_and_commit_detects_racing_increment() {
    let prefix = unique_prefix();
    let hot = hot_store(pool().await, &prefix).await;
    let key = current_key(7);

    hot.increment(&key, 100, 0).await.unwrap();
    let observed = TrafficSummary::new(100, 0);
    hot.increment(&key, 50, 5).await.unwrap();

    let outcome = hot.compare_and_commit(&key, observed, observed).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Retained);

    let record = hot.snapshot(&[key.clone()]).await.unwrap()[0].clone().unwrap();
    assert_eq!(record.pending().traffic, TrafficSummary::new(50, 5));

    let outcome = hot
        .compare_and_commit(&key, record.traffic(), record.traffic())
        .await
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Settled);
    assert!(!hot.active_keys(10).await.unwrap().contains(&key));

    hot.cleanup(key.bucket()).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_init_baseline_is_set_if_absent() {
    let prefix = unique_prefix();
    let hot = hot_store(pool().await, &prefix).await;
    let key = current_key(9);

    hot.increment(&key, 30, 0).await.unwrap();
    let seeded = hot
        .init_baseline(&key, TrafficSummary::new(1000, 2000))
        .await
        .unwrap();
    assert_eq!(seeded, 2);
    assert_eq!(
        hot.get(&key).await.unwrap().traffic,
        TrafficSummary::new(1030, 2000)
    );

    let reseeded = hot
        .init_baseline(&key, TrafficSummary::new(1000, 2000))
        .await
        .unwrap();
    assert_eq!(reseeded, 0);

    hot.cleanup(key.bucket()).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_ledger_flushes_through_redis() {
    let mut config = LedgerConfig::default();
    config.redis = RedisConfig::with_url(redis_url());
    config.hot.key_prefix = unique_prefix();

    let cold = Arc::new(MemoryColdStore::new());
    let ledger = TrafficLedger::connect(config, cold.clone()).await.unwrap();

    ledger.increment(1, "node", 100, 1000, 2000).await.unwrap();
    ledger.increment(1, "node", 100, 500, 300).await.unwrap();

    let report = ledger.compact(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.flushed, 1);

    let key = ledger.current_key(1, "node", 100).unwrap();
    assert_eq!(
        cold.total_for(&AggregateTarget::from(&key)),
        TrafficSummary::new(1500, 2300)
    );

    // A second cycle finds nothing pending
    ledger.compact(&CancellationToken::new()).await.unwrap();
    assert_eq!(cold.accumulate_calls(), 1);

    ledger.hot_store().cleanup(key.bucket()).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_state_store_compare_and_set() {
    let store = RedisStateStore::new(pool().await);
    let key = format!("{}:alert:1", unique_prefix());
    let ttl = Duration::from_secs(60);

    assert!(store
        .compare_and_set_field(&key, "level", None, "80", ttl)
        .await
        .unwrap());
    assert!(!store
        .compare_and_set_field(&key, "level", None, "90", ttl)
        .await
        .unwrap());
    assert!(store
        .compare_and_set_field(&key, "level", Some("80"), "90", ttl)
        .await
        .unwrap());

    assert_eq!(store.incr_field(&key, "count", 5, ttl).await.unwrap(), 5);
    let fields = store.get_all(&key).await.unwrap();
    assert_eq!(fields.get("level").map(String::as_str), Some("90"));
    assert_eq!(fields.get("count").map(String::as_str), Some("5"));

    assert!(store.delete(&key).await.unwrap());
}
