//! End-to-end ledger tests
//!
//! Every test runs the full facade against the in-memory hot and cold
//! backends with a manually driven clock.
//!
//! # Test Coverage
//!
//! 1. **Write path** - accumulation, validation, batch atomicity
//! 2. **Compaction** - exactly-once flush, racing increments, idempotent re-flush
//! 3. **Expiry** - TTL self-heal of abandoned keys
//! 4. **Queries** - hot/cold split at the boundary, rankings
//! 5. **Concurrency** - additivity under parallel writers and compaction

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use traffic_ledger::clock::{Clock, ManualClock};
use traffic_ledger::cold::{AggregateQuery, AggregateTarget, ColdStore, MemoryColdStore};
use traffic_ledger::config::LedgerConfig;
use traffic_ledger::hot::{HotStore, HotStoreSettings, MemoryHotStore};
use traffic_ledger::key::{ResourceKey, ResourceType};
use traffic_ledger::types::{
    BucketRange, Capped, GroupDimension, GroupKey, Granularity, Page, TimeBucket, TimeWindow,
    TrafficEntry, TrafficSummary, TrendPoint,
};
use traffic_ledger::{LedgerError, Result, TrafficLedger, TrafficLedgerBuilder};

// =============================================================================
// Test Helpers
// =============================================================================

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 4, 10, 0).unwrap()
}

/// Default config with enough TTL grace to keep settled records past the
/// retention window during a test
fn test_config() -> LedgerConfig {
    let mut config = LedgerConfig::default();
    config.hot.ttl_grace_secs = 3 * 3600;
    config
}

struct Harness {
    clock: Arc<ManualClock>,
    hot: Arc<MemoryHotStore>,
    ledger: TrafficLedger,
}

async fn harness(cold: Arc<dyn ColdStore>) -> Harness {
    harness_with(cold, test_config()).await
}

async fn harness_with(cold: Arc<dyn ColdStore>, config: LedgerConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    let hot = Arc::new(MemoryHotStore::new(
        &HotStoreSettings {
            key_prefix: config.hot.key_prefix.clone(),
            record_ttl: config.hot.record_ttl(),
        },
        clock.clone(),
    ));
    let ledger = TrafficLedgerBuilder::new()
        .with_config(config)
        .with_hot_store(hot.clone())
        .with_cold_store(cold)
        .with_clock(clock.clone())
        .build()
        .await
        .expect("Failed to build ledger");

    Harness { clock, hot, ledger }
}

fn window(clock: &ManualClock, hours: i64) -> TimeWindow {
    let now = clock.now();
    TimeWindow::new(now - Duration::hours(hours), now).unwrap()
}

async fn compact(ledger: &TrafficLedger) -> traffic_ledger::compaction::CompactionReport {
    ledger.compact(&CancellationToken::new()).await.unwrap()
}

/// Cold store that injects a hot increment while a flush is in flight
struct RacingColdStore {
    inner: MemoryColdStore,
    hot: Mutex<Option<Arc<MemoryHotStore>>>,
    race: Mutex<Option<(ResourceKey, TrafficSummary)>>,
}

impl RacingColdStore {
    fn new() -> Self {
        Self {
            inner: MemoryColdStore::new(),
            hot: Mutex::new(None),
            race: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ColdStore for RacingColdStore {
    fn backend_id(&self) -> &str {
        "racing"
    }

    async fn accumulate(
        &self,
        target: &AggregateTarget,
        period: TimeBucket,
        traffic: TrafficSummary,
    ) -> Result<()> {
        let race = self.race.lock().take();
        let hot = self.hot.lock().clone();
        if let (Some((key, extra)), Some(hot)) = (race, hot) {
            hot.increment(&key, extra.upload, extra.download).await?;
        }
        self.inner.accumulate(target, period, traffic).await
    }

    async fn sum_by_group(
        &self,
        query: &AggregateQuery,
    ) -> Result<Capped<HashMap<GroupKey, TrafficSummary>>> {
        self.inner.sum_by_group(query).await
    }

    async fn top_n(
        &self,
        query: &AggregateQuery,
        n: usize,
    ) -> Result<Capped<Vec<(GroupKey, TrafficSummary)>>> {
        self.inner.top_n(query, n).await
    }

    async fn trend(
        &self,
        resource_type: Option<&ResourceType>,
        range: BucketRange,
        granularity: Granularity,
        row_cap: usize,
    ) -> Result<Capped<Vec<TrendPoint>>> {
        self.inner
            .trend(resource_type, range, granularity, row_cap)
            .await
    }
}

// =============================================================================
// Write Path
// =============================================================================

#[tokio::test]
async fn test_increments_accumulate_then_flush_once() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold.clone()).await;

    h.ledger.increment(1, "node", 100, 1000, 2000).await.unwrap();
    h.ledger.increment(1, "node", 100, 500, 300).await.unwrap();

    let key = h.ledger.current_key(1, "node", 100).unwrap();
    let value = h.ledger.get(&key).await.unwrap();
    assert_eq!(value.traffic, TrafficSummary::new(1500, 2300));

    let first = compact(&h.ledger).await;
    assert_eq!(first.flushed, 1);
    assert_eq!(first.bytes_flushed, TrafficSummary::new(1500, 2300));
    assert_eq!(
        cold.total_for(&AggregateTarget::from(&key)),
        TrafficSummary::new(1500, 2300)
    );

    // Nothing left to write, and the key is out of the active index
    let second = compact(&h.ledger).await;
    assert_eq!(second.flushed, 0);
    assert_eq!(cold.accumulate_calls(), 1);
    assert!(!h.hot.is_active(&key));
    assert!(h.hot.active_keys(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delimiter_in_resource_type_rejected() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold).await;

    let err = h
        .ledger
        .increment(1, "node:evil", 100, 10, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    let batch = vec![
        TrafficEntry {
            subscription_id: 1,
            resource_type: "node".to_string(),
            resource_id: 1,
            upload: 5,
            download: 5,
        },
        TrafficEntry {
            subscription_id: 1,
            resource_type: "a:b".to_string(),
            resource_id: 2,
            upload: 5,
            download: 5,
        },
    ];
    let err = h.ledger.batch_increment(&batch).await.unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    assert!(h.hot.is_empty());
    assert!(h.hot.active_keys(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_batch_skips_zero_entries() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold).await;

    let batch = vec![
        TrafficEntry {
            subscription_id: 4,
            resource_type: "forward_rule".to_string(),
            resource_id: 8,
            upload: 100,
            download: 0,
        },
        TrafficEntry {
            subscription_id: 4,
            resource_type: "forward_rule".to_string(),
            resource_id: 9,
            upload: 0,
            download: 0,
        },
    ];
    assert_eq!(h.ledger.batch_increment(&batch).await.unwrap(), 1);
    assert_eq!(h.hot.len(), 1);
}

// =============================================================================
// Compaction
// =============================================================================

#[tokio::test]
async fn test_increment_racing_flush_is_preserved() {
    let cold = Arc::new(RacingColdStore::new());
    let h = harness(cold.clone()).await;
    *cold.hot.lock() = Some(h.hot.clone());

    h.ledger.increment(1, "node", 7, 100, 0).await.unwrap();
    let key = h.ledger.current_key(1, "node", 7).unwrap();
    *cold.race.lock() = Some((key.clone(), TrafficSummary::new(50, 5)));

    let report = compact(&h.ledger).await;
    assert_eq!(report.flushed, 1);
    assert_eq!(report.busy, 1);
    assert_eq!(
        cold.inner.total_for(&AggregateTarget::from(&key)),
        TrafficSummary::new(100, 0)
    );
    // The racing increment keeps the key active
    assert!(h.hot.is_active(&key));

    compact(&h.ledger).await;
    assert_eq!(
        cold.inner.total_for(&AggregateTarget::from(&key)),
        TrafficSummary::new(150, 5)
    );
    assert!(!h.hot.is_active(&key));
}

#[tokio::test]
async fn test_reflush_is_idempotent() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold.clone()).await;

    h.ledger.increment(3, "node", 1, 40, 60).await.unwrap();
    for _ in 0..3 {
        compact(&h.ledger).await;
    }

    let key = h.ledger.current_key(3, "node", 1).unwrap();
    assert_eq!(cold.accumulate_calls(), 1);
    assert_eq!(
        cold.total_for(&AggregateTarget::from(&key)),
        TrafficSummary::new(40, 60)
    );

    // New traffic flushes only the new delta
    h.ledger.increment(3, "node", 1, 1, 1).await.unwrap();
    compact(&h.ledger).await;
    assert_eq!(
        cold.total_for(&AggregateTarget::from(&key)),
        TrafficSummary::new(41, 61)
    );
}

#[tokio::test]
async fn test_deleted_resource_purged_during_flush() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold.clone()).await;

    h.ledger.increment(5, "forward_rule", 77, 10, 10).await.unwrap();
    cold.retire_resource(ResourceType::ForwardRule, 77);

    let report = compact(&h.ledger).await;
    assert_eq!(report.resources_gone, 1);
    assert!(h.hot.is_empty());
}

// =============================================================================
// Expiry
// =============================================================================

#[tokio::test]
async fn test_abandoned_keys_expire() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold.clone()).await;

    h.ledger.increment(1, "node", 1, 10, 10).await.unwrap();
    let key = h.ledger.current_key(1, "node", 1).unwrap();

    // Compaction never runs; the TTL cleans up on its own
    let ttl = h.ledger.config().hot.record_ttl();
    h.clock
        .advance(Duration::from_std(ttl).unwrap() + Duration::minutes(1));

    assert!(!h.ledger.get(&key).await.unwrap().exists);
    assert!(h.hot.active_keys(100).await.unwrap().is_empty());
    assert!(h.hot.active_buckets().await.unwrap().is_empty());

    let report = compact(&h.ledger).await;
    assert_eq!(report.scanned, 0);
    assert_eq!(cold.row_count(), 0);
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test]
async fn test_top_two_subscriptions() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold).await;

    h.ledger.increment(1, "node", 10, 500, 0).await.unwrap();
    h.ledger.increment(2, "node", 20, 1000, 500).await.unwrap();
    h.ledger.increment(3, "node", 30, 900, 0).await.unwrap();

    let top = h
        .ledger
        .top_n(GroupDimension::Subscription, None, window(&h.clock, 2), 2)
        .await
        .unwrap();

    let keys: Vec<_> = top.value.iter().map(|row| row.key.clone()).collect();
    assert_eq!(keys, vec![GroupKey::Subscription(2), GroupKey::Subscription(3)]);
    assert!(!top.is_degraded());
}

#[tokio::test]
async fn test_window_split_does_not_double_count() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold.clone()).await;

    h.ledger.increment(1, "node", 1, 100, 0).await.unwrap();
    let old_key = h.ledger.current_key(1, "node", 1).unwrap();
    compact(&h.ledger).await;

    // The bucket is now just behind the boundary: the settled record is
    // still in the hot tier, but only the cold row may be counted
    h.clock.advance(Duration::hours(25));
    let engine = h.ledger.query_engine();
    assert_eq!(engine.hot_boundary(), old_key.bucket().next());
    assert!(h.ledger.get(&old_key).await.unwrap().exists);

    h.ledger.increment(2, "node", 2, 50, 0).await.unwrap();

    let total = h
        .ledger
        .get_total(None, window(&h.clock, 30))
        .await
        .unwrap();
    assert_eq!(total.value, TrafficSummary::new(150, 0));

    let page = h
        .ledger
        .grouped_by_subscription(Some("node"), window(&h.clock, 30), Page::new(1, 10).unwrap())
        .await
        .unwrap();
    assert_eq!(page.value.total_groups, 2);
    assert_eq!(page.value.rows[0].key, GroupKey::Subscription(1));
    assert_eq!(page.value.rows[0].traffic, TrafficSummary::new(100, 0));
}

#[tokio::test]
async fn test_cold_outage_fails_query() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold.clone()).await;
    h.clock.advance(Duration::hours(48));

    cold.set_unavailable(true);
    let err = h
        .ledger
        .get_total(None, window(&h.clock, 40))
        .await
        .unwrap_err();
    assert!(err.is_transient());

    // Hot-only windows do not touch the cold tier
    assert!(h.ledger.get_total(None, window(&h.clock, 1)).await.is_ok());
}

#[tokio::test]
async fn test_daily_trend_merges_tiers() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold.clone()).await;

    h.ledger.increment(1, "node", 1, 10, 0).await.unwrap();
    compact(&h.ledger).await;
    h.clock.advance(Duration::hours(30));
    h.ledger.increment(1, "node", 1, 5, 0).await.unwrap();

    let trend = h
        .ledger
        .trend(Some("node"), window(&h.clock, 40), Granularity::Day)
        .await
        .unwrap();
    let total: u64 = trend.value.iter().map(|p| p.traffic.upload).sum();
    assert_eq!(total, 15);
    assert_eq!(trend.value.len(), 2);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_with_compaction() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold.clone()).await;
    let ledger = Arc::new(h.ledger);

    let mut writers = Vec::new();
    for _ in 0..16 {
        let ledger = ledger.clone();
        writers.push(tokio::spawn(async move {
            for _ in 0..100 {
                ledger.increment(9, "node", 1, 1, 2).await.unwrap();
            }
        }));
    }

    let compactor = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                ledger.compact(&CancellationToken::new()).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    for writer in writers {
        writer.await.unwrap();
    }
    compactor.await.unwrap();

    let key = ledger.current_key(9, "node", 1).unwrap();
    assert_eq!(
        ledger.get(&key).await.unwrap().traffic,
        TrafficSummary::new(1600, 3200)
    );

    ledger.compact(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        cold.total_for(&AggregateTarget::from(&key)),
        TrafficSummary::new(1600, 3200)
    );
    assert!(!h.hot.is_active(&key));
}

#[tokio::test]
async fn test_baseline_seed_keeps_early_increments() {
    let cold = Arc::new(MemoryColdStore::new());
    let h = harness(cold).await;

    h.ledger.increment(1, "subscription", 1, 30, 0).await.unwrap();
    let key = h.ledger.current_key(1, "subscription", 1).unwrap();

    let seeded = h
        .ledger
        .init_from_cold_tier(&key, TrafficSummary::new(1000, 2000))
        .await
        .unwrap();
    assert_eq!(seeded, 2);
    assert_eq!(
        h.ledger.get(&key).await.unwrap().traffic,
        TrafficSummary::new(1030, 2000)
    );

    // A second seed is a no-op
    assert_eq!(
        h.ledger
            .init_from_cold_tier(&key, TrafficSummary::new(1, 1))
            .await
            .unwrap(),
        0
    );
}
