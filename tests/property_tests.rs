//! Property tests for the key codec and the flush accounting
//!
//! Uses proptest to generate arbitrary keys and arbitrary interleavings of
//! increments and compaction cycles.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use traffic_ledger::clock::{Clock, ManualClock};
use traffic_ledger::cold::{AggregateTarget, MemoryColdStore};
use traffic_ledger::compaction::Compactor;
use traffic_ledger::config::CompactionConfig;
use traffic_ledger::hot::{HotStore, HotStoreSettings, MemoryHotStore};
use traffic_ledger::key::{ResourceKey, ResourceType};
use traffic_ledger::types::{BusinessZone, TrafficSummary};

// =============================================================================
// Test Data Strategies
// =============================================================================

/// Instants between 2020 and 2030
fn instant() -> impl Strategy<Value = DateTime<Utc>> {
    (1_577_836_800i64..1_893_456_000).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

/// Zones from -12:00 to +14:00 in quarter hours
fn zone() -> impl Strategy<Value = BusinessZone> {
    (-48i32..=56).prop_map(|quarters| BusinessZone::from_offset_minutes(quarters * 15).unwrap())
}

fn resource_type() -> impl Strategy<Value = ResourceType> {
    "[a-z_]{1,32}".prop_map(|tag| ResourceType::parse(&tag).unwrap())
}

#[derive(Debug, Clone)]
enum Op {
    Increment { resource: u64, upload: u64, download: u64 },
    Compact,
    Advance { minutes: i64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u64..4, 0u64..1_000_000, 0u64..1_000_000)
            .prop_map(|(resource, upload, download)| Op::Increment { resource, upload, download }),
        2 => Just(Op::Compact),
        1 => (1i64..30).prop_map(|minutes| Op::Advance { minutes }),
    ]
}

// =============================================================================
// Key Codec
// =============================================================================

proptest! {
    #[test]
    fn prop_key_decode_inverts_encode(
        zone in zone(),
        at in instant(),
        subscription_id in any::<u64>(),
        resource_type in resource_type(),
        resource_id in any::<u64>(),
    ) {
        let key = ResourceKey::new(zone.bucket_of(at), subscription_id, resource_type, resource_id);
        let decoded = ResourceKey::decode(&key.encode(), &zone).unwrap();
        prop_assert_eq!(decoded, key);
    }

    #[test]
    fn prop_delimiter_always_rejected(prefix in "[a-z]{0,10}", suffix in "[a-z]{0,10}") {
        let tag = format!("{}:{}", prefix, suffix);
        prop_assert!(ResourceType::parse(&tag).is_err());
    }

    #[test]
    fn prop_bucket_contains_instant(zone in zone(), at in instant()) {
        let bucket = zone.bucket_of(at);
        prop_assert!(bucket.start_utc() <= at);
        prop_assert!(at < bucket.end_utc());
        prop_assert_eq!(zone.parse_bucket(&bucket.label()).unwrap(), bucket);
    }
}

// =============================================================================
// Flush Accounting
// =============================================================================

/// Replays `ops` and checks, per resource, that cold total plus hot pending
/// equals everything ever reported
///
/// Advances stay well under the record TTL, so nothing expires unflushed.
fn check_additivity(ops: Vec<Op>, expect_drained: bool) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async move {
        let zone = BusinessZone::default();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        ));
        let hot = Arc::new(MemoryHotStore::new(
            &HotStoreSettings::default(),
            clock.clone(),
        ));
        let cold = Arc::new(MemoryColdStore::new());
        let compactor = Compactor::new(
            hot.clone(),
            cold.clone(),
            clock.clone(),
            zone,
            std::time::Duration::from_secs(24 * 3600),
            CompactionConfig::default(),
        );

        let mut keys: Vec<ResourceKey> = Vec::new();
        let mut expected = [TrafficSummary::default(); 4];
        for op in ops {
            match op {
                Op::Increment { resource, upload, download } => {
                    let key = ResourceKey::new(
                        zone.bucket_of(clock.now()),
                        1,
                        ResourceType::Node,
                        resource,
                    );
                    hot.increment(&key, upload, download).await.unwrap();
                    expected[resource as usize].add(TrafficSummary::new(upload, download));
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                },
                Op::Compact => {
                    compactor.run_cycle(&CancellationToken::new()).await.unwrap();
                },
                Op::Advance { minutes } => clock.advance(Duration::minutes(minutes)),
            }
        }

        let mut observed = [TrafficSummary::default(); 4];
        let snapshot = hot.snapshot(&keys).await.unwrap();
        for (key, record) in keys.iter().zip(snapshot) {
            if let Some(record) = record {
                if expect_drained {
                    prop_assert!(record.pending().traffic.is_zero());
                }
                observed[key.resource_id() as usize].add(record.pending().traffic);
            }
        }
        for (resource, total) in observed.iter_mut().enumerate() {
            let target = AggregateTarget::from(&ResourceKey::new(
                zone.bucket_of(clock.now()),
                1,
                ResourceType::Node,
                resource as u64,
            ));
            total.add(cold.total_for(&target));
        }

        prop_assert_eq!(observed, expected);
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_cold_plus_pending_equals_reported(ops in prop::collection::vec(op(), 1..60)) {
        check_additivity(ops, false)?;
    }

    #[test]
    fn prop_final_compaction_drains_everything(ops in prop::collection::vec(op(), 1..60)) {
        let mut ops = ops;
        ops.push(Op::Compact);
        check_additivity(ops, true)?;
    }
}
