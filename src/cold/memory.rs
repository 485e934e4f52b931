//! In-memory cold store
//!
//! Reference [`ColdStore`] used by tests and embedded deployments. Rows are
//! keyed by period, then target; range reads walk only the periods in range
//! and row caps cut the same rows on every read.

use super::{rank_groups, AggregateQuery, AggregateTarget, ColdStore};
use crate::error::{LedgerError, Result};
use crate::key::ResourceType;
use crate::types::{BucketRange, Capped, GroupKey, Granularity, TimeBucket};
use crate::types::{TrafficSummary, TrendPoint};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

type RowMap = BTreeMap<TimeBucket, BTreeMap<AggregateTarget, TrafficSummary>>;

/// In-memory [`ColdStore`]
#[derive(Default)]
pub struct MemoryColdStore {
    rows: RwLock<RowMap>,
    retired: RwLock<HashSet<(ResourceType, u64)>>,
    unavailable: AtomicBool,
    accumulate_calls: AtomicU64,
}

impl MemoryColdStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a resource as deleted downstream
    ///
    /// Later writes for it fail with [`LedgerError::NotFound`].
    pub fn retire_resource(&self, resource_type: ResourceType, resource_id: u64) {
        self.retired.write().insert((resource_type, resource_id));
    }

    /// Simulate an outage: every call fails with a cold-tier error while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stored row for `target` in `period`
    pub fn row(&self, target: &AggregateTarget, period: TimeBucket) -> Option<TrafficSummary> {
        self.rows
            .read()
            .get(&period)
            .and_then(|targets| targets.get(target))
            .copied()
    }

    /// Sum of every row of `target`, across periods
    pub fn total_for(&self, target: &AggregateTarget) -> TrafficSummary {
        let mut total = TrafficSummary::default();
        for targets in self.rows.read().values() {
            if let Some(traffic) = targets.get(target) {
                total.add(*traffic);
            }
        }
        total
    }

    /// Number of stored rows
    pub fn row_count(&self) -> usize {
        self.rows.read().values().map(BTreeMap::len).sum()
    }

    /// Number of non-trivial `accumulate` calls that reached the store
    pub fn accumulate_calls(&self) -> u64 {
        self.accumulate_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::cold_unavailable("cold store offline"));
        }
        Ok(())
    }

    /// Rows in `range` passing `filter`, in storage order
    fn scan<'a>(
        rows: &'a RowMap,
        range: BucketRange,
        filter: impl Fn(&AggregateTarget) -> bool + 'a,
    ) -> impl Iterator<Item = (&'a TimeBucket, &'a AggregateTarget, &'a TrafficSummary)> + 'a {
        rows.range(range.start()..range.end())
            .flat_map(|(bucket, targets)| {
                targets
                    .iter()
                    .map(move |(target, traffic)| (bucket, target, traffic))
            })
            .filter(move |&(_, target, _)| filter(target))
    }

    fn grouped(&self, query: &AggregateQuery) -> Capped<HashMap<GroupKey, TrafficSummary>> {
        let rows = self.rows.read();
        let matching: Vec<_> = Self::scan(&rows, query.range, |target| {
            query.matches_type(&target.resource_type)
                && target.group_key(query.dimension).is_some()
        })
        .collect();

        let total_rows = matching.len();
        let mut groups: HashMap<GroupKey, TrafficSummary> = HashMap::new();
        for (_, target, traffic) in matching.into_iter().take(query.row_cap) {
            if let Some(key) = target.group_key(query.dimension) {
                groups.entry(key).or_default().add(*traffic);
            }
        }

        Capped {
            value: groups,
            total_rows,
            truncated: total_rows > query.row_cap,
        }
    }
}

#[async_trait]
impl ColdStore for MemoryColdStore {
    fn backend_id(&self) -> &str {
        "memory-cold-v1"
    }

    async fn accumulate(
        &self,
        target: &AggregateTarget,
        period: TimeBucket,
        traffic: TrafficSummary,
    ) -> Result<()> {
        self.check_available()?;
        if traffic.is_zero() {
            return Ok(());
        }
        if self
            .retired
            .read()
            .contains(&(target.resource_type.clone(), target.resource_id))
        {
            return Err(LedgerError::NotFound(format!(
                "{} {} no longer exists",
                target.resource_type, target.resource_id
            )));
        }

        self.accumulate_calls.fetch_add(1, Ordering::SeqCst);
        self.rows
            .write()
            .entry(period)
            .or_default()
            .entry(target.clone())
            .or_default()
            .add(traffic);
        Ok(())
    }

    async fn sum_by_group(
        &self,
        query: &AggregateQuery,
    ) -> Result<Capped<HashMap<GroupKey, TrafficSummary>>> {
        self.check_available()?;
        Ok(self.grouped(query))
    }

    async fn top_n(
        &self,
        query: &AggregateQuery,
        n: usize,
    ) -> Result<Capped<Vec<(GroupKey, TrafficSummary)>>> {
        self.check_available()?;
        let grouped = self.grouped(query);
        let mut ranked = rank_groups(grouped.value);
        ranked.truncate(n);
        Ok(Capped {
            value: ranked,
            total_rows: grouped.total_rows,
            truncated: grouped.truncated,
        })
    }

    async fn trend(
        &self,
        resource_type: Option<&ResourceType>,
        range: BucketRange,
        granularity: Granularity,
        row_cap: usize,
    ) -> Result<Capped<Vec<TrendPoint>>> {
        self.check_available()?;
        let rows = self.rows.read();
        let matching: Vec<_> = Self::scan(&rows, range, |target| {
            resource_type.map_or(true, |wanted| wanted == &target.resource_type)
        })
        .collect();

        let total_rows = matching.len();
        let mut periods: BTreeMap<DateTime<FixedOffset>, TrafficSummary> = BTreeMap::new();
        for (bucket, _, traffic) in matching.into_iter().take(row_cap) {
            periods
                .entry(bucket.period_start(granularity))
                .or_default()
                .add(*traffic);
        }

        Ok(Capped {
            value: periods
                .into_iter()
                .map(|(period, traffic)| TrendPoint { period, traffic })
                .collect(),
            total_rows,
            truncated: total_rows > row_cap,
        })
    }
}
