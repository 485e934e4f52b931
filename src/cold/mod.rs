//! Cold aggregate store
//!
//! The durable tier. It holds one cumulative row per
//! `(resource_type, resource_id, subscription_id?, period)` and only ever
//! grows: [`ColdStore::accumulate`] adds, nothing overwrites or subtracts.
//! Reads are grouped sums, rankings and trends over a bucket range, each
//! subject to a row cap that is reported rather than silently applied.

pub mod memory;

pub use self::memory::MemoryColdStore;

use crate::error::Result;
use crate::key::{ResourceKey, ResourceType};
use crate::types::{BucketRange, Capped, GroupDimension, GroupKey, Granularity, TimeBucket};
use crate::types::{TrafficSummary, TrendPoint};
use async_trait::async_trait;
use std::collections::HashMap;

/// Default maximum number of source rows a single read may scan
pub const DEFAULT_ROW_CAP: usize = 100_000;

/// Identity of a cold-tier row, minus its period
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateTarget {
    /// Resource type tag
    pub resource_type: ResourceType,
    /// Resource identifier
    pub resource_id: u64,
    /// Owning subscription, when attributed
    pub subscription_id: Option<u64>,
}

impl AggregateTarget {
    /// Group key of this row under `dimension`
    ///
    /// Rows without a subscription have no subscription group.
    pub fn group_key(&self, dimension: GroupDimension) -> Option<GroupKey> {
        match (dimension, self.subscription_id) {
            (GroupDimension::Subscription, None) => None,
            (_, subscription_id) => Some(GroupKey::for_record(
                dimension,
                subscription_id.unwrap_or_default(),
                &self.resource_type,
                self.resource_id,
            )),
        }
    }
}

impl From<&ResourceKey> for AggregateTarget {
    fn from(key: &ResourceKey) -> Self {
        Self {
            resource_type: key.resource_type().clone(),
            resource_id: key.resource_id(),
            subscription_id: Some(key.subscription_id()),
        }
    }
}

/// Grouped read over a bucket range
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    /// Grouping dimension
    pub dimension: GroupDimension,
    /// Restrict to one resource type
    pub resource_type: Option<ResourceType>,
    /// Buckets to read
    pub range: BucketRange,
    /// Maximum number of source rows to aggregate
    pub row_cap: usize,
}

impl AggregateQuery {
    /// Query with the default row cap
    pub fn new(
        dimension: GroupDimension,
        resource_type: Option<ResourceType>,
        range: BucketRange,
    ) -> Self {
        Self {
            dimension,
            resource_type,
            range,
            row_cap: DEFAULT_ROW_CAP,
        }
    }

    /// Override the row cap
    pub fn with_row_cap(mut self, row_cap: usize) -> Self {
        self.row_cap = row_cap;
        self
    }

    /// Whether a row of `resource_type` passes the type filter
    pub fn matches_type(&self, resource_type: &ResourceType) -> bool {
        self.resource_type
            .as_ref()
            .map_or(true, |wanted| wanted == resource_type)
    }
}

/// Sort groups by total descending, ties broken by key ascending
pub fn rank_groups(
    groups: impl IntoIterator<Item = (GroupKey, TrafficSummary)>,
) -> Vec<(GroupKey, TrafficSummary)> {
    let mut ranked: Vec<_> = groups.into_iter().collect();
    ranked.sort_by(|(ka, a), (kb, b)| b.total().cmp(&a.total()).then_with(|| ka.cmp(kb)));
    ranked
}

/// Core trait for durable aggregate backends
#[async_trait]
pub trait ColdStore: Send + Sync + 'static {
    /// Backend identifier for logs
    fn backend_id(&self) -> &str;

    /// Add traffic to the row of `target` in `period`
    ///
    /// Additive and never destructive; a zero summary is a no-op. Returns
    /// [`LedgerError::NotFound`](crate::error::LedgerError::NotFound) when the
    /// resource no longer exists downstream.
    async fn accumulate(
        &self,
        target: &AggregateTarget,
        period: TimeBucket,
        traffic: TrafficSummary,
    ) -> Result<()>;

    /// Sum rows in the range per group
    async fn sum_by_group(
        &self,
        query: &AggregateQuery,
    ) -> Result<Capped<HashMap<GroupKey, TrafficSummary>>>;

    /// The `n` largest groups, total descending
    async fn top_n(
        &self,
        query: &AggregateQuery,
        n: usize,
    ) -> Result<Capped<Vec<(GroupKey, TrafficSummary)>>>;

    /// Traffic per period of `granularity`, oldest first
    async fn trend(
        &self,
        resource_type: Option<&ResourceType>,
        range: BucketRange,
        granularity: Granularity,
        row_cap: usize,
    ) -> Result<Capped<Vec<TrendPoint>>>;
}
