//! Merge-query engine
//!
//! Answers range queries that span both tiers. A window is normalized into a
//! half-open bucket range and split at the hot boundary (`now - retention`,
//! truncated to its bucket):
//!
//! ```text
//!   from                 boundary                    to
//!    |------ cold --------|----------- hot -----------|
//!         ColdStore            HotStore::get_all per bucket
//! ```
//!
//! The two sub-ranges never overlap, so merging is a plain per-group sum. A
//! failing hot tier degrades the answer (counted as zero, flagged with
//! [`QueryWarning::HotTierDegraded`]); a failing cold tier fails the query.

use crate::clock::Clock;
use crate::cold::{rank_groups, AggregateQuery, ColdStore};
use crate::config::QueryConfig;
use crate::error::Result;
use crate::hot::{CounterRecord, HotStore};
use crate::key::ResourceType;
use crate::metrics;
use crate::types::{
    BucketRange, BusinessZone, Capped, Granularity, GroupDimension, GroupKey, Page, TimeBucket,
    TimeWindow, TrafficSummary, TrendPoint, WindowAlign,
};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Batch lookup of display names for group keys
///
/// Keys missing from the returned map are treated as deleted entities and
/// dropped from results.
#[async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    /// Resolve `keys` to display names
    async fn resolve(&self, keys: &[GroupKey]) -> Result<HashMap<GroupKey, String>>;
}

/// Resolver that names every key after its own encoding
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolver;

#[async_trait]
impl IdentityResolver for PassthroughResolver {
    async fn resolve(&self, keys: &[GroupKey]) -> Result<HashMap<GroupKey, String>> {
        Ok(keys.iter().map(|k| (k.clone(), k.to_string())).collect())
    }
}

/// Non-fatal condition attached to a query result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryWarning {
    /// Some hot buckets could not be read and were counted as zero
    HotTierDegraded {
        /// Buckets that failed
        failed_buckets: usize,
    },
    /// The cold tier hit its row cap; totals are partial
    RowCapExceeded {
        /// Rows that matched
        total_rows: usize,
        /// Rows aggregated
        cap: usize,
    },
}

/// A value plus the warnings collected while producing it
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    /// Result value
    pub value: T,
    /// Non-fatal conditions
    pub warnings: Vec<QueryWarning>,
}

impl<T> QueryResult<T> {
    /// Whether any warning was raised
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// One resolved group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRow {
    /// Group key
    pub key: GroupKey,
    /// Display name from the identity resolver
    pub name: String,
    /// Merged traffic
    pub traffic: TrafficSummary,
}

/// One page of grouped results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedPage {
    /// Rows on this page, total descending
    pub rows: Vec<GroupRow>,
    /// Groups across all pages, before resolution
    pub total_groups: usize,
    /// 1-based page number
    pub page: usize,
    /// Effective page size after clamping
    pub page_size: usize,
}

/// Hot and cold sub-ranges of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRange {
    /// Buckets served by the cold tier
    pub cold: Option<BucketRange>,
    /// Buckets served by the hot tier
    pub hot: Option<BucketRange>,
}

/// Stateless range query engine over both tiers
pub struct MergeQueryEngine {
    hot: Arc<dyn HotStore>,
    cold: Arc<dyn ColdStore>,
    resolver: Arc<dyn IdentityResolver>,
    clock: Arc<dyn Clock>,
    zone: BusinessZone,
    retention: chrono::Duration,
    config: QueryConfig,
}

impl MergeQueryEngine {
    /// Create an engine
    pub fn new(
        hot: Arc<dyn HotStore>,
        cold: Arc<dyn ColdStore>,
        resolver: Arc<dyn IdentityResolver>,
        clock: Arc<dyn Clock>,
        zone: BusinessZone,
        retention: std::time::Duration,
        config: QueryConfig,
    ) -> Self {
        Self {
            hot,
            cold,
            resolver,
            clock,
            zone,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            config,
        }
    }

    /// First bucket served by the hot tier
    pub fn hot_boundary(&self) -> TimeBucket {
        self.zone.bucket_of(self.clock.now() - self.retention)
    }

    /// Split a bucket range at the hot boundary
    pub fn split(&self, range: BucketRange) -> SplitRange {
        let (cold, hot) = range.split_at(self.hot_boundary());
        SplitRange { cold, hot }
    }

    /// Grouped sums for one page
    pub async fn grouped(
        &self,
        dimension: GroupDimension,
        resource_type: Option<&ResourceType>,
        window: TimeWindow,
        page: Page,
    ) -> Result<QueryResult<GroupedPage>> {
        let start = Instant::now();
        let range = window.normalize(&self.zone, WindowAlign::Hour)?;
        let page_size = page.size.min(self.config.max_page_size);
        let page = Page::new(page.number, page_size)?;

        let mut warnings = Vec::new();
        let groups = self
            .merged_groups(dimension, resource_type, range, &mut warnings)
            .await?;

        let ranked = rank_groups(groups);
        let total_groups = ranked.len();
        let slice: Vec<_> = ranked
            .into_iter()
            .skip(page.offset())
            .take(page.size)
            .collect();
        let rows = self.resolve(slice).await?;

        metrics::record_query("grouped", start.elapsed().as_secs_f64());
        Ok(QueryResult {
            value: GroupedPage {
                rows,
                total_groups,
                page: page.number,
                page_size,
            },
            warnings,
        })
    }

    /// The `n` largest groups over the window
    pub async fn top_n(
        &self,
        dimension: GroupDimension,
        resource_type: Option<&ResourceType>,
        window: TimeWindow,
        n: usize,
    ) -> Result<QueryResult<Vec<GroupRow>>> {
        let start = Instant::now();
        let range = window.normalize(&self.zone, WindowAlign::Hour)?;
        let mut warnings = Vec::new();

        let ranked = match self.split(range) {
            // Entirely cold: the backend can rank on its own
            SplitRange {
                cold: Some(cold),
                hot: None,
            } => {
                let query = self.aggregate_query(dimension, resource_type, cold);
                let capped = self.cold_read(self.cold.top_n(&query, n)).await?;
                self.note_cap(&capped, &mut warnings);
                capped.value
            },
            _ => {
                let groups = self
                    .merged_groups(dimension, resource_type, range, &mut warnings)
                    .await?;
                let mut ranked = rank_groups(groups);
                ranked.truncate(n);
                ranked
            },
        };

        let rows = self.resolve(ranked).await?;
        metrics::record_query("top_n", start.elapsed().as_secs_f64());
        Ok(QueryResult {
            value: rows,
            warnings,
        })
    }

    /// Platform-wide total over the window
    pub async fn total(
        &self,
        resource_type: Option<&ResourceType>,
        window: TimeWindow,
    ) -> Result<QueryResult<TrafficSummary>> {
        let start = Instant::now();
        let range = window.normalize(&self.zone, WindowAlign::Hour)?;
        let mut warnings = Vec::new();
        let groups = self
            .merged_groups(GroupDimension::PlatformTotal, resource_type, range, &mut warnings)
            .await?;

        metrics::record_query("total", start.elapsed().as_secs_f64());
        Ok(QueryResult {
            value: groups.get(&GroupKey::Total).copied().unwrap_or_default(),
            warnings,
        })
    }

    /// Traffic per period, oldest first
    ///
    /// Day and month trends widen the window to whole business days.
    pub async fn trend(
        &self,
        resource_type: Option<&ResourceType>,
        window: TimeWindow,
        granularity: Granularity,
    ) -> Result<QueryResult<Vec<TrendPoint>>> {
        let start = Instant::now();
        let align = match granularity {
            Granularity::Hour => WindowAlign::Hour,
            Granularity::Day | Granularity::Month => WindowAlign::Day,
        };
        let range = window.normalize(&self.zone, align)?;
        let split = self.split(range);
        let mut warnings = Vec::new();

        let cold_fut = async {
            match split.cold {
                Some(cold) => self
                    .cold_read(self.cold.trend(
                        resource_type,
                        cold,
                        granularity,
                        self.config.row_cap,
                    ))
                    .await
                    .map(Some),
                None => Ok(None),
            }
        };
        let (cold, (hot_records, degraded)) = tokio::join!(cold_fut, self.read_hot(split.hot));

        let mut periods: BTreeMap<DateTime<FixedOffset>, TrafficSummary> = BTreeMap::new();
        if let Some(capped) = cold? {
            self.note_cap(&capped, &mut warnings);
            for point in capped.value {
                periods.entry(point.period).or_default().add(point.traffic);
            }
        }
        for record in hot_records
            .iter()
            .filter(|r| resource_type.map_or(true, |t| t == r.key.resource_type()))
        {
            periods
                .entry(record.key.bucket().period_start(granularity))
                .or_default()
                .add(record.traffic());
        }
        if let Some(warning) = degraded {
            warnings.push(warning);
        }

        metrics::record_query("trend", start.elapsed().as_secs_f64());
        Ok(QueryResult {
            value: periods
                .into_iter()
                .map(|(period, traffic)| TrendPoint { period, traffic })
                .collect(),
            warnings,
        })
    }

    fn aggregate_query(
        &self,
        dimension: GroupDimension,
        resource_type: Option<&ResourceType>,
        range: BucketRange,
    ) -> AggregateQuery {
        AggregateQuery::new(dimension, resource_type.cloned(), range)
            .with_row_cap(self.config.row_cap)
    }

    /// Per-group sums over both tiers, unsorted
    async fn merged_groups(
        &self,
        dimension: GroupDimension,
        resource_type: Option<&ResourceType>,
        range: BucketRange,
        warnings: &mut Vec<QueryWarning>,
    ) -> Result<HashMap<GroupKey, TrafficSummary>> {
        let split = self.split(range);
        debug!(
            cold = ?split.cold.map(|r| (r.start().label(), r.end().label())),
            hot = ?split.hot.map(|r| (r.start().label(), r.end().label())),
            "Split query window"
        );

        let cold_fut = async {
            match split.cold {
                Some(cold) => {
                    let query = self.aggregate_query(dimension, resource_type, cold);
                    self.cold_read(self.cold.sum_by_group(&query)).await.map(Some)
                },
                None => Ok(None),
            }
        };
        let (cold, (hot_records, degraded)) = tokio::join!(cold_fut, self.read_hot(split.hot));

        let mut groups: HashMap<GroupKey, TrafficSummary> = HashMap::new();
        if let Some(capped) = cold? {
            self.note_cap(&capped, warnings);
            for (key, traffic) in capped.value {
                groups.entry(key).or_default().add(traffic);
            }
        }

        for record in hot_records
            .iter()
            .filter(|r| resource_type.map_or(true, |t| t == r.key.resource_type()))
        {
            let key = GroupKey::for_record(
                dimension,
                record.key.subscription_id(),
                record.key.resource_type(),
                record.key.resource_id(),
            );
            groups.entry(key).or_default().add(record.traffic());
        }
        if let Some(warning) = degraded {
            warnings.push(warning);
        }

        Ok(groups)
    }

    /// Read every bucket of the hot sub-range concurrently
    ///
    /// Buckets after the current one hold nothing and are not read. Failed
    /// buckets count as zero and produce one degradation warning.
    async fn read_hot(
        &self,
        range: Option<BucketRange>,
    ) -> (Vec<CounterRecord>, Option<QueryWarning>) {
        let Some(range) = range else {
            return (Vec::new(), None);
        };
        let horizon = self.zone.bucket_of(self.clock.now()).next();
        let Ok(range) = BucketRange::new(range.start(), range.end().min(horizon)) else {
            return (Vec::new(), None);
        };

        let results: Vec<(TimeBucket, Result<Vec<CounterRecord>>)> =
            stream::iter(range.buckets())
                .map(|bucket| async move { (bucket, self.hot.get_all(bucket).await) })
                .buffer_unordered(self.config.hot_read_concurrency.max(1))
                .collect()
                .await;

        let mut records = Vec::new();
        let mut failed_buckets = 0;
        for (bucket, result) in results {
            match result {
                Ok(mut bucket_records) => {
                    metrics::record_tier_read("hot", true);
                    records.append(&mut bucket_records);
                },
                Err(e) => {
                    metrics::record_tier_read("hot", false);
                    warn!(
                        bucket = %bucket,
                        error = %e,
                        "Hot tier read failed, counting bucket as zero"
                    );
                    failed_buckets += 1;
                },
            }
        }

        let warning =
            (failed_buckets > 0).then_some(QueryWarning::HotTierDegraded { failed_buckets });
        (records, warning)
    }

    async fn cold_read<T>(
        &self,
        read: impl std::future::Future<Output = Result<Capped<T>>>,
    ) -> Result<Capped<T>> {
        let result = read.await;
        metrics::record_tier_read("cold", result.is_ok());
        if let Err(e) = &result {
            metrics::record_error("tier_unavailable", "query");
            warn!(backend = self.cold.backend_id(), error = %e, "Cold tier read failed");
        }
        result
    }

    fn note_cap<T>(&self, capped: &Capped<T>, warnings: &mut Vec<QueryWarning>) {
        if capped.truncated {
            warn!(
                total_rows = capped.total_rows,
                cap = self.config.row_cap,
                "Cold tier row cap exceeded, result is partial"
            );
            warnings.push(QueryWarning::RowCapExceeded {
                total_rows: capped.total_rows,
                cap: self.config.row_cap,
            });
        }
    }

    /// Attach display names, dropping groups the resolver does not know
    async fn resolve(&self, ranked: Vec<(GroupKey, TrafficSummary)>) -> Result<Vec<GroupRow>> {
        if ranked.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<GroupKey> = ranked.iter().map(|(k, _)| k.clone()).collect();
        let mut names = self.resolver.resolve(&keys).await?;

        Ok(ranked
            .into_iter()
            .filter_map(|(key, traffic)| {
                let name = names.remove(&key)?;
                Some(GroupRow { key, name, traffic })
            })
            .collect())
    }
}
