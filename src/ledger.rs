//! Traffic ledger facade
//!
//! [`TrafficLedger`] wires the hot store, cold store, compactor, merge-query
//! engine and quota caches behind three surfaces:
//!
//! - **write**: [`increment`](TrafficLedger::increment) and
//!   [`batch_increment`](TrafficLedger::batch_increment), called by edge
//!   reporters
//! - **read**: totals, grouped pages, rankings, trends and the dashboard
//!   [`overview`](TrafficLedger::overview)
//! - **lifecycle**: baseline seeding and resource cleanup
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use traffic_ledger::cold::MemoryColdStore;
//! use traffic_ledger::TrafficLedgerBuilder;
//!
//! # async fn run() -> traffic_ledger::Result<()> {
//! let ledger = TrafficLedgerBuilder::new()
//!     .with_cold_store(Arc::new(MemoryColdStore::new()))
//!     .build()
//!     .await?;
//!
//! ledger.increment(1, "node", 100, 1000, 2000).await?;
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::cold::ColdStore;
use crate::compaction::{CompactionReport, Compactor};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::hot::{CounterValue, HotStore, HotStoreSettings, MemoryHotStore, RedisHotStore};
use crate::key::{ResourceKey, ResourceType};
use crate::metrics;
use crate::query::{
    GroupRow, GroupedPage, IdentityResolver, MergeQueryEngine, PassthroughResolver, QueryResult,
    QueryWarning,
};
use crate::redis::RedisPool;
use crate::services::FlushService;
use crate::state::{
    AlertStateManager, MemoryStateStore, QuotaAlert, QuotaStatus, RedisStateStore, StateStore,
    SubscriptionQuotaCache,
};
use crate::types::{
    BusinessZone, GroupDimension, Granularity, Page, TimeWindow, TrafficEntry, TrafficSummary,
    TrendPoint,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dashboard summary assembled from concurrent sub-queries
#[derive(Debug, Clone, PartialEq)]
pub struct Overview {
    /// Platform-wide traffic
    pub total: TrafficSummary,
    /// Largest subscriptions
    pub top_subscriptions: Vec<GroupRow>,
    /// Largest resources
    pub top_resources: Vec<GroupRow>,
    /// Hourly trend
    pub trend: Vec<TrendPoint>,
    /// Warnings from every sub-query
    pub warnings: Vec<QueryWarning>,
}

/// Builder for [`TrafficLedger`]
///
/// The cold store is required. Hot and state stores default to the
/// in-memory backends unless a Redis pool is supplied.
pub struct TrafficLedgerBuilder {
    config: LedgerConfig,
    hot: Option<Arc<dyn HotStore>>,
    cold: Option<Arc<dyn ColdStore>>,
    state: Option<Arc<dyn StateStore>>,
    redis: Option<Arc<RedisPool>>,
    resolver: Option<Arc<dyn IdentityResolver>>,
    clock: Option<Arc<dyn Clock>>,
}

impl Default for TrafficLedgerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficLedgerBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LedgerConfig::default(),
            hot: None,
            cold: None,
            state: None,
            redis: None,
            resolver: None,
            clock: None,
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom hot store
    pub fn with_hot_store(mut self, hot: Arc<dyn HotStore>) -> Self {
        self.hot = Some(hot);
        self
    }

    /// Set the durable cold store
    pub fn with_cold_store(mut self, cold: Arc<dyn ColdStore>) -> Self {
        self.cold = Some(cold);
        self
    }

    /// Use a custom store for quota and alert state
    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Back the hot tier and side caches with Redis
    ///
    /// Explicit hot or state stores take precedence.
    pub fn with_redis(mut self, pool: Arc<RedisPool>) -> Self {
        self.redis = Some(pool);
        self
    }

    /// Set the identity resolver used by grouped queries
    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and assemble the ledger
    pub async fn build(self) -> Result<TrafficLedger> {
        self.config.validate().map_err(LedgerError::Configuration)?;

        let cold = self
            .cold
            .ok_or_else(|| LedgerError::Configuration("No cold store configured".to_string()))?;
        let zone = BusinessZone::from_offset_minutes(self.config.hot.zone_offset_minutes)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let settings = HotStoreSettings {
            key_prefix: self.config.hot.key_prefix.clone(),
            record_ttl: self.config.hot.record_ttl(),
        };

        let hot: Arc<dyn HotStore> = match (self.hot, &self.redis) {
            (Some(hot), _) => hot,
            (None, Some(pool)) => Arc::new(RedisHotStore::new(pool.clone(), &settings, zone)),
            (None, None) => Arc::new(MemoryHotStore::new(&settings, clock.clone())),
        };
        let state: Arc<dyn StateStore> = match (self.state, &self.redis) {
            (Some(state), _) => state,
            (None, Some(pool)) => Arc::new(RedisStateStore::new(pool.clone())),
            (None, None) => Arc::new(MemoryStateStore::new(clock.clone())),
        };
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(PassthroughResolver));

        let retention = self.config.hot.retention();
        let compactor = Arc::new(Compactor::new(
            hot.clone(),
            cold.clone(),
            clock.clone(),
            zone,
            retention,
            self.config.compaction.clone(),
        ));
        let query = MergeQueryEngine::new(
            hot.clone(),
            cold.clone(),
            resolver,
            clock.clone(),
            zone,
            retention,
            self.config.query.clone(),
        );
        let quota = SubscriptionQuotaCache::new(
            state.clone(),
            self.config.hot.key_prefix.clone(),
            self.config.state.quota_ttl(),
        );
        let alerts = AlertStateManager::new(
            state,
            self.config.hot.key_prefix.clone(),
            &self.config.state.alert_thresholds,
            self.config.state.alert_ttl(),
        )?;

        info!(
            hot_backend = hot.backend_id(),
            cold_backend = cold.backend_id(),
            retention_hours = self.config.hot.retention_hours,
            "Traffic ledger initialized"
        );

        Ok(TrafficLedger {
            hot,
            cold,
            clock,
            zone,
            compactor,
            query,
            quota,
            alerts,
            config: self.config,
        })
    }
}

/// Hot/cold traffic ledger
pub struct TrafficLedger {
    hot: Arc<dyn HotStore>,
    cold: Arc<dyn ColdStore>,
    clock: Arc<dyn Clock>,
    zone: BusinessZone,
    compactor: Arc<Compactor>,
    query: MergeQueryEngine,
    quota: SubscriptionQuotaCache,
    alerts: AlertStateManager,
    config: LedgerConfig,
}

impl TrafficLedger {
    /// Connect to Redis per `config` and build a Redis-backed ledger
    pub async fn connect(config: LedgerConfig, cold: Arc<dyn ColdStore>) -> Result<Self> {
        let pool = Arc::new(RedisPool::new(config.redis.clone()).await?);
        TrafficLedgerBuilder::new()
            .with_config(config)
            .with_redis(pool)
            .with_cold_store(cold)
            .build()
            .await
    }

    /// Active configuration
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Business timezone
    pub fn zone(&self) -> BusinessZone {
        self.zone
    }

    /// Hot store handle
    pub fn hot_store(&self) -> &Arc<dyn HotStore> {
        &self.hot
    }

    /// Cold store handle
    pub fn cold_store(&self) -> &Arc<dyn ColdStore> {
        &self.cold
    }

    /// Compaction worker, shared with the flush service
    pub fn compactor(&self) -> &Arc<Compactor> {
        &self.compactor
    }

    /// Merge-query engine
    pub fn query_engine(&self) -> &MergeQueryEngine {
        &self.query
    }

    /// Key of a resource in the current bucket
    pub fn current_key(
        &self,
        subscription_id: u64,
        resource_type: &str,
        resource_id: u64,
    ) -> Result<ResourceKey> {
        ResourceKey::from_raw(
            self.zone.bucket_of(self.clock.now()),
            subscription_id,
            resource_type,
            resource_id,
        )
    }

    // ---- write ----

    /// Record traffic for a resource in the current bucket
    ///
    /// Zero traffic is accepted and writes nothing.
    pub async fn increment(
        &self,
        subscription_id: u64,
        resource_type: &str,
        resource_id: u64,
        upload: u64,
        download: u64,
    ) -> Result<()> {
        let key = self
            .current_key(subscription_id, resource_type, resource_id)
            .map_err(|e| {
                metrics::record_error("validation", "increment");
                e
            })?;

        let result = self.hot.increment(&key, upload, download).await;
        metrics::record_increment(upload, download, result.is_ok());
        if let Err(e) = &result {
            warn!(key = %key, error = %e, "Increment failed");
            metrics::record_error("hot_tier", "increment");
        }
        result?;

        self.feed_quota(&key, TrafficSummary::new(upload, download))
            .await;
        Ok(())
    }

    /// Record many reports in one round-trip
    ///
    /// Every entry is validated before anything is written, so a bad
    /// resource type rejects the whole batch. Returns the number of non-zero
    /// entries written.
    pub async fn batch_increment(&self, entries: &[TrafficEntry]) -> Result<usize> {
        let bucket = self.zone.bucket_of(self.clock.now());
        let keyed = entries
            .iter()
            .map(|entry| {
                ResourceKey::from_raw(
                    bucket,
                    entry.subscription_id,
                    &entry.resource_type,
                    entry.resource_id,
                )
                .map(|key| (key, TrafficSummary::new(entry.upload, entry.download)))
            })
            .collect::<Result<Vec<_>>>()
            .map_err(|e| {
                metrics::record_error("validation", "batch_increment");
                e
            })?;

        let writes: Vec<_> = keyed.into_iter().filter(|(_, t)| !t.is_zero()).collect();
        if writes.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.hot.batch_increment(&writes).await {
            warn!(entries = writes.len(), error = %e, "Batch increment failed");
            metrics::record_error("hot_tier", "batch_increment");
            for (_, traffic) in &writes {
                metrics::record_increment(traffic.upload, traffic.download, false);
            }
            return Err(e);
        }

        for (key, traffic) in &writes {
            metrics::record_increment(traffic.upload, traffic.download, true);
            self.feed_quota(key, *traffic).await;
        }
        debug!(entries = writes.len(), "Batch increment applied");
        Ok(writes.len())
    }

    /// Subscription-level traffic also counts against the subscription's
    /// quota; side-cache failures never fail the write
    async fn feed_quota(&self, key: &ResourceKey, traffic: TrafficSummary) {
        if traffic.is_zero() || *key.resource_type() != ResourceType::Subscription {
            return;
        }
        if let Err(e) = self.quota.record_usage(key.subscription_id(), traffic).await {
            warn!(
                subscription_id = key.subscription_id(),
                error = %e,
                "Quota cache update failed"
            );
            metrics::record_error("state", "record_usage");
        }
    }

    // ---- read ----

    /// Current hot counter of one key
    pub async fn get(&self, key: &ResourceKey) -> Result<CounterValue> {
        self.hot.get(key).await
    }

    /// Total traffic over a window
    pub async fn get_total(
        &self,
        resource_type: Option<&str>,
        window: TimeWindow,
    ) -> Result<QueryResult<TrafficSummary>> {
        let resource_type = parse_filter(resource_type)?;
        self.query.total(resource_type.as_ref(), window).await
    }

    /// One page of per-subscription totals
    pub async fn grouped_by_subscription(
        &self,
        resource_type: Option<&str>,
        window: TimeWindow,
        page: Page,
    ) -> Result<QueryResult<GroupedPage>> {
        let resource_type = parse_filter(resource_type)?;
        self.query
            .grouped(
                GroupDimension::Subscription,
                resource_type.as_ref(),
                window,
                page,
            )
            .await
    }

    /// One page of per-resource totals
    pub async fn grouped_by_resource(
        &self,
        resource_type: Option<&str>,
        window: TimeWindow,
        page: Page,
    ) -> Result<QueryResult<GroupedPage>> {
        let resource_type = parse_filter(resource_type)?;
        self.query
            .grouped(
                GroupDimension::Resource,
                resource_type.as_ref(),
                window,
                page,
            )
            .await
    }

    /// The `n` largest groups
    pub async fn top_n(
        &self,
        dimension: GroupDimension,
        resource_type: Option<&str>,
        window: TimeWindow,
        n: usize,
    ) -> Result<QueryResult<Vec<GroupRow>>> {
        let resource_type = parse_filter(resource_type)?;
        self.query
            .top_n(dimension, resource_type.as_ref(), window, n)
            .await
    }

    /// Traffic per hour, day or month
    pub async fn trend(
        &self,
        resource_type: Option<&str>,
        window: TimeWindow,
        granularity: Granularity,
    ) -> Result<QueryResult<Vec<TrendPoint>>> {
        let resource_type = parse_filter(resource_type)?;
        self.query
            .trend(resource_type.as_ref(), window, granularity)
            .await
    }

    /// Dashboard summary: total, top subscriptions, top resources and the
    /// hourly trend, fetched concurrently
    ///
    /// The first failing sub-query aborts the rest.
    pub async fn overview(&self, window: TimeWindow, top: usize) -> Result<Overview> {
        let (total, subscriptions, resources, trend) = tokio::try_join!(
            self.query.total(None, window),
            self.query
                .top_n(GroupDimension::Subscription, None, window, top),
            self.query.top_n(GroupDimension::Resource, None, window, top),
            self.query.trend(None, window, Granularity::Hour),
        )?;

        let mut warnings = Vec::new();
        for w in total
            .warnings
            .into_iter()
            .chain(subscriptions.warnings)
            .chain(resources.warnings)
            .chain(trend.warnings)
        {
            if !warnings.contains(&w) {
                warnings.push(w);
            }
        }

        Ok(Overview {
            total: total.value,
            top_subscriptions: subscriptions.value,
            top_resources: resources.value,
            trend: trend.value,
            warnings,
        })
    }

    // ---- lifecycle ----

    /// Seed a hot record from the cold tier without losing increments that
    /// raced ahead of the seed
    ///
    /// Returns how many directions were seeded (0-2).
    pub async fn init_from_cold_tier(
        &self,
        key: &ResourceKey,
        baseline: TrafficSummary,
    ) -> Result<u32> {
        let seeded = self.hot.init_baseline(key, baseline).await?;
        debug!(key = %key, seeded, "Initialized hot record from cold tier");
        Ok(seeded)
    }

    /// Drop one resource's hot record and index entries immediately
    pub async fn cleanup_resource(&self, key: &ResourceKey) -> Result<bool> {
        let removed = self.hot.cleanup_resource(key).await?;
        self.compactor.forget(key);
        if removed {
            info!(key = %key, "Cleaned up resource");
        }
        Ok(removed)
    }

    /// Drop a resource from every retained bucket, returning how many hot
    /// records were removed
    pub async fn cleanup_resource_everywhere(
        &self,
        subscription_id: u64,
        resource_type: &str,
        resource_id: u64,
    ) -> Result<usize> {
        let current = self.current_key(subscription_id, resource_type, resource_id)?;
        let buckets = self.hot.active_buckets().await?;

        let mut removed = 0;
        for bucket in buckets {
            let key = current.with_bucket(bucket);
            if self.hot.cleanup_resource(&key).await? {
                removed += 1;
            }
            self.compactor.forget(&key);
        }

        info!(
            subscription_id,
            resource_type,
            resource_id,
            removed,
            "Cleaned up resource across buckets"
        );
        Ok(removed)
    }

    /// Background service running compaction on the configured interval
    pub fn flush_service(&self) -> FlushService {
        FlushService::new(
            self.compactor.clone(),
            self.hot.clone(),
            self.config.compaction.clone(),
        )
    }

    /// Run one compaction cycle in the caller's task
    ///
    /// Waits for a cycle already running in the [`FlushService`] of this
    /// ledger instead of overlapping it.
    pub async fn compact(&self, cancel: &CancellationToken) -> Result<CompactionReport> {
        self.compactor.run_cycle(cancel).await
    }

    // ---- quota ----

    /// Seed a subscription's allowance and usage from the system of record
    pub async fn prime_quota(
        &self,
        subscription_id: u64,
        limit: Option<u64>,
        used: TrafficSummary,
    ) -> Result<bool> {
        self.quota.prime(subscription_id, limit, used).await
    }

    /// Current quota usage of a subscription
    pub async fn quota_status(&self, subscription_id: u64) -> Result<Option<QuotaStatus>> {
        self.quota.status(subscription_id).await
    }

    /// Evaluate a subscription against its alert thresholds
    ///
    /// Returns an alert the first time each threshold is crossed.
    pub async fn check_quota(&self, subscription_id: u64) -> Result<Option<QuotaAlert>> {
        match self.quota.status(subscription_id).await? {
            Some(status) => self.alerts.evaluate(subscription_id, &status).await,
            None => Ok(None),
        }
    }

    /// Start a new quota cycle for a subscription
    pub async fn reset_quota(&self, subscription_id: u64) -> Result<()> {
        self.quota.reset(subscription_id).await?;
        self.alerts.reset(subscription_id).await?;
        Ok(())
    }
}

fn parse_filter(resource_type: Option<&str>) -> Result<Option<ResourceType>> {
    resource_type.map(ResourceType::parse).transpose()
}
