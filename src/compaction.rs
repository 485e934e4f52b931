//! Compaction engine
//!
//! Moves settled deltas from the hot tier into the cold tier. A cycle walks
//! the active index and, per key:
//!
//! 1. snapshots `(upload, download, flushed_upload, flushed_download)`
//! 2. computes `delta = current - flushed`, clamped at zero
//! 3. with a zero delta, removes the key from the active index if nothing
//!    changed (deleting the record when its bucket left the retention window)
//! 4. otherwise accumulates the delta into the cold tier and then commits the
//!    observed values as the new flushed markers, settling the key only if no
//!    increment arrived in between
//!
//! The cold write and the marker commit are two steps. A crash between them
//! re-sends the same delta on the next cycle; every other interleaving with
//! concurrent increments is exactly-once.
//!
//! A failed key stays active and is retried next cycle. Its consecutive
//! failure count is tracked and reported once it crosses the configured
//! threshold. `NotFound` from the cold tier means the resource is gone, so
//! the key is purged from the hot tier instead.

use crate::clock::Clock;
use crate::cold::{AggregateTarget, ColdStore};
use crate::config::CompactionConfig;
use crate::error::{LedgerError, Result};
use crate::hot::{CommitOutcome, CounterRecord, HotStore};
use crate::key::ResourceKey;
use crate::metrics;
use crate::types::{BusinessZone, TimeBucket, TrafficSummary};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// Reports
// ============================================================================

/// What happened to one key during a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Delta written and markers committed
    Flushed {
        /// Bytes written to the cold tier
        traffic: TrafficSummary,
        /// Result of the marker commit
        commit: CommitOutcome,
    },
    /// Nothing pending; key left the active index
    Settled,
    /// Nothing pending; key left the active index and the record was deleted
    Purged,
    /// Increments arrived after the snapshot; key stays active
    Busy,
    /// Record vanished before it could be processed
    Missing,
    /// Counter fell below its markers; markers rebased to the observed values
    Rebased,
    /// Cold tier reported the resource gone; key purged from the hot tier
    ResourceGone,
    /// Cold write or marker commit failed; key stays active
    Failed,
    /// Skipped because the cycle was cancelled
    Cancelled,
}

impl KeyOutcome {
    fn label(&self) -> &'static str {
        match self {
            KeyOutcome::Flushed { .. } => "flushed",
            KeyOutcome::Settled => "settled",
            KeyOutcome::Purged => "purged",
            KeyOutcome::Busy => "busy",
            KeyOutcome::Missing => "missing",
            KeyOutcome::Rebased => "rebased",
            KeyOutcome::ResourceGone => "resource_gone",
            KeyOutcome::Failed => "failed",
            KeyOutcome::Cancelled => "cancelled",
        }
    }
}

/// Summary of one compaction cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Active keys examined
    pub scanned: usize,
    /// Keys whose delta reached the cold tier
    pub flushed: usize,
    /// Keys removed from the active index with nothing to flush
    pub settled: usize,
    /// Settled keys whose records were deleted
    pub purged: usize,
    /// Keys that received increments mid-cycle and stay active
    pub busy: usize,
    /// Keys whose records had already expired or been removed
    pub missing: usize,
    /// Counter resets detected
    pub counter_resets: usize,
    /// Keys purged because their resource no longer exists
    pub resources_gone: usize,
    /// Keys that failed and will be retried
    pub failed: usize,
    /// Keys skipped because of cancellation
    pub skipped: usize,
    /// Bytes written to the cold tier
    pub bytes_flushed: TrafficSummary,
    /// Whether the cycle stopped early on cancellation
    pub cancelled: bool,
}

impl CompactionReport {
    fn record(&mut self, outcome: &KeyOutcome) {
        match outcome {
            KeyOutcome::Flushed { traffic, commit } => {
                self.flushed += 1;
                self.bytes_flushed.add(*traffic);
                if *commit == CommitOutcome::Retained {
                    self.busy += 1;
                }
            },
            KeyOutcome::Settled => self.settled += 1,
            KeyOutcome::Purged => {
                self.settled += 1;
                self.purged += 1;
            },
            KeyOutcome::Busy => self.busy += 1,
            KeyOutcome::Missing => self.missing += 1,
            KeyOutcome::Rebased => self.counter_resets += 1,
            KeyOutcome::ResourceGone => self.resources_gone += 1,
            KeyOutcome::Failed => self.failed += 1,
            KeyOutcome::Cancelled => self.skipped += 1,
        }
    }
}

/// Result of draining one bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Records read out of the bucket
    pub records: usize,
    /// Records whose unflushed delta reached the cold tier
    pub flushed: usize,
    /// Records whose delta was written back into the hot tier after a failure
    pub restored: usize,
    /// Records dropped because their resource no longer exists
    pub resources_gone: usize,
    /// Records whose delta could be neither flushed nor restored
    pub lost: usize,
    /// Bytes written to the cold tier
    pub bytes_flushed: TrafficSummary,
}

/// Cumulative statistics across cycles
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    /// Cycles that ran to completion
    pub cycles_completed: u64,
    /// Cycles aborted by a hot-tier error
    pub cycles_failed: u64,
    /// Cycles stopped by cancellation
    pub cycles_cancelled: u64,
    /// Keys flushed
    pub keys_flushed: u64,
    /// Key failures
    pub key_failures: u64,
    /// Bytes written to the cold tier
    pub bytes_flushed: TrafficSummary,
    /// Most recent report
    pub last_report: Option<CompactionReport>,
}

// ============================================================================
// Compactor
// ============================================================================

/// Write-behind flush worker
pub struct Compactor {
    hot: Arc<dyn HotStore>,
    cold: Arc<dyn ColdStore>,
    clock: Arc<dyn Clock>,
    zone: BusinessZone,
    retention: chrono::Duration,
    config: CompactionConfig,
    failures: DashMap<ResourceKey, u32>,
    stats: RwLock<CompactionStats>,
    /// Serializes cycles and drains
    cycle_lock: tokio::sync::Mutex<()>,
}

impl Compactor {
    /// Create a compactor over the two tiers
    pub fn new(
        hot: Arc<dyn HotStore>,
        cold: Arc<dyn ColdStore>,
        clock: Arc<dyn Clock>,
        zone: BusinessZone,
        retention: std::time::Duration,
        config: CompactionConfig,
    ) -> Self {
        Self {
            hot,
            cold,
            clock,
            zone,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            config,
            failures: DashMap::new(),
            stats: RwLock::new(CompactionStats::default()),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// First bucket still inside the retention window
    pub fn hot_boundary(&self) -> TimeBucket {
        self.zone.bucket_of(self.clock.now() - self.retention)
    }

    /// Cumulative statistics
    pub fn stats(&self) -> CompactionStats {
        self.stats.read().clone()
    }

    /// Consecutive failure count of `key`
    pub fn failure_count(&self, key: &ResourceKey) -> u32 {
        self.failures.get(key).map(|count| *count).unwrap_or(0)
    }

    /// Stop tracking failures of a key removed from the hot tier
    pub fn forget(&self, key: &ResourceKey) {
        self.failures.remove(key);
    }

    /// Keys at or above the warning threshold, with their failure counts
    pub fn failing_keys(&self) -> Vec<(ResourceKey, u32)> {
        let mut keys: Vec<_> = self
            .failures
            .iter()
            .filter(|entry| *entry.value() >= self.config.failure_warn_threshold)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        keys.sort();
        keys
    }

    /// Run one compaction cycle
    ///
    /// Errors only when the active index or a snapshot cannot be read; per-key
    /// failures are counted in the report and retried next cycle. Cancellation
    /// is checked between keys, so a key whose cold write started always gets
    /// its markers committed.
    ///
    /// Cycles and drains on one compactor run one at a time. Separate
    /// compactors (other processes sharing a Redis hot tier) are not
    /// coordinated; run a single flusher per hot tier.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CompactionReport> {
        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }
        let _cycle = tokio::select! {
            _ = cancel.cancelled() => return Err(LedgerError::Cancelled),
            guard = self.cycle_lock.lock() => guard,
        };

        let start = Instant::now();
        let result = self.run_cycle_inner(cancel).await;
        let elapsed = start.elapsed();

        {
            let mut stats = self.stats.write();
            match &result {
                Ok(report) => {
                    if report.cancelled {
                        stats.cycles_cancelled += 1;
                    } else {
                        stats.cycles_completed += 1;
                    }
                    stats.keys_flushed += report.flushed as u64;
                    stats.key_failures += report.failed as u64;
                    stats.bytes_flushed.add(report.bytes_flushed);
                    stats.last_report = Some(report.clone());
                },
                Err(_) => stats.cycles_failed += 1,
            }
        }

        metrics::record_compaction_cycle(elapsed.as_secs_f64(), result.is_ok());
        metrics::update_failing_keys(self.failing_keys().len());

        match &result {
            Ok(report) if report.scanned > 0 => info!(
                scanned = report.scanned,
                flushed = report.flushed,
                settled = report.settled,
                failed = report.failed,
                upload = report.bytes_flushed.upload,
                download = report.bytes_flushed.download,
                duration_ms = elapsed.as_millis() as u64,
                "Compaction cycle finished"
            ),
            Ok(_) => debug!("Compaction cycle found no active keys"),
            Err(e) => {
                metrics::record_error("tier_unavailable", "compaction");
                error!(error = %e, "Compaction cycle failed");
            },
        }

        result
    }

    async fn run_cycle_inner(&self, cancel: &CancellationToken) -> Result<CompactionReport> {
        let keys = self.hot.active_keys(self.config.max_keys_per_cycle).await?;
        let boundary = self.hot_boundary();
        let mut report = CompactionReport::default();

        for batch in keys.chunks(self.config.snapshot_batch.max(1)) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.skipped += batch.len();
                continue;
            }

            let records = tokio::select! {
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    report.skipped += batch.len();
                    continue;
                }
                records = self.hot.snapshot(batch) => records?,
            };
            report.scanned += batch.len();

            let futs: Vec<_> = batch
                .iter()
                .zip(records)
                .map(|(key, record)| async move {
                    if cancel.is_cancelled() {
                        return KeyOutcome::Cancelled;
                    }
                    self.compact_key(key, record, boundary).await
                })
                .collect();
            let outcomes: Vec<KeyOutcome> = stream::iter(futs)
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

            for outcome in &outcomes {
                metrics::record_compaction_key(outcome.label());
                report.record(outcome);
            }
            if outcomes.iter().any(|o| *o == KeyOutcome::Cancelled) {
                report.cancelled = true;
            }
        }

        if !report.cancelled {
            self.prune_failures().await;
        }
        Ok(report)
    }

    /// Drop failure counts of keys that no longer hold unflushed traffic
    ///
    /// Covers keys that expired, were drained or were cleaned up after their
    /// last failed flush.
    async fn prune_failures(&self) {
        let tracked: Vec<ResourceKey> = self.failures.iter().map(|e| e.key().clone()).collect();
        if tracked.is_empty() {
            return;
        }

        let records = match self.hot.snapshot(&tracked).await {
            Ok(records) => records,
            Err(e) => {
                debug!(error = %e, "Could not check failing keys, keeping counts");
                return;
            },
        };

        for (key, record) in tracked.iter().zip(records) {
            let pending = record.is_some_and(|r| !r.pending().traffic.is_zero());
            if !pending {
                debug!(key = %key, "Dropping failure count of settled or vanished key");
                self.failures.remove(key);
            }
        }
    }

    /// Process a single key
    async fn compact_key(
        &self,
        key: &ResourceKey,
        record: Option<CounterRecord>,
        boundary: TimeBucket,
    ) -> KeyOutcome {
        let outcome = match record {
            None => self.settle_missing(key).await,
            Some(record) => self.flush_record(key, &record, boundary).await,
        };

        if !matches!(outcome, KeyOutcome::Failed | KeyOutcome::Cancelled) {
            self.failures.remove(key);
        }
        outcome
    }

    async fn settle_missing(&self, key: &ResourceKey) -> KeyOutcome {
        match self.hot.remove_if_settled(key, false).await {
            Ok(_) => KeyOutcome::Missing,
            Err(e) => self.record_failure(key, &e),
        }
    }

    async fn flush_record(
        &self,
        key: &ResourceKey,
        record: &CounterRecord,
        boundary: TimeBucket,
    ) -> KeyOutcome {
        let observed = record.traffic();
        let pending = record.pending();

        if pending.counter_reset {
            metrics::record_counter_reset(key.resource_type().as_str());
            warn!(
                key = %key,
                upload = record.upload,
                download = record.download,
                flushed_upload = record.last_flushed_upload,
                flushed_download = record.last_flushed_download,
                "Counter reset detected, rebasing flushed markers"
            );
        }

        if pending.traffic.is_zero() {
            if pending.counter_reset {
                return match self.hot.compare_and_commit(key, observed, observed).await {
                    Ok(_) => KeyOutcome::Rebased,
                    Err(e) => self.record_failure(key, &e),
                };
            }

            let purge = key.bucket() < boundary;
            return match self.hot.remove_if_settled(key, purge).await {
                Ok(true) if purge => KeyOutcome::Purged,
                Ok(true) => KeyOutcome::Settled,
                Ok(false) => KeyOutcome::Busy,
                Err(e) => self.record_failure(key, &e),
            };
        }

        let target = AggregateTarget::from(key);
        if let Err(e) = self.cold.accumulate(&target, key.bucket(), pending.traffic).await {
            if e.is_not_found() {
                return self.purge_gone_resource(key, &e).await;
            }
            return self.record_failure(key, &e);
        }

        match self.hot.compare_and_commit(key, observed, observed).await {
            Ok(commit) => {
                if commit == CommitOutcome::Settled && key.bucket() < boundary {
                    if let Err(e) = self.hot.remove_if_settled(key, true).await {
                        debug!(key = %key, error = %e, "Could not purge settled record");
                    }
                }
                debug!(
                    key = %key,
                    upload = pending.traffic.upload,
                    download = pending.traffic.download,
                    commit = ?commit,
                    "Flushed delta"
                );
                KeyOutcome::Flushed {
                    traffic: pending.traffic,
                    commit,
                }
            },
            Err(e) => {
                // The cold write landed; without markers the delta is re-sent next cycle
                error!(
                    key = %key,
                    error = %e,
                    "Marker commit failed after cold write"
                );
                self.record_failure(key, &e)
            },
        }
    }

    async fn purge_gone_resource(&self, key: &ResourceKey, cause: &LedgerError) -> KeyOutcome {
        info!(key = %key, reason = %cause, "Resource gone downstream, purging hot counters");
        match self.hot.cleanup_resource(key).await {
            Ok(_) => KeyOutcome::ResourceGone,
            Err(e) => self.record_failure(key, &e),
        }
    }

    fn record_failure(&self, key: &ResourceKey, e: &LedgerError) -> KeyOutcome {
        let count = {
            let mut entry = self.failures.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if count >= self.config.failure_warn_threshold {
            warn!(
                key = %key,
                consecutive_failures = count,
                error = %e,
                "Key keeps failing to flush"
            );
        } else {
            debug!(key = %key, attempt = count, error = %e, "Flush failed, will retry");
        }
        KeyOutcome::Failed
    }

    /// Aggregate a whole past bucket into the cold tier and remove it
    ///
    /// The bucket is read and deleted atomically; each record's unflushed
    /// delta is written to the cold tier. A delta whose write fails is put
    /// back into the hot tier as a fresh increment, so the next cycle flushes
    /// it again.
    pub async fn drain_bucket(&self, bucket: TimeBucket) -> Result<DrainReport> {
        let _cycle = self.cycle_lock.lock().await;
        let records = self.hot.get_and_cleanup(bucket).await?;
        for record in &records {
            self.failures.remove(&record.key);
        }
        let mut report = DrainReport {
            records: records.len(),
            ..Default::default()
        };

        let results: Vec<(TrafficSummary, DrainOutcome)> = stream::iter(records)
            .filter_map(|record| async move {
                let pending = record.pending().traffic;
                (!pending.is_zero()).then_some((record.key, pending))
            })
            .map(|(key, pending)| async move {
                let outcome = self.drain_record(&key, pending).await;
                (pending, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (pending, outcome) in results {
            match outcome {
                DrainOutcome::Flushed => {
                    report.flushed += 1;
                    report.bytes_flushed.add(pending);
                },
                DrainOutcome::Restored => report.restored += 1,
                DrainOutcome::ResourceGone => report.resources_gone += 1,
                DrainOutcome::Lost => report.lost += 1,
            }
        }

        info!(
            bucket = %bucket,
            records = report.records,
            flushed = report.flushed,
            restored = report.restored,
            lost = report.lost,
            "Drained hot bucket"
        );
        Ok(report)
    }

    async fn drain_record(&self, key: &ResourceKey, pending: TrafficSummary) -> DrainOutcome {
        let target = AggregateTarget::from(key);
        let err = match self.cold.accumulate(&target, key.bucket(), pending).await {
            Ok(()) => return DrainOutcome::Flushed,
            Err(e) if e.is_not_found() => return DrainOutcome::ResourceGone,
            Err(e) => e,
        };

        warn!(key = %key, error = %err, "Drain write failed, restoring delta to hot tier");
        match self
            .hot
            .increment(key, pending.upload, pending.download)
            .await
        {
            Ok(()) => DrainOutcome::Restored,
            Err(restore_err) => {
                metrics::record_error("data_loss", "drain_bucket");
                error!(
                    key = %key,
                    upload = pending.upload,
                    download = pending.download,
                    error = %restore_err,
                    "Drained delta could not be flushed or restored"
                );
                DrainOutcome::Lost
            },
        }
    }
}

enum DrainOutcome {
    Flushed,
    Restored,
    ResourceGone,
    Lost,
}

// ============================================================================
// Tests
// ============================================================================
