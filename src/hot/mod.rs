//! Hot counter store
//!
//! The hot tier absorbs every traffic report. It keeps, per [`ResourceKey`],
//! an upload/download accumulator plus the values already flushed to the cold
//! tier, and two indexes:
//!
//! - a per-bucket membership set, used to enumerate one bucket without
//!   scanning the whole keyspace
//! - the domain-wide active index holding every key with unflushed data,
//!   which bounds a compaction scan to O(active keys)
//!
//! Every record and index carries a TTL longer than both the retention window
//! and the maximum compaction interval, so an abandoned key disappears on its
//! own even if compaction never runs.
//!
//! # Backends
//!
//! - [`RedisHotStore`]: production backend; every multi-field mutation is one
//!   Lua script
//! - [`MemoryHotStore`]: single-process backend for tests and embedding; every
//!   operation runs under one mutex

pub mod memory;
pub mod redis;

pub use self::memory::MemoryHotStore;
pub use self::redis::RedisHotStore;

use crate::error::Result;
use crate::key::ResourceKey;
use crate::types::{TimeBucket, TrafficSummary};
use async_trait::async_trait;
use std::time::Duration;

/// Settings shared by hot-tier backends
#[derive(Debug, Clone)]
pub struct HotStoreSettings {
    /// Prefix for every Redis key
    pub key_prefix: String,
    /// TTL applied to records and indexes on every write
    pub record_ttl: Duration,
}

impl Default for HotStoreSettings {
    fn default() -> Self {
        Self {
            key_prefix: "traffic".to_string(),
            record_ttl: Duration::from_secs(49 * 3600),
        }
    }
}

/// Point read result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterValue {
    /// Accumulated traffic, zero when absent
    pub traffic: TrafficSummary,
    /// Whether the record exists
    pub exists: bool,
}

/// One hot-tier record with its flushed markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRecord {
    /// Record address
    pub key: ResourceKey,
    /// Accumulated upload bytes
    pub upload: u64,
    /// Accumulated download bytes
    pub download: u64,
    /// Upload bytes already persisted in the cold tier
    pub last_flushed_upload: u64,
    /// Download bytes already persisted in the cold tier
    pub last_flushed_download: u64,
}

/// Unflushed part of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDelta {
    /// Delta clamped to non-negative values
    pub traffic: TrafficSummary,
    /// A counter fell below its flushed marker (store reset or eviction)
    pub counter_reset: bool,
}

impl CounterRecord {
    /// Accumulated traffic
    pub fn traffic(&self) -> TrafficSummary {
        TrafficSummary::new(self.upload, self.download)
    }

    /// Flushed markers as a summary
    pub fn flushed(&self) -> TrafficSummary {
        TrafficSummary::new(self.last_flushed_upload, self.last_flushed_download)
    }

    /// `current - last_flushed`, clamped at zero per direction
    pub fn pending(&self) -> PendingDelta {
        PendingDelta {
            traffic: TrafficSummary::new(
                self.upload.saturating_sub(self.last_flushed_upload),
                self.download.saturating_sub(self.last_flushed_download),
            ),
            counter_reset: self.upload < self.last_flushed_upload
                || self.download < self.last_flushed_download,
        }
    }
}

/// Result of [`HotStore::compare_and_commit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Markers written and the key left the active index
    Settled,
    /// Markers written but newer increments arrived; key stays active
    Retained,
    /// The record vanished (expired or cleaned up) before the commit
    Missing,
}

impl CommitOutcome {
    /// Whether the markers were written
    pub fn committed(&self) -> bool {
        matches!(self, CommitOutcome::Settled | CommitOutcome::Retained)
    }
}

/// Core trait for hot-tier backends
///
/// Every mutating method is atomic with respect to concurrent increments of
/// the same key. None of them is a client-side read followed by a write.
#[async_trait]
pub trait HotStore: Send + Sync + 'static {
    /// Backend identifier for logs
    fn backend_id(&self) -> &str;

    /// Add non-negative deltas to a record
    ///
    /// No-op when both deltas are zero. Refreshes the TTL and adds the key to
    /// the bucket index and the active index.
    async fn increment(&self, key: &ResourceKey, upload: u64, download: u64) -> Result<()>;

    /// Pipelined multi-entry increment
    async fn batch_increment(&self, entries: &[(ResourceKey, TrafficSummary)]) -> Result<()>;

    /// Point read; never errors on a missing key
    async fn get(&self, key: &ResourceKey) -> Result<CounterValue>;

    /// Every record of a bucket, enumerated through the bucket index
    ///
    /// Callers must only pass buckets at least one bucket-width in the past.
    /// A bucket that still receives increments can be read, but the result is
    /// a moving snapshot.
    async fn get_all(&self, bucket: TimeBucket) -> Result<Vec<CounterRecord>>;

    /// Read and delete every record of a bucket in one atomic step
    async fn get_and_cleanup(&self, bucket: TimeBucket) -> Result<Vec<CounterRecord>>;

    /// Delete every record of a bucket together with its index
    ///
    /// Returns the number of records deleted.
    async fn cleanup(&self, bucket: TimeBucket) -> Result<usize>;

    /// Up to `limit` keys from the active index
    async fn active_keys(&self, limit: usize) -> Result<Vec<ResourceKey>>;

    /// Records with markers for the given keys, `None` where absent
    async fn snapshot(&self, keys: &[ResourceKey]) -> Result<Vec<Option<CounterRecord>>>;

    /// Write flushed markers and settle the key if its counters still equal
    /// `expected`
    async fn compare_and_commit(
        &self,
        key: &ResourceKey,
        expected: TrafficSummary,
        markers: TrafficSummary,
    ) -> Result<CommitOutcome>;

    /// Remove the key from the active index if counters equal markers
    ///
    /// With `purge`, the settled record is deleted as well. Returns whether the
    /// key left the active index.
    async fn remove_if_settled(&self, key: &ResourceKey, purge: bool) -> Result<bool>;

    /// Seed a record from a durable baseline, per-direction set-if-absent
    ///
    /// Returns the number of directions seeded.
    async fn init_baseline(&self, key: &ResourceKey, baseline: TrafficSummary) -> Result<u32>;

    /// Delete one key from the record store and both indexes
    async fn cleanup_resource(&self, key: &ResourceKey) -> Result<bool>;

    /// Buckets that currently hold records, oldest first
    async fn active_buckets(&self) -> Result<Vec<TimeBucket>>;
}

/// Clamp a byte count into the range Redis integers accept
pub(crate) fn redis_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
