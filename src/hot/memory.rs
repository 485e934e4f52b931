//! In-memory hot store
//!
//! Implements [`HotStore`] with the same semantics as the Redis backend:
//! additive increments, per-bucket and active indexes, TTL expiry against an
//! injected [`Clock`], and atomic compare-and-commit. All state sits behind one
//! `parking_lot::Mutex`, which plays the role Lua script atomicity plays in
//! Redis.
//!
//! Intended for tests, simulations and single-process deployments; nothing
//! survives a restart.

use super::{CommitOutcome, CounterRecord, CounterValue, HotStore, HotStoreSettings};
use crate::clock::Clock;
use crate::error::Result;
use crate::key::ResourceKey;
use crate::types::{TimeBucket, TrafficSummary};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Entry {
    upload: u64,
    download: u64,
    flushed_upload: Option<u64>,
    flushed_download: Option<u64>,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            upload: 0,
            download: 0,
            flushed_upload: None,
            flushed_download: None,
            expires_at,
        }
    }

    fn settled(&self) -> bool {
        self.upload == self.flushed_upload.unwrap_or(0)
            && self.download == self.flushed_download.unwrap_or(0)
    }

    fn to_record(&self, key: &ResourceKey) -> CounterRecord {
        CounterRecord {
            key: key.clone(),
            upload: self.upload,
            download: self.download,
            last_flushed_upload: self.flushed_upload.unwrap_or(0),
            last_flushed_download: self.flushed_download.unwrap_or(0),
        }
    }
}

#[derive(Debug, Default)]
struct BucketIndex {
    members: HashSet<ResourceKey>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<ResourceKey, Entry>,
    /// Record keys by expiry instant; every record sits in exactly one slot
    expiries: BTreeMap<DateTime<Utc>, HashSet<ResourceKey>>,
    buckets: BTreeMap<TimeBucket, BucketIndex>,
    active: HashSet<ResourceKey>,
    active_expires_at: Option<DateTime<Utc>>,
}

impl Inner {
    /// Drop everything whose TTL has passed
    ///
    /// Only the expired slots of the expiry index are visited.
    fn expire(&mut self, now: DateTime<Utc>) {
        while let Some(slot) = self.expiries.first_entry() {
            if *slot.key() > now {
                break;
            }
            for key in slot.remove() {
                self.records.remove(&key);
            }
        }

        if self.active_expires_at.is_some_and(|at| at <= now) {
            self.active.clear();
            self.active_expires_at = None;
        }

        self.buckets
            .retain(|_, index| index.expires_at.is_some_and(|at| at > now));
    }

    fn schedule(
        &mut self,
        key: &ResourceKey,
        previous: Option<DateTime<Utc>>,
        expires_at: DateTime<Utc>,
    ) {
        if previous == Some(expires_at) {
            return;
        }
        if let Some(previous) = previous {
            self.unschedule(key, previous);
        }
        self.expiries
            .entry(expires_at)
            .or_default()
            .insert(key.clone());
    }

    fn unschedule(&mut self, key: &ResourceKey, at: DateTime<Utc>) {
        if let Some(slot) = self.expiries.get_mut(&at) {
            slot.remove(key);
            if slot.is_empty() {
                self.expiries.remove(&at);
            }
        }
    }

    fn remove_record(&mut self, key: &ResourceKey) -> Option<Entry> {
        let entry = self.records.remove(key)?;
        self.unschedule(key, entry.expires_at);
        Some(entry)
    }

    fn live_entry(&self, key: &ResourceKey, now: DateTime<Utc>) -> Option<&Entry> {
        self.records.get(key).filter(|entry| entry.expires_at > now)
    }

    fn touch_indexes(&mut self, key: &ResourceKey, expires_at: DateTime<Utc>, active: bool) {
        let index = self.buckets.entry(key.bucket()).or_default();
        index.members.insert(key.clone());
        index.expires_at = Some(expires_at);

        if active {
            self.active.insert(key.clone());
            self.active_expires_at = Some(expires_at);
        }
    }

    fn apply_increment(
        &mut self,
        key: &ResourceKey,
        upload: u64,
        download: u64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) {
        let expires_at = now + ttl;
        if self.records.get(key).is_some_and(|e| e.expires_at <= now) {
            self.remove_record(key);
        }
        let previous = self.records.get(key).map(|e| e.expires_at);
        let entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| Entry::new(expires_at));
        entry.upload = entry.upload.saturating_add(upload);
        entry.download = entry.download.saturating_add(download);
        entry.expires_at = expires_at;

        self.schedule(key, previous, expires_at);
        self.touch_indexes(key, expires_at, true);
    }

    fn collect_bucket(&mut self, bucket: TimeBucket, delete: bool) -> Vec<CounterRecord> {
        let members: Vec<ResourceKey> = match self.buckets.get(&bucket) {
            Some(index) => index.members.iter().cloned().collect(),
            None => return Vec::new(),
        };

        let mut records = Vec::with_capacity(members.len());
        for key in &members {
            if let Some(entry) = self.records.get(key) {
                records.push(entry.to_record(key));
            }
            if delete {
                self.remove_record(key);
                self.active.remove(key);
            }
        }

        if delete {
            self.buckets.remove(&bucket);
        }
        records
    }
}

/// In-memory [`HotStore`]
pub struct MemoryHotStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl MemoryHotStore {
    /// Create a store whose TTLs expire against `clock`
    pub fn new(settings: &HotStoreSettings, clock: Arc<dyn Clock>) -> Self {
        let ttl = Duration::from_std(settings.record_ttl).unwrap_or(Duration::hours(49));
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            ttl,
        }
    }

    /// Drop expired records and indexes now
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.inner.lock().expire(now);
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.expire(now);
        inner.records.len()
    }

    /// Whether no live records remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is currently in the active index
    pub fn is_active(&self, key: &ResourceKey) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.expire(now);
        inner.active.contains(key)
    }
}

#[async_trait]
impl HotStore for MemoryHotStore {
    fn backend_id(&self) -> &str {
        "memory-hot-v1"
    }

    async fn increment(&self, key: &ResourceKey, upload: u64, download: u64) -> Result<()> {
        if upload == 0 && download == 0 {
            return Ok(());
        }
        let now = self.clock.now();
        self.inner
            .lock()
            .apply_increment(key, upload, download, now, self.ttl);
        Ok(())
    }

    async fn batch_increment(&self, entries: &[(ResourceKey, TrafficSummary)]) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        for (key, traffic) in entries.iter().filter(|(_, t)| !t.is_zero()) {
            inner.apply_increment(key, traffic.upload, traffic.download, now, self.ttl);
        }
        Ok(())
    }

    async fn get(&self, key: &ResourceKey) -> Result<CounterValue> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        Ok(match inner.live_entry(key, now) {
            Some(entry) => CounterValue {
                traffic: TrafficSummary::new(entry.upload, entry.download),
                exists: true,
            },
            None => CounterValue::default(),
        })
    }

    async fn get_all(&self, bucket: TimeBucket) -> Result<Vec<CounterRecord>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.expire(now);
        Ok(inner.collect_bucket(bucket, false))
    }

    async fn get_and_cleanup(&self, bucket: TimeBucket) -> Result<Vec<CounterRecord>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.expire(now);
        Ok(inner.collect_bucket(bucket, true))
    }

    async fn cleanup(&self, bucket: TimeBucket) -> Result<usize> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.expire(now);
        Ok(inner.collect_bucket(bucket, true).len())
    }

    async fn active_keys(&self, limit: usize) -> Result<Vec<ResourceKey>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.expire(now);
        let mut keys: Vec<ResourceKey> = inner.active.iter().cloned().collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn snapshot(&self, keys: &[ResourceKey]) -> Result<Vec<Option<CounterRecord>>> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        Ok(keys
            .iter()
            .map(|key| inner.live_entry(key, now).map(|entry| entry.to_record(key)))
            .collect())
    }

    async fn compare_and_commit(
        &self,
        key: &ResourceKey,
        expected: TrafficSummary,
        markers: TrafficSummary,
    ) -> Result<CommitOutcome> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.expire(now);

        let Some(entry) = inner.records.get_mut(key) else {
            inner.active.remove(key);
            return Ok(CommitOutcome::Missing);
        };

        entry.flushed_upload = Some(markers.upload);
        entry.flushed_download = Some(markers.download);

        if entry.upload == expected.upload && entry.download == expected.download {
            inner.active.remove(key);
            Ok(CommitOutcome::Settled)
        } else {
            Ok(CommitOutcome::Retained)
        }
    }

    async fn remove_if_settled(&self, key: &ResourceKey, purge: bool) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.expire(now);

        let settled = match inner.records.get(key) {
            Some(entry) => entry.settled(),
            None => true,
        };
        if !settled {
            return Ok(false);
        }

        inner.active.remove(key);
        if purge {
            inner.remove_record(key);
            if let Some(index) = inner.buckets.get_mut(&key.bucket()) {
                index.members.remove(key);
            }
        }
        Ok(true)
    }

    async fn init_baseline(&self, key: &ResourceKey, baseline: TrafficSummary) -> Result<u32> {
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let mut inner = self.inner.lock();
        inner.expire(now);

        let previous = inner.records.get(key).map(|e| e.expires_at);
        let entry = inner
            .records
            .entry(key.clone())
            .or_insert_with(|| Entry::new(expires_at));

        let mut seeded = 0;
        if entry.flushed_upload.is_none() {
            entry.flushed_upload = Some(baseline.upload);
            entry.upload = entry.upload.saturating_add(baseline.upload);
            seeded += 1;
        }
        if entry.flushed_download.is_none() {
            entry.flushed_download = Some(baseline.download);
            entry.download = entry.download.saturating_add(baseline.download);
            seeded += 1;
        }
        entry.expires_at = expires_at;

        inner.schedule(key, previous, expires_at);
        inner.touch_indexes(key, expires_at, false);
        Ok(seeded)
    }

    async fn cleanup_resource(&self, key: &ResourceKey) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.active.remove(key);
        if let Some(index) = inner.buckets.get_mut(&key.bucket()) {
            index.members.remove(key);
        }
        Ok(inner.remove_record(key).is_some())
    }

    async fn active_buckets(&self) -> Result<Vec<TimeBucket>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.expire(now);
        Ok(inner
            .buckets
            .iter()
            .filter(|(_, index)| !index.members.is_empty())
            .map(|(bucket, _)| *bucket)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::key::ResourceType;
    use crate::types::BusinessZone;
    use chrono::TimeZone;

    fn setup() -> (Arc<ManualClock>, MemoryHotStore, ResourceKey) {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let settings = HotStoreSettings {
            record_ttl: std::time::Duration::from_secs(3600 * 3),
            ..Default::default()
        };
        let store = MemoryHotStore::new(&settings, clock.clone());
        let bucket = BusinessZone::default().bucket_of(start);
        let key = ResourceKey::new(bucket, 1, ResourceType::Node, 100);
        (clock, store, key)
    }

    #[tokio::test]
    async fn test_increment_accumulates() {
        let (_clock, store, key) = setup();
        store.increment(&key, 1000, 2000).await.unwrap();
        store.increment(&key, 500, 300).await.unwrap();

        let value = store.get(&key).await.unwrap();
        assert!(value.exists);
        assert_eq!(value.traffic, TrafficSummary::new(1500, 2300));
        assert!(store.is_active(&key));
    }

    #[tokio::test]
    async fn test_zero_increment_is_noop() {
        let (_clock, store, key) = setup();
        store.increment(&key, 0, 0).await.unwrap();
        assert!(!store.get(&key).await.unwrap().exists);
        assert!(!store.is_active(&key));
    }

    #[tokio::test]
    async fn test_missing_key_reads_zero() {
        let (_clock, store, key) = setup();
        let value = store.get(&key).await.unwrap();
        assert_eq!(value, CounterValue::default());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (clock, store, key) = setup();
        store.increment(&key, 10, 10).await.unwrap();

        clock.advance(Duration::hours(2));
        assert!(store.get(&key).await.unwrap().exists);

        clock.advance(Duration::hours(2));
        assert!(!store.get(&key).await.unwrap().exists);
        assert!(store.active_keys(10).await.unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_increment_refreshes_ttl() {
        let (clock, store, key) = setup();
        store.increment(&key, 10, 10).await.unwrap();
        clock.advance(Duration::hours(2));
        store.increment(&key, 1, 1).await.unwrap();
        clock.advance(Duration::hours(2));

        let value = store.get(&key).await.unwrap();
        assert_eq!(value.traffic, TrafficSummary::new(11, 11));
    }

    #[tokio::test]
    async fn test_expiry_index_visits_only_expired_slots() {
        let (clock, store, key) = setup();
        let idle = ResourceKey::new(key.bucket(), 1, ResourceType::Node, 200);
        let purged = ResourceKey::new(key.bucket(), 1, ResourceType::Node, 300);
        store.increment(&key, 10, 10).await.unwrap();
        store.increment(&idle, 1, 1).await.unwrap();
        store.increment(&purged, 1, 1).await.unwrap();
        store.cleanup_resource(&purged).await.unwrap();

        clock.advance(Duration::hours(2));
        store.increment(&key, 1, 1).await.unwrap();
        {
            let inner = store.inner.lock();
            let scheduled: usize = inner.expiries.values().map(HashSet::len).sum();
            assert_eq!(scheduled, inner.records.len());
            assert_eq!(inner.expiries.len(), 2);
        }

        clock.advance(Duration::hours(2));
        store.purge_expired();
        assert_eq!(store.len(), 1);
        assert!(store.get(&key).await.unwrap().exists);
        assert!(!store.get(&idle).await.unwrap().exists);

        let inner = store.inner.lock();
        assert_eq!(inner.expiries.len(), 1);
        assert!(inner.expiries.values().all(|slot| slot.contains(&key)));
    }

    #[tokio::test]
    async fn test_commit_settles_only_when_unchanged() {
        let (_clock, store, key) = setup();
        store.increment(&key, 100, 100).await.unwrap();
        let observed = TrafficSummary::new(100, 100);

        store.increment(&key, 1, 0).await.unwrap();
        let outcome = store
            .compare_and_commit(&key, observed, observed)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Retained);
        assert!(store.is_active(&key));

        let record = store.snapshot(&[key.clone()]).await.unwrap()[0]
            .clone()
            .unwrap();
        assert_eq!(record.flushed(), observed);
        assert_eq!(record.pending().traffic, TrafficSummary::new(1, 0));
    }

    #[tokio::test]
    async fn test_remove_if_settled_with_purge() {
        let (_clock, store, key) = setup();
        store.increment(&key, 5, 5).await.unwrap();
        assert!(!store.remove_if_settled(&key, true).await.unwrap());

        let observed = TrafficSummary::new(5, 5);
        store
            .compare_and_commit(&key, observed, observed)
            .await
            .unwrap();
        assert!(store.remove_if_settled(&key, true).await.unwrap());
        assert!(!store.get(&key).await.unwrap().exists);
        assert!(store.get_all(key.bucket()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_and_cleanup_removes_bucket() {
        let (_clock, store, key) = setup();
        let other = ResourceKey::new(key.bucket(), 2, ResourceType::ForwardRule, 7);
        store.increment(&key, 1, 2).await.unwrap();
        store.increment(&other, 3, 4).await.unwrap();

        let mut records = store.get_and_cleanup(key.bucket()).await.unwrap();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(records.len(), 2);
        assert!(store.get_all(key.bucket()).await.unwrap().is_empty());
        assert!(store.active_keys(10).await.unwrap().is_empty());
        assert!(store.active_buckets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_baseline_preserves_racing_increment() {
        let (_clock, store, key) = setup();
        store.increment(&key, 500, 0).await.unwrap();

        let seeded = store
            .init_baseline(&key, TrafficSummary::new(1000, 2000))
            .await
            .unwrap();
        assert_eq!(seeded, 2);

        let record = store.snapshot(&[key.clone()]).await.unwrap()[0]
            .clone()
            .unwrap();
        assert_eq!(record.traffic(), TrafficSummary::new(1500, 2000));
        assert_eq!(record.pending().traffic, TrafficSummary::new(500, 0));

        // Second seed is a no-op
        let seeded = store
            .init_baseline(&key, TrafficSummary::new(9, 9))
            .await
            .unwrap();
        assert_eq!(seeded, 0);
    }

    #[tokio::test]
    async fn test_cleanup_resource() {
        let (_clock, store, key) = setup();
        store.increment(&key, 1, 1).await.unwrap();
        assert!(store.cleanup_resource(&key).await.unwrap());
        assert!(!store.is_active(&key));
        assert!(!store.get(&key).await.unwrap().exists);
        assert!(!store.cleanup_resource(&key).await.unwrap());
    }
}
