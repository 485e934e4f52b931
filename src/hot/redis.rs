//! Redis hot store
//!
//! Every multi-field mutation runs as one of the Lua scripts in
//! [`LuaScripts`]; batch increments and snapshots are pipelined so a batch
//! costs one round-trip.

use super::{
    redis_int, CommitOutcome, CounterRecord, CounterValue, HotStore, HotStoreSettings,
};
use crate::error::{LedgerError, Result};
use crate::key::ResourceKey;
use crate::redis::{LuaScripts, RedisPool};
use crate::types::{BusinessZone, TimeBucket, TrafficSummary};
use async_trait::async_trait;
use redis::{Script, ScriptInvocation};
use std::sync::Arc;
use tracing::{debug, warn};

/// SSCAN page size when walking the active index
const SCAN_COUNT: usize = 512;

/// Redis-backed [`HotStore`]
pub struct RedisHotStore {
    pool: Arc<RedisPool>,
    scripts: Arc<LuaScripts>,
    prefix: String,
    ttl_secs: u64,
    zone: BusinessZone,
}

impl RedisHotStore {
    /// Create a store over an existing pool
    pub fn new(pool: Arc<RedisPool>, settings: &HotStoreSettings, zone: BusinessZone) -> Self {
        Self {
            pool,
            scripts: Arc::new(LuaScripts::new()),
            prefix: settings.key_prefix.clone(),
            ttl_secs: settings.record_ttl.as_secs().max(1),
            zone,
        }
    }

    fn record_prefix(&self) -> String {
        format!("{}:rec:", self.prefix)
    }

    fn record_key(&self, member: &str) -> String {
        format!("{}:rec:{}", self.prefix, member)
    }

    fn bucket_index_key(&self, bucket: TimeBucket) -> String {
        format!("{}:bucket:{}", self.prefix, bucket.label())
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.prefix)
    }

    fn registry_key(&self) -> String {
        format!("{}:buckets", self.prefix)
    }

    fn increment_invocation<'a>(
        &self,
        script: &'a Script,
        key: &ResourceKey,
        traffic: TrafficSummary,
    ) -> ScriptInvocation<'a> {
        let member = key.encode();
        let bucket = key.bucket();
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.record_key(&member))
            .key(self.bucket_index_key(bucket))
            .key(self.active_key())
            .key(self.registry_key())
            .arg(member)
            .arg(redis_int(traffic.upload))
            .arg(redis_int(traffic.download))
            .arg(self.ttl_secs)
            .arg(bucket.score())
            .arg(bucket.label());
        invocation
    }

    /// Decode the flat quintuples returned by `collect_bucket`
    fn decode_records(&self, flat: Vec<String>) -> Result<Vec<CounterRecord>> {
        let mut records = Vec::with_capacity(flat.len() / 5);
        for chunk in flat.chunks(5) {
            let [member, u, d, fu, fd] = chunk else {
                return Err(LedgerError::Serialization(
                    "bucket scan returned a partial record".to_string(),
                ));
            };
            let key = match ResourceKey::decode(member, &self.zone) {
                Ok(key) => key,
                Err(e) => {
                    warn!(member = %member, error = %e, "Skipping undecodable hot key");
                    continue;
                },
            };
            records.push(CounterRecord {
                key,
                upload: parse_counter(u)?,
                download: parse_counter(d)?,
                last_flushed_upload: parse_counter(fu)?,
                last_flushed_download: parse_counter(fd)?,
            });
        }
        Ok(records)
    }

    async fn collect_bucket(&self, bucket: TimeBucket, delete: bool) -> Result<Vec<CounterRecord>> {
        let script = self.scripts.collect_bucket();
        let bucket_index = self.bucket_index_key(bucket);
        let active = self.active_key();
        let registry = self.registry_key();
        let record_prefix = self.record_prefix();
        let label = bucket.label();
        let delete_flag = if delete { "1" } else { "0" };

        let invoke = |mut conn: redis::aio::MultiplexedConnection| {
            let script = script.clone();
            let bucket_index = bucket_index.clone();
            let active = active.clone();
            let registry = registry.clone();
            let record_prefix = record_prefix.clone();
            let label = label.clone();
            async move {
                let flat: redis::RedisResult<Vec<String>> = script
                    .key(bucket_index)
                    .key(active)
                    .key(registry)
                    .arg(record_prefix)
                    .arg(label)
                    .arg(delete_flag)
                    .invoke_async(&mut conn)
                    .await;
                flat
            }
        };
        // A replayed drain would find the bucket already gone
        let flat = if delete {
            self.pool.execute_once(invoke).await?
        } else {
            self.pool.execute(invoke).await?
        };

        self.decode_records(flat)
    }
}

fn parse_counter(raw: &str) -> Result<u64> {
    raw.parse::<i64>()
        .map(|v| v.max(0) as u64)
        .map_err(|_| LedgerError::Serialization(format!("non-integer counter value: {}", raw)))
}

#[async_trait]
impl HotStore for RedisHotStore {
    fn backend_id(&self) -> &str {
        "redis-hot-v1"
    }

    async fn increment(&self, key: &ResourceKey, upload: u64, download: u64) -> Result<()> {
        if upload == 0 && download == 0 {
            return Ok(());
        }

        let script = self.scripts.increment();
        let invocation =
            self.increment_invocation(&script, key, TrafficSummary::new(upload, download));
        let _: i64 = self
            .pool
            .execute_once(|mut conn| {
                let invocation = &invocation;
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;
        Ok(())
    }

    async fn batch_increment(&self, entries: &[(ResourceKey, TrafficSummary)]) -> Result<()> {
        let script = self.scripts.increment();
        let invocations: Vec<_> = entries
            .iter()
            .filter(|(_, traffic)| !traffic.is_zero())
            .map(|(key, traffic)| self.increment_invocation(&script, key, *traffic))
            .collect();
        let Some(_) = invocations.first() else {
            return Ok(());
        };

        let mut pipe = redis::pipe();
        pipe.load_script(&script).ignore();
        for invocation in &invocations {
            pipe.invoke_script(invocation).ignore();
        }

        self.pool
            .execute_once(|mut conn| {
                let pipe = &pipe;
                async move { pipe.query_async::<()>(&mut conn).await }
            })
            .await?;

        debug!(entries = invocations.len(), "Pipelined batch increment");
        Ok(())
    }

    async fn get(&self, key: &ResourceKey) -> Result<CounterValue> {
        let record_key = self.record_key(&key.encode());
        let (upload, download): (Option<u64>, Option<u64>) = self
            .pool
            .execute(|mut conn| {
                let record_key = record_key.clone();
                async move {
                    redis::cmd("HMGET")
                        .arg(record_key)
                        .arg("u")
                        .arg("d")
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;

        Ok(CounterValue {
            traffic: TrafficSummary::new(upload.unwrap_or(0), download.unwrap_or(0)),
            exists: upload.is_some() || download.is_some(),
        })
    }

    async fn get_all(&self, bucket: TimeBucket) -> Result<Vec<CounterRecord>> {
        self.collect_bucket(bucket, false).await
    }

    async fn get_and_cleanup(&self, bucket: TimeBucket) -> Result<Vec<CounterRecord>> {
        self.collect_bucket(bucket, true).await
    }

    async fn cleanup(&self, bucket: TimeBucket) -> Result<usize> {
        let script = self.scripts.cleanup_bucket();
        let bucket_index = self.bucket_index_key(bucket);
        let active = self.active_key();
        let registry = self.registry_key();
        let record_prefix = self.record_prefix();
        let label = bucket.label();

        let removed: i64 = self
            .pool
            .execute(|mut conn| {
                let script = script.clone();
                let bucket_index = bucket_index.clone();
                let active = active.clone();
                let registry = registry.clone();
                let record_prefix = record_prefix.clone();
                let label = label.clone();
                async move {
                    script
                        .key(bucket_index)
                        .key(active)
                        .key(registry)
                        .arg(record_prefix)
                        .arg(label)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        Ok(removed.max(0) as usize)
    }

    async fn active_keys(&self, limit: usize) -> Result<Vec<ResourceKey>> {
        let active = self.active_key();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, members): (u64, Vec<String>) = self
                .pool
                .execute(|mut conn| {
                    let active = active.clone();
                    async move {
                        redis::cmd("SSCAN")
                            .arg(active)
                            .arg(cursor)
                            .arg("COUNT")
                            .arg(SCAN_COUNT)
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await?;

            for member in members {
                match ResourceKey::decode(&member, &self.zone) {
                    Ok(key) => keys.push(key),
                    Err(e) => {
                        warn!(member = %member, error = %e, "Skipping undecodable active key")
                    },
                }
            }

            cursor = next;
            if cursor == 0 || keys.len() >= limit {
                break;
            }
        }

        // SSCAN may return duplicates across pages
        keys.sort();
        keys.dedup();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn snapshot(&self, keys: &[ResourceKey]) -> Result<Vec<Option<CounterRecord>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("HMGET")
                .arg(self.record_key(&key.encode()))
                .arg("u")
                .arg("d")
                .arg("fu")
                .arg("fd");
        }

        type Fields = (Option<u64>, Option<u64>, Option<u64>, Option<u64>);
        let rows: Vec<Fields> = self
            .pool
            .execute(|mut conn| {
                let pipe = &pipe;
                async move { pipe.query_async(&mut conn).await }
            })
            .await?;

        Ok(keys
            .iter()
            .zip(rows)
            .map(|(key, (u, d, fu, fd))| {
                if u.is_none() && d.is_none() {
                    return None;
                }
                Some(CounterRecord {
                    key: key.clone(),
                    upload: u.unwrap_or(0),
                    download: d.unwrap_or(0),
                    last_flushed_upload: fu.unwrap_or(0),
                    last_flushed_download: fd.unwrap_or(0),
                })
            })
            .collect())
    }

    async fn compare_and_commit(
        &self,
        key: &ResourceKey,
        expected: TrafficSummary,
        markers: TrafficSummary,
    ) -> Result<CommitOutcome> {
        let member = key.encode();
        let script = self.scripts.compare_and_commit();
        let record_key = self.record_key(&member);
        let active = self.active_key();

        let result: i64 = self
            .pool
            .execute(|mut conn| {
                let script = script.clone();
                let record_key = record_key.clone();
                let active = active.clone();
                let member = member.clone();
                async move {
                    script
                        .key(record_key)
                        .key(active)
                        .arg(member)
                        .arg(redis_int(expected.upload))
                        .arg(redis_int(expected.download))
                        .arg(redis_int(markers.upload))
                        .arg(redis_int(markers.download))
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        Ok(match result {
            1 => CommitOutcome::Settled,
            0 => CommitOutcome::Retained,
            _ => CommitOutcome::Missing,
        })
    }

    async fn remove_if_settled(&self, key: &ResourceKey, purge: bool) -> Result<bool> {
        let member = key.encode();
        let script = self.scripts.remove_if_settled();
        let record_key = self.record_key(&member);
        let active = self.active_key();
        let bucket_index = self.bucket_index_key(key.bucket());
        let purge_flag = if purge { "1" } else { "0" };

        let removed: i64 = self
            .pool
            .execute(|mut conn| {
                let script = script.clone();
                let record_key = record_key.clone();
                let active = active.clone();
                let bucket_index = bucket_index.clone();
                let member = member.clone();
                async move {
                    script
                        .key(record_key)
                        .key(active)
                        .key(bucket_index)
                        .arg(member)
                        .arg(purge_flag)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        Ok(removed == 1)
    }

    async fn init_baseline(&self, key: &ResourceKey, baseline: TrafficSummary) -> Result<u32> {
        let member = key.encode();
        let bucket = key.bucket();
        let script = self.scripts.init_baseline();
        let record_key = self.record_key(&member);
        let bucket_index = self.bucket_index_key(bucket);
        let registry = self.registry_key();
        let ttl = self.ttl_secs;

        let seeded: i64 = self
            .pool
            .execute(|mut conn| {
                let script = script.clone();
                let record_key = record_key.clone();
                let bucket_index = bucket_index.clone();
                let registry = registry.clone();
                let member = member.clone();
                async move {
                    script
                        .key(record_key)
                        .key(bucket_index)
                        .key(registry)
                        .arg(member)
                        .arg(redis_int(baseline.upload))
                        .arg(redis_int(baseline.download))
                        .arg(ttl)
                        .arg(bucket.score())
                        .arg(bucket.label())
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        Ok(seeded.clamp(0, 2) as u32)
    }

    async fn cleanup_resource(&self, key: &ResourceKey) -> Result<bool> {
        let member = key.encode();
        let script = self.scripts.cleanup_resource();
        let record_key = self.record_key(&member);
        let active = self.active_key();
        let bucket_index = self.bucket_index_key(key.bucket());

        let deleted: i64 = self
            .pool
            .execute(|mut conn| {
                let script = script.clone();
                let record_key = record_key.clone();
                let active = active.clone();
                let bucket_index = bucket_index.clone();
                let member = member.clone();
                async move {
                    script
                        .key(record_key)
                        .key(active)
                        .key(bucket_index)
                        .arg(member)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        Ok(deleted > 0)
    }

    async fn active_buckets(&self) -> Result<Vec<TimeBucket>> {
        let registry = self.registry_key();
        let labels: Vec<String> = self
            .pool
            .execute(|mut conn| {
                let registry = registry.clone();
                async move {
                    redis::cmd("ZRANGE")
                        .arg(registry)
                        .arg(0)
                        .arg(-1)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;

        let mut buckets = Vec::with_capacity(labels.len());
        for label in labels {
            match self.zone.parse_bucket(&label) {
                Ok(bucket) => buckets.push(bucket),
                Err(e) => warn!(label = %label, error = %e, "Skipping malformed bucket label"),
            }
        }
        Ok(buckets)
    }
}
