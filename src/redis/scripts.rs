//! Lua scripts for atomic hot-tier operations
//!
//! Every mutation of the hot tier that touches more than one field or key runs
//! as a single script, so Redis executes it atomically in one round-trip. No
//! caller ever reads a record and writes it back in a separate command.
//!
//! # Record layout
//!
//! ```text
//! {prefix}:rec:{key}        → HASH { u, d, fu, fd }   (upload, download, flushed markers)
//! {prefix}:bucket:{label}   → SET of keys written in the bucket
//! {prefix}:active           → SET of keys with unflushed data
//! {prefix}:buckets          → ZSET(label → hour score)
//! ```
//!
//! # Scripts Provided
//!
//! - `increment`: additive write that refreshes TTLs and indexes
//! - `compare_and_commit`: advance flushed markers, settle if unchanged
//! - `remove_if_settled`: drop a key from the active index when nothing is unflushed
//! - `collect_bucket`: read (and optionally delete) every record of a bucket
//! - `cleanup_bucket`: delete every record of a bucket
//! - `init_baseline`: seed counters from a durable baseline, per-field set-if-absent
//! - `cleanup_resource`: delete one key everywhere
//! - `incr_field`, `set_field_if_absent`, `compare_and_set_field`: side-cache hash updates

use parking_lot::RwLock;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;

/// Collection of Lua scripts for atomic Redis operations
///
/// Scripts are cached after first use so the SHA1 is computed once.
pub struct LuaScripts {
    cache: RwLock<HashMap<&'static str, Arc<Script>>>,
}

impl LuaScripts {
    /// Create a new LuaScripts instance
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, name: &'static str, lua: &str) -> Arc<Script> {
        if let Some(script) = self.cache.read().get(name) {
            return Arc::clone(script);
        }

        let mut cache = self.cache.write();
        Arc::clone(
            cache
                .entry(name)
                .or_insert_with(|| Arc::new(Script::new(lua))),
        )
    }

    /// Add deltas to a record and register it in the indexes
    ///
    /// # Keys
    /// - KEYS[1]: record hash
    /// - KEYS[2]: bucket index set
    /// - KEYS[3]: active index set
    /// - KEYS[4]: bucket registry zset
    ///
    /// # Arguments
    /// - ARGV[1]: encoded key (index member)
    /// - ARGV[2]: upload delta
    /// - ARGV[3]: download delta
    /// - ARGV[4]: TTL in seconds
    /// - ARGV[5]: bucket score
    /// - ARGV[6]: bucket label
    ///
    /// # Returns
    /// - 1
    pub fn increment(&self) -> Arc<Script> {
        self.get_or_create(
            "increment",
            r#"
            local record = KEYS[1]
            local bucket_index = KEYS[2]
            local active_index = KEYS[3]
            local registry = KEYS[4]
            local member = ARGV[1]
            local ttl = ARGV[4]

            if ARGV[2] ~= '0' then
                redis.call('HINCRBY', record, 'u', ARGV[2])
            end
            if ARGV[3] ~= '0' then
                redis.call('HINCRBY', record, 'd', ARGV[3])
            end
            redis.call('EXPIRE', record, ttl)

            redis.call('SADD', bucket_index, member)
            redis.call('EXPIRE', bucket_index, ttl)

            redis.call('SADD', active_index, member)
            redis.call('EXPIRE', active_index, ttl)

            redis.call('ZADD', registry, ARGV[5], ARGV[6])
            redis.call('EXPIRE', registry, ttl)

            return 1
            "#,
        )
    }

    /// Write flushed markers; settle the key if nothing new arrived
    ///
    /// # Keys
    /// - KEYS[1]: record hash
    /// - KEYS[2]: active index set
    ///
    /// # Arguments
    /// - ARGV[1]: encoded key
    /// - ARGV[2]: expected upload (value observed before the flush)
    /// - ARGV[3]: expected download
    /// - ARGV[4]: new flushed upload marker
    /// - ARGV[5]: new flushed download marker
    ///
    /// # Returns
    /// - 1 if settled and removed from the active index
    /// - 0 if the counters moved since the observation (key stays active)
    /// - -1 if the record no longer exists
    pub fn compare_and_commit(&self) -> Arc<Script> {
        self.get_or_create(
            "compare_and_commit",
            r#"
            local record = KEYS[1]
            local active_index = KEYS[2]
            local member = ARGV[1]

            if redis.call('EXISTS', record) == 0 then
                redis.call('SREM', active_index, member)
                return -1
            end

            redis.call('HSET', record, 'fu', ARGV[4], 'fd', ARGV[5])

            local current = redis.call('HMGET', record, 'u', 'd')
            local upload = current[1] or '0'
            local download = current[2] or '0'

            if upload == ARGV[2] and download == ARGV[3] then
                redis.call('SREM', active_index, member)
                return 1
            end

            return 0
            "#,
        )
    }

    /// Remove a key from the active index if its counters equal its markers
    ///
    /// # Keys
    /// - KEYS[1]: record hash
    /// - KEYS[2]: active index set
    /// - KEYS[3]: bucket index set
    ///
    /// # Arguments
    /// - ARGV[1]: encoded key
    /// - ARGV[2]: '1' to also delete the settled record
    ///
    /// # Returns
    /// - 1 if removed (or the record was already gone)
    /// - 0 if unflushed data is present
    pub fn remove_if_settled(&self) -> Arc<Script> {
        self.get_or_create(
            "remove_if_settled",
            r#"
            local record = KEYS[1]
            local active_index = KEYS[2]
            local bucket_index = KEYS[3]
            local member = ARGV[1]

            if redis.call('EXISTS', record) == 0 then
                redis.call('SREM', active_index, member)
                return 1
            end

            local v = redis.call('HMGET', record, 'u', 'd', 'fu', 'fd')
            if (v[1] or '0') == (v[3] or '0') and (v[2] or '0') == (v[4] or '0') then
                redis.call('SREM', active_index, member)
                if ARGV[2] == '1' then
                    redis.call('DEL', record)
                    redis.call('SREM', bucket_index, member)
                end
                return 1
            end

            return 0
            "#,
        )
    }

    /// Read every record of a bucket, optionally deleting them in the same step
    ///
    /// # Keys
    /// - KEYS[1]: bucket index set
    /// - KEYS[2]: active index set
    /// - KEYS[3]: bucket registry zset
    ///
    /// # Arguments
    /// - ARGV[1]: record key prefix ({prefix}:rec:)
    /// - ARGV[2]: bucket label
    /// - ARGV[3]: '1' to delete records and indexes
    ///
    /// # Returns
    /// - Flat array of [key, u, d, fu, fd] quintuples
    pub fn collect_bucket(&self) -> Arc<Script> {
        self.get_or_create(
            "collect_bucket",
            r#"
            local bucket_index = KEYS[1]
            local active_index = KEYS[2]
            local registry = KEYS[3]
            local record_prefix = ARGV[1]
            local delete = ARGV[3] == '1'

            local members = redis.call('SMEMBERS', bucket_index)
            local out = {}

            for _, member in ipairs(members) do
                local record = record_prefix .. member
                local v = redis.call('HMGET', record, 'u', 'd', 'fu', 'fd')
                if v[1] or v[2] then
                    table.insert(out, member)
                    table.insert(out, v[1] or '0')
                    table.insert(out, v[2] or '0')
                    table.insert(out, v[3] or '0')
                    table.insert(out, v[4] or '0')
                end
                if delete then
                    redis.call('DEL', record)
                    redis.call('SREM', active_index, member)
                end
            end

            if delete then
                redis.call('DEL', bucket_index)
                redis.call('ZREM', registry, ARGV[2])
            end

            return out
            "#,
        )
    }

    /// Delete every record of a bucket together with its index
    ///
    /// # Keys
    /// - KEYS[1]: bucket index set
    /// - KEYS[2]: active index set
    /// - KEYS[3]: bucket registry zset
    ///
    /// # Arguments
    /// - ARGV[1]: record key prefix
    /// - ARGV[2]: bucket label
    ///
    /// # Returns
    /// - Number of records deleted
    pub fn cleanup_bucket(&self) -> Arc<Script> {
        self.get_or_create(
            "cleanup_bucket",
            r#"
            local bucket_index = KEYS[1]
            local active_index = KEYS[2]
            local registry = KEYS[3]
            local record_prefix = ARGV[1]

            local members = redis.call('SMEMBERS', bucket_index)
            local removed = 0

            for _, member in ipairs(members) do
                removed = removed + redis.call('DEL', record_prefix .. member)
                redis.call('SREM', active_index, member)
            end

            redis.call('DEL', bucket_index)
            redis.call('ZREM', registry, ARGV[2])

            return removed
            "#,
        )
    }

    /// Seed a record from a durable baseline without clobbering increments
    ///
    /// Each direction is seeded only if its flushed marker is absent. Seeding
    /// sets the marker to the baseline and adds the baseline to the counter, so
    /// increments that raced ahead of the seed remain unflushed deltas.
    ///
    /// # Keys
    /// - KEYS[1]: record hash
    /// - KEYS[2]: bucket index set
    /// - KEYS[3]: bucket registry zset
    ///
    /// # Arguments
    /// - ARGV[1]: encoded key
    /// - ARGV[2]: baseline upload
    /// - ARGV[3]: baseline download
    /// - ARGV[4]: TTL in seconds
    /// - ARGV[5]: bucket score
    /// - ARGV[6]: bucket label
    ///
    /// # Returns
    /// - Number of directions seeded (0, 1 or 2)
    pub fn init_baseline(&self) -> Arc<Script> {
        self.get_or_create(
            "init_baseline",
            r#"
            local record = KEYS[1]
            local bucket_index = KEYS[2]
            local registry = KEYS[3]
            local member = ARGV[1]
            local ttl = ARGV[4]
            local seeded = 0

            if redis.call('HSETNX', record, 'fu', ARGV[2]) == 1 then
                redis.call('HINCRBY', record, 'u', ARGV[2])
                seeded = seeded + 1
            end
            if redis.call('HSETNX', record, 'fd', ARGV[3]) == 1 then
                redis.call('HINCRBY', record, 'd', ARGV[3])
                seeded = seeded + 1
            end

            redis.call('EXPIRE', record, ttl)
            redis.call('SADD', bucket_index, member)
            redis.call('EXPIRE', bucket_index, ttl)
            redis.call('ZADD', registry, ARGV[5], ARGV[6])
            redis.call('EXPIRE', registry, ttl)

            return seeded
            "#,
        )
    }

    /// Delete one key from the record store and both indexes
    ///
    /// # Keys
    /// - KEYS[1]: record hash
    /// - KEYS[2]: active index set
    /// - KEYS[3]: bucket index set
    ///
    /// # Arguments
    /// - ARGV[1]: encoded key
    ///
    /// # Returns
    /// - 1 if a record was deleted, 0 otherwise
    pub fn cleanup_resource(&self) -> Arc<Script> {
        self.get_or_create(
            "cleanup_resource",
            r#"
            local member = ARGV[1]
            redis.call('SREM', KEYS[2], member)
            redis.call('SREM', KEYS[3], member)
            return redis.call('DEL', KEYS[1])
            "#,
        )
    }

    /// Read a side-cache hash field and replace it only if it still holds
    /// the expected value
    ///
    /// # Keys
    /// - KEYS[1]: hash key
    ///
    /// # Arguments
    /// - ARGV[1]: field
    /// - ARGV[2]: expected value, or '' for "field absent"
    /// - ARGV[3]: new value
    /// - ARGV[4]: TTL in seconds
    ///
    /// # Returns
    /// - 1 if swapped, 0 otherwise
    pub fn compare_and_set_field(&self) -> Arc<Script> {
        self.get_or_create(
            "compare_and_set_field",
            r#"
            local current = redis.call('HGET', KEYS[1], ARGV[1])
            if (current or '') ~= ARGV[2] then
                return 0
            end
            redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
            redis.call('EXPIRE', KEYS[1], ARGV[4])
            return 1
            "#,
        )
    }

    /// Add to a side-cache hash field and refresh the key TTL
    ///
    /// # Keys
    /// - KEYS[1]: hash key
    ///
    /// # Arguments
    /// - ARGV[1]: field
    /// - ARGV[2]: delta
    /// - ARGV[3]: TTL in seconds
    ///
    /// # Returns
    /// - New field value
    pub fn incr_field(&self) -> Arc<Script> {
        self.get_or_create(
            "incr_field",
            r#"
            local value = redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
            redis.call('EXPIRE', KEYS[1], ARGV[3])
            return value
            "#,
        )
    }

    /// Set a side-cache hash field only if absent, refreshing the TTL
    ///
    /// # Keys
    /// - KEYS[1]: hash key
    ///
    /// # Arguments
    /// - ARGV[1]: field
    /// - ARGV[2]: value
    /// - ARGV[3]: TTL in seconds
    ///
    /// # Returns
    /// - 1 if the field was set, 0 if it already existed
    pub fn set_field_if_absent(&self) -> Arc<Script> {
        self.get_or_create(
            "set_field_if_absent",
            r#"
            local set = redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2])
            redis.call('EXPIRE', KEYS[1], ARGV[3])
            return set
            "#,
        )
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}
