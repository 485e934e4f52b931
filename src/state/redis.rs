//! Redis state store

use super::StateStore;
use crate::error::{LedgerError, Result, Tier};
use crate::redis::{LuaScripts, RedisPool};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Redis-backed [`StateStore`]
///
/// Shares the pool with the hot tier; failures are reported against the
/// state tier so callers can tell a broken cache from a broken ledger.
pub struct RedisStateStore {
    pool: Arc<RedisPool>,
    scripts: Arc<LuaScripts>,
}

impl RedisStateStore {
    /// Create a store over an existing pool
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self {
            pool,
            scripts: Arc::new(LuaScripts::new()),
        }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Re-attribute pool failures to the state tier
fn state_error(e: LedgerError) -> LedgerError {
    match e {
        LedgerError::TierUnavailable {
            tier: Tier::Hot,
            message,
        } => LedgerError::state_unavailable(message),
        other => other,
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn incr_field(&self, key: &str, field: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let script = self.scripts.incr_field();
        let ttl = ttl_secs(ttl);
        self.pool
            .execute_once(|mut conn| {
                let script = script.clone();
                async move {
                    script
                        .key(key)
                        .arg(field)
                        .arg(delta)
                        .arg(ttl)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await
            .map_err(state_error)
    }

    async fn set_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let script = self.scripts.set_field_if_absent();
        let ttl = ttl_secs(ttl);
        let set: i64 = self
            .pool
            .execute_once(|mut conn| {
                let script = script.clone();
                async move {
                    script
                        .key(key)
                        .arg(field)
                        .arg(value)
                        .arg(ttl)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await
            .map_err(state_error)?;
        Ok(set == 1)
    }

    async fn compare_and_set_field(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let script = self.scripts.compare_and_set_field();
        let expected = expected.unwrap_or("");
        let ttl = ttl_secs(ttl);
        let swapped: i64 = self
            .pool
            .execute_once(|mut conn| {
                let script = script.clone();
                async move {
                    script
                        .key(key)
                        .arg(field)
                        .arg(expected)
                        .arg(value)
                        .arg(ttl)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await
            .map_err(state_error)?;
        Ok(swapped == 1)
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.pool
            .execute(|mut conn| async move {
                redis::cmd("HGETALL").arg(key).query_async(&mut conn).await
            })
            .await
            .map_err(state_error)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let deleted: i64 = self
            .pool
            .execute(|mut conn| async move {
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await
            .map_err(state_error)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_attributed_to_state_tier() {
        let mapped = state_error(LedgerError::hot_unavailable("connection refused"));
        assert!(matches!(
            mapped,
            LedgerError::TierUnavailable {
                tier: Tier::State,
                ..
            }
        ));

        let untouched = state_error(LedgerError::Serialization("bad".into()));
        assert!(matches!(untouched, LedgerError::Serialization(_)));
    }
}
