//! Quota and alert side caches
//!
//! Small keyed caches that reuse the hot tier's idioms: hashes with a TTL
//! refreshed on every write, per-field set-if-absent seeding, and
//! compare-and-set transitions. [`StateStore`] is the primitive surface; the
//! caches built on it are [`SubscriptionQuotaCache`] and
//! [`AlertStateManager`].

pub mod alert;
pub mod memory;
pub mod quota;
pub mod redis;

pub use self::alert::{AlertLevel, AlertStateManager, QuotaAlert};
pub use self::memory::MemoryStateStore;
pub use self::quota::{QuotaStatus, SubscriptionQuotaCache};
pub use self::redis::RedisStateStore;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Hash-of-fields store with per-key TTL
///
/// Every mutating call refreshes the key's TTL and is atomic on its own.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Add `delta` to an integer field, returning the new value
    async fn incr_field(&self, key: &str, field: &str, delta: i64, ttl: Duration) -> Result<i64>;

    /// Set a field only if it is absent; returns whether it was set
    async fn set_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Replace a field only if it still holds `expected` (`None` = absent)
    async fn compare_and_set_field(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// All fields of a key; empty when absent or expired
    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Delete a key; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}
