//! In-memory state store with clock-driven TTL

use super::StateStore;
use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Entry {
    fields: HashMap<String, String>,
    expires_at: DateTime<Utc>,
}

/// In-memory [`StateStore`]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStateStore {
    /// Create a store whose TTLs expire against `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Run `f` on the live entry for `key`, creating it if needed, and
    /// refresh its TTL
    fn with_entry<T>(&self, key: &str, ttl: Duration, f: impl FnOnce(&mut Entry) -> T) -> T {
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let mut entries = self.entries.lock();

        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            fields: HashMap::new(),
            expires_at,
        });
        let result = f(entry);
        entry.expires_at = expires_at;
        result
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn incr_field(&self, key: &str, field: &str, delta: i64, ttl: Duration) -> Result<i64> {
        self.with_entry(key, ttl, |entry| -> Result<i64> {
            let current = match entry.fields.get(field) {
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    LedgerError::Serialization(format!("field {} is not an integer", field))
                })?,
                None => 0,
            };
            let next = current.saturating_add(delta);
            entry.fields.insert(field.to_string(), next.to_string());
            Ok(next)
        })
    }

    async fn set_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        Ok(self.with_entry(key, ttl, |entry| {
            if entry.fields.contains_key(field) {
                return false;
            }
            entry.fields.insert(field.to_string(), value.to_string());
            true
        }))
    }

    async fn compare_and_set_field(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        Ok(self.with_entry(key, ttl, |entry| {
            if entry.fields.get(field).map(String::as_str) != expected {
                return false;
            }
            entry.fields.insert(field.to_string(), value.to_string());
            true
        }))
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.fields.clone())
            .unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|e| e.expires_at > now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn store() -> (Arc<ManualClock>, MemoryStateStore) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        (clock.clone(), MemoryStateStore::new(clock))
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_incr_and_expire() {
        let (clock, store) = store();
        assert_eq!(store.incr_field("q", "u", 5, TTL).await.unwrap(), 5);
        assert_eq!(store.incr_field("q", "u", 7, TTL).await.unwrap(), 12);

        clock.advance(chrono::Duration::seconds(61));
        assert!(store.get_all("q").await.unwrap().is_empty());
        assert_eq!(store.incr_field("q", "u", 1, TTL).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let (_clock, store) = store();
        assert!(store.set_field_if_absent("q", "limit", "10", TTL).await.unwrap());
        assert!(!store.set_field_if_absent("q", "limit", "20", TTL).await.unwrap());
        assert_eq!(store.get_all("q").await.unwrap()["limit"], "10");
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let (_clock, store) = store();
        assert!(store
            .compare_and_set_field("a", "level", None, "80", TTL)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_field("a", "level", None, "90", TTL)
            .await
            .unwrap());
        assert!(store
            .compare_and_set_field("a", "level", Some("80"), "90", TTL)
            .await
            .unwrap());
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
    }
}
