//! Subscription quota cache
//!
//! One hash per subscription:
//!
//! ```text
//! {prefix}:quota:{subscription_id}
//!     limit   -> byte allowance for the current cycle (absent = unlimited)
//!     used_u  -> uploaded bytes counted so far
//!     used_d  -> downloaded bytes counted so far
//! ```
//!
//! Seeding from the system of record uses per-field set-if-absent, the same
//! rule as hot-tier baselines: usage recorded before the seed lands is kept
//! and the seed only fills what is missing.

use super::StateStore;
use crate::error::{LedgerError, Result};
use crate::hot::redis_int;
use crate::types::TrafficSummary;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const FIELD_LIMIT: &str = "limit";
const FIELD_USED_UPLOAD: &str = "used_u";
const FIELD_USED_DOWNLOAD: &str = "used_d";

/// Usage of one subscription against its allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    /// Byte allowance, `None` when unlimited or not yet seeded
    pub limit: Option<u64>,
    /// Traffic counted against the allowance
    pub used: TrafficSummary,
}

impl QuotaStatus {
    /// Fraction of the allowance used; `None` when there is no finite limit
    pub fn ratio(&self) -> Option<f64> {
        match self.limit {
            Some(limit) if limit > 0 => Some(self.used.total() as f64 / limit as f64),
            _ => None,
        }
    }

    /// Whole percent of the allowance used, saturating
    pub fn percent_used(&self) -> Option<u64> {
        let limit = self.limit.filter(|l| *l > 0)?;
        let percent = (self.used.total() as u128 * 100) / limit as u128;
        Some(percent.min(u64::MAX as u128) as u64)
    }

    /// Whether usage reached the allowance
    pub fn exceeded(&self) -> bool {
        self.limit.is_some_and(|limit| self.used.total() >= limit)
    }

    /// Remaining bytes, zero once exceeded
    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|limit| limit.saturating_sub(self.used.total()))
    }
}

/// Per-subscription quota counters over a [`StateStore`]
pub struct SubscriptionQuotaCache {
    store: Arc<dyn StateStore>,
    prefix: String,
    ttl: Duration,
}

impl SubscriptionQuotaCache {
    /// Create a cache writing under `{prefix}:quota:`
    pub fn new(store: Arc<dyn StateStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
        }
    }

    fn key(&self, subscription_id: u64) -> String {
        format!("{}:quota:{}", self.prefix, subscription_id)
    }

    /// Seed limit and usage for a subscription, field by field
    ///
    /// Fields already present are left alone. Returns whether anything was
    /// written.
    pub async fn prime(
        &self,
        subscription_id: u64,
        limit: Option<u64>,
        used: TrafficSummary,
    ) -> Result<bool> {
        let key = self.key(subscription_id);
        let mut seeded = false;

        if let Some(limit) = limit {
            let limit = redis_int(limit).to_string();
            seeded |= self
                .store
                .set_field_if_absent(&key, FIELD_LIMIT, &limit, self.ttl)
                .await?;
        }
        for (field, bytes) in [
            (FIELD_USED_UPLOAD, used.upload),
            (FIELD_USED_DOWNLOAD, used.download),
        ] {
            seeded |= self
                .store
                .set_field_if_absent(&key, field, &redis_int(bytes).to_string(), self.ttl)
                .await?;
        }

        debug!(subscription_id, seeded, "Primed quota cache");
        Ok(seeded)
    }

    /// Count traffic against a subscription and return its new status
    pub async fn record_usage(
        &self,
        subscription_id: u64,
        traffic: TrafficSummary,
    ) -> Result<QuotaStatus> {
        let key = self.key(subscription_id);

        for (field, bytes) in [
            (FIELD_USED_UPLOAD, traffic.upload),
            (FIELD_USED_DOWNLOAD, traffic.download),
        ] {
            if bytes > 0 {
                self.store
                    .incr_field(&key, field, redis_int(bytes), self.ttl)
                    .await?;
            }
        }

        let fields = self.store.get_all(&key).await?;
        status_from_fields(&fields)
    }

    /// Current status, `None` when the subscription has no entry
    pub async fn status(&self, subscription_id: u64) -> Result<Option<QuotaStatus>> {
        let fields = self.store.get_all(&self.key(subscription_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        status_from_fields(&fields).map(Some)
    }

    /// Drop a subscription's entry, e.g. at the start of a new billing cycle
    pub async fn reset(&self, subscription_id: u64) -> Result<bool> {
        self.store.delete(&self.key(subscription_id)).await
    }
}

fn status_from_fields(fields: &HashMap<String, String>) -> Result<QuotaStatus> {
    Ok(QuotaStatus {
        limit: parse_field(fields, FIELD_LIMIT)?,
        used: TrafficSummary::new(
            parse_field(fields, FIELD_USED_UPLOAD)?.unwrap_or(0),
            parse_field(fields, FIELD_USED_DOWNLOAD)?.unwrap_or(0),
        ),
    })
}

fn parse_field(fields: &HashMap<String, String>, name: &str) -> Result<Option<u64>> {
    fields
        .get(name)
        .map(|raw| {
            raw.parse::<i64>()
                .map(|v| v.max(0) as u64)
                .map_err(|_| {
                    LedgerError::Serialization(format!("quota field {} = {:?}", name, raw))
                })
        })
        .transpose()
}
