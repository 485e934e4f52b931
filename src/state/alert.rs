//! Quota alert levels
//!
//! Each subscription remembers the highest usage threshold it has already
//! been alerted for, stored as `{prefix}:alert:{subscription_id}` field
//! `level`. Raising the level is a compare-and-set from the level that was
//! read, so concurrent evaluators agree on exactly one winner per threshold
//! and each threshold fires once per cycle.

use super::quota::QuotaStatus;
use super::StateStore;
use crate::error::{LedgerError, Result};
use crate::types::TrafficSummary;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const FIELD_LEVEL: &str = "level";

/// A usage threshold, in percent of the allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlertLevel(pub u8);

impl AlertLevel {
    /// Threshold percentage
    pub fn percent(&self) -> u8 {
        self.0
    }

    /// Whether this level means the allowance is used up
    pub fn is_exhausted(&self) -> bool {
        self.0 >= 100
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// An alert raised by crossing a threshold
///
/// Delivery is up to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaAlert {
    /// Subscription that crossed the threshold
    pub subscription_id: u64,
    /// Newly reached level
    pub level: AlertLevel,
    /// Level alerted before this one, if any
    pub previous: Option<AlertLevel>,
    /// Usage at evaluation time
    pub used: TrafficSummary,
    /// Allowance at evaluation time
    pub limit: u64,
}

/// Tracks which threshold each subscription was last alerted for
pub struct AlertStateManager {
    store: Arc<dyn StateStore>,
    prefix: String,
    thresholds: Vec<AlertLevel>,
    ttl: Duration,
}

impl AlertStateManager {
    /// Create a manager; `thresholds` are percentages and must be strictly
    /// ascending and non-empty
    pub fn new(
        store: Arc<dyn StateStore>,
        prefix: impl Into<String>,
        thresholds: &[u8],
        ttl: Duration,
    ) -> Result<Self> {
        if thresholds.is_empty() || !thresholds.windows(2).all(|w| w[0] < w[1]) {
            return Err(LedgerError::Configuration(format!(
                "alert thresholds must be non-empty and strictly ascending: {:?}",
                thresholds
            )));
        }

        Ok(Self {
            store,
            prefix: prefix.into(),
            thresholds: thresholds.iter().copied().map(AlertLevel).collect(),
            ttl,
        })
    }

    fn key(&self, subscription_id: u64) -> String {
        format!("{}:alert:{}", self.prefix, subscription_id)
    }

    /// Highest configured threshold at or below `percent`
    fn level_for(&self, percent: u64) -> Option<AlertLevel> {
        self.thresholds
            .iter()
            .rev()
            .find(|level| u64::from(level.0) <= percent)
            .copied()
    }

    /// Level last alerted for a subscription
    pub async fn current_level(&self, subscription_id: u64) -> Result<Option<AlertLevel>> {
        let fields = self.store.get_all(&self.key(subscription_id)).await?;
        fields
            .get(FIELD_LEVEL)
            .map(|raw| {
                raw.parse::<u8>().map(AlertLevel).map_err(|_| {
                    LedgerError::Serialization(format!("alert level {:?}", raw))
                })
            })
            .transpose()
    }

    /// Raise an alert if `status` crossed a threshold not yet alerted
    ///
    /// Returns `None` when there is no finite limit, no threshold is reached,
    /// the reached level was already alerted, or a concurrent evaluator won
    /// the transition.
    pub async fn evaluate(
        &self,
        subscription_id: u64,
        status: &QuotaStatus,
    ) -> Result<Option<QuotaAlert>> {
        let (Some(limit), Some(percent)) = (status.limit, status.percent_used()) else {
            return Ok(None);
        };
        let Some(level) = self.level_for(percent) else {
            return Ok(None);
        };

        let previous = self.current_level(subscription_id).await?;
        if previous.is_some_and(|p| p >= level) {
            return Ok(None);
        }

        let expected = previous.map(|p| p.0.to_string());
        let swapped = self
            .store
            .compare_and_set_field(
                &self.key(subscription_id),
                FIELD_LEVEL,
                expected.as_deref(),
                &level.0.to_string(),
                self.ttl,
            )
            .await?;

        if !swapped {
            debug!(subscription_id, level = %level, "Alert level raced, skipping");
            return Ok(None);
        }

        info!(
            subscription_id,
            level = %level,
            used = status.used.total(),
            limit,
            "Quota threshold crossed"
        );
        Ok(Some(QuotaAlert {
            subscription_id,
            level,
            previous,
            used: status.used,
            limit,
        }))
    }

    /// Forget the alerted level, e.g. after the allowance is renewed
    pub async fn reset(&self, subscription_id: u64) -> Result<bool> {
        self.store.delete(&self.key(subscription_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::state::MemoryStateStore;
    use chrono::{TimeZone, Utc};

    fn manager() -> AlertStateManager {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        AlertStateManager::new(
            Arc::new(MemoryStateStore::new(clock)),
            "traffic",
            &[80, 90, 100],
            Duration::from_secs(3_600),
        )
        .unwrap()
    }

    fn status(used: u64) -> QuotaStatus {
        QuotaStatus {
            limit: Some(1_000),
            used: TrafficSummary::new(used, 0),
        }
    }

    #[test]
    fn test_rejects_unsorted_thresholds() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStateStore::new(clock));
        let ttl = Duration::from_secs(1);
        assert!(AlertStateManager::new(store.clone(), "t", &[90, 80], ttl).is_err());
        assert!(AlertStateManager::new(store.clone(), "t", &[80, 80], ttl).is_err());
        assert!(AlertStateManager::new(store, "t", &[], ttl).is_err());
    }

    #[tokio::test]
    async fn test_each_level_fires_once() {
        let alerts = manager();

        assert!(alerts.evaluate(1, &status(500)).await.unwrap().is_none());

        let first = alerts.evaluate(1, &status(820)).await.unwrap().unwrap();
        assert_eq!(first.level, AlertLevel(80));
        assert_eq!(first.previous, None);
        assert!(alerts.evaluate(1, &status(850)).await.unwrap().is_none());

        // Jumping past 90 straight to 100 raises only the highest level
        let second = alerts.evaluate(1, &status(1_200)).await.unwrap().unwrap();
        assert_eq!(second.level, AlertLevel(100));
        assert_eq!(second.previous, Some(AlertLevel(80)));
        assert!(second.level.is_exhausted());
        assert!(alerts.evaluate(1, &status(1_300)).await.unwrap().is_none());

        assert!(alerts.reset(1).await.unwrap());
        assert_eq!(alerts.current_level(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_evaluators_agree() {
        let alerts = Arc::new(manager());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alerts = alerts.clone();
            handles.push(tokio::spawn(async move {
                alerts.evaluate(9, &status(910)).await.unwrap()
            }));
        }

        let mut fired = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(alerts.current_level(9).await.unwrap(), Some(AlertLevel(90)));
    }

    #[tokio::test]
    async fn test_unlimited_never_alerts() {
        let alerts = manager();
        let unlimited = QuotaStatus {
            limit: None,
            used: TrafficSummary::new(u64::MAX, u64::MAX),
        };
        assert!(alerts.evaluate(2, &unlimited).await.unwrap().is_none());
    }
}
