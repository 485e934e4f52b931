//! Flush service
//!
//! Runs a compaction cycle every `compaction.interval_secs` and, when
//! `compaction.trim_expired_buckets` is set, drains hot buckets that fell out
//! of the retention window. The shutdown token reaches the running cycle,
//! which stops between keys, so no key is left with a cold write but no
//! marker commit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::framework::{RestartPolicy, Service, ServiceError, ServiceStatus};
use crate::compaction::Compactor;
use crate::config::CompactionConfig;
use crate::error::{LedgerError, Result};
use crate::hot::HotStore;
use crate::metrics;

/// Background compaction driver
pub struct FlushService {
    compactor: Arc<Compactor>,
    hot: Arc<dyn HotStore>,
    config: CompactionConfig,
    status: RwLock<ServiceStatus>,
    cycles: AtomicU64,
    buckets_drained: AtomicU64,
}

impl FlushService {
    /// Create a service driving `compactor`
    pub fn new(
        compactor: Arc<Compactor>,
        hot: Arc<dyn HotStore>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            compactor,
            hot,
            config,
            status: RwLock::new(ServiceStatus::Stopped),
            cycles: AtomicU64::new(0),
            buckets_drained: AtomicU64::new(0),
        }
    }

    /// Cycles run since creation
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Expired buckets drained since creation
    pub fn buckets_drained(&self) -> u64 {
        self.buckets_drained.load(Ordering::Relaxed)
    }

    /// One compaction cycle followed by the expired-bucket trim
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let report = self.compactor.run_cycle(cancel).await?;
        if report.cancelled || !self.config.trim_expired_buckets {
            return Ok(());
        }

        let boundary = self.compactor.hot_boundary();
        let expired: Vec<_> = self
            .hot
            .active_buckets()
            .await?
            .into_iter()
            .filter(|bucket| *bucket < boundary)
            .collect();

        for bucket in expired {
            if cancel.is_cancelled() {
                break;
            }
            self.compactor.drain_bucket(bucket).await?;
            self.buckets_drained.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn tick(&self, cancel: &CancellationToken) {
        match self.run_once(cancel).await {
            Ok(()) => {},
            Err(LedgerError::Cancelled) => tracing::debug!("Flush cycle skipped, shutting down"),
            Err(e) => {
                metrics::record_error("flush_cycle", "flush_service");
                tracing::error!(error = %e, "Flush cycle failed");
            },
        }
    }
}

#[async_trait::async_trait]
impl Service for FlushService {
    async fn start(&self, shutdown: CancellationToken) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;

        if !self.config.enabled {
            tracing::info!("Compaction disabled, flush service idle");
            shutdown.cancelled().await;
            *self.status.write() = ServiceStatus::Stopped;
            return Ok(());
        }

        tracing::info!(
            interval_secs = self.config.interval_secs,
            trim_expired = self.config.trim_expired_buckets,
            "Flush service started"
        );

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = ticker.tick() => {
                    self.tick(&shutdown).await;
                    if shutdown.is_cancelled() {
                        *self.status.write() = ServiceStatus::Stopping;
                        break;
                    }
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::info!(cycles = self.cycles(), "Flush service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "flush"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::OnFailure {
            max_retries: 3,
            backoff: Duration::from_secs(30),
        }
    }
}
