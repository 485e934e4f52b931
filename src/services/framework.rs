//! Service framework
//!
//! Background work implements [`Service`]. A [`ServiceManager`] spawns every
//! registered service with a shared shutdown token, cancels the token on
//! [`ServiceManager::shutdown`] and joins the tasks within a deadline. Failed
//! services are restarted on request according to their [`RestartPolicy`].
//!
//! A manager runs once: after shutdown its token stays cancelled.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long [`ServiceManager::start_service`] waits for `Running`
const STARTUP_GRACE: Duration = Duration::from_millis(100);

/// A background task driven by the [`ServiceManager`]
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until `shutdown` is cancelled or the service fails
    async fn start(&self, shutdown: CancellationToken) -> Result<(), ServiceError>;

    /// Unique name used for registration and logs
    fn name(&self) -> &'static str;

    /// Current lifecycle state
    fn status(&self) -> ServiceStatus;

    /// What to do after a failure
    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::OnFailure {
            max_retries: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Lifecycle state of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Spawned, not yet running
    Starting,
    /// Running normally
    Running,
    /// Finishing in-flight work after shutdown was requested
    Stopping,
    /// Stopped cleanly
    Stopped,
    /// Stopped with an error
    Failed(String),
}

impl ServiceStatus {
    /// Running normally
    pub fn is_healthy(&self) -> bool {
        *self == ServiceStatus::Running
    }

    /// Not running, cleanly or not
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed(_))
    }
}

/// Restart behaviour for failed services
#[derive(Debug, Clone)]
pub enum RestartPolicy {
    /// Leave failed services stopped
    Never,
    /// Restart after a fixed delay, without limit
    Always {
        /// Delay before each restart
        backoff: Duration,
    },
    /// Restart a bounded number of times with linearly growing delay
    OnFailure {
        /// Restarts allowed
        max_retries: u32,
        /// Delay before the first restart
        backoff: Duration,
    },
}

impl RestartPolicy {
    /// Delay before the next restart, `None` when no restart is allowed
    pub fn next_delay(&self, restarts_so_far: u32) -> Option<Duration> {
        match *self {
            RestartPolicy::Never => None,
            RestartPolicy::Always { backoff } => Some(backoff),
            RestartPolicy::OnFailure {
                max_retries,
                backoff,
            } => (restarts_so_far < max_retries).then(|| backoff * (restarts_so_far + 1)),
        }
    }
}

/// Service framework errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The service's main loop failed
    #[error("service failed: {0}")]
    Runtime(String),

    /// Another service already uses this name
    #[error("service {0} is already registered")]
    Duplicate(&'static str),

    /// [`ServiceManager::start_all`] was called twice
    #[error("services were already started")]
    AlreadyStarted,

    /// No service with this name
    #[error("no service named {0}")]
    Unknown(String),
}

/// Manager settings
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deadline for all services to stop after shutdown is requested
    pub shutdown_timeout: Duration,
    /// Whether [`ServiceManager::restart_failed`] does anything
    pub auto_restart: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            auto_restart: true,
        }
    }
}

type ServiceTask = JoinHandle<Result<(), ServiceError>>;

struct Slot {
    service: Arc<dyn Service>,
    task: Option<ServiceTask>,
    restarts: u32,
    started_at: Option<Instant>,
}

/// Owns the background services of a process
pub struct ServiceManager {
    config: ServiceConfig,
    slots: Mutex<BTreeMap<&'static str, Slot>>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    started: AtomicBool,
}

impl ServiceManager {
    /// Create a manager
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Create a manager with default settings
    pub fn with_defaults() -> Self {
        Self::new(ServiceConfig::default())
    }

    /// Add a service; names must be unique
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut slots = self.slots.lock();
        if slots.contains_key(name) {
            return Err(ServiceError::Duplicate(name));
        }
        slots.insert(
            name,
            Slot {
                service,
                task: None,
                restarts: 0,
                started_at: None,
            },
        );
        debug!(service = name, "Service registered");
        Ok(())
    }

    /// Spawn every registered service, in name order
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyStarted);
        }

        let names: Vec<&'static str> = self.slots.lock().keys().copied().collect();
        for name in &names {
            self.start_service(name).await?;
        }
        info!(services = names.len(), "Services started");
        Ok(())
    }

    /// Spawn one service and wait briefly for it to report `Running`
    pub async fn start_service(&self, name: &str) -> Result<(), ServiceError> {
        let service = {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(name)
                .ok_or_else(|| ServiceError::Unknown(name.to_string()))?;

            let service = slot.service.clone();
            let token = self.shutdown.child_token();
            let spawned = service.clone();
            slot.task = Some(tokio::spawn(async move { spawned.start(token).await }));
            slot.started_at = Some(Instant::now());
            service
        };

        let deadline = Instant::now() + STARTUP_GRACE;
        while !service.status().is_healthy() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        debug!(service = name, status = ?service.status(), "Service spawned");
        Ok(())
    }

    /// Cancel the shutdown token and join every service before the deadline
    ///
    /// Services still running at the deadline are left detached.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Shutting down services");
        self.shutdown.cancel();

        let tasks: Vec<(&'static str, ServiceTask)> = self
            .slots
            .lock()
            .iter_mut()
            .filter_map(|(name, slot)| slot.task.take().map(|task| (*name, task)))
            .collect();
        let names: Vec<&'static str> = tasks.iter().map(|(name, _)| *name).collect();
        let joined = join_all(tasks.into_iter().map(|(_, task)| task));

        match tokio::time::timeout(self.config.shutdown_timeout, joined).await {
            Ok(results) => {
                for (name, result) in names.into_iter().zip(results) {
                    match result {
                        Ok(Ok(())) => debug!(service = name, "Service stopped"),
                        Ok(Err(e)) => {
                            warn!(service = name, error = %e, "Service stopped with error")
                        },
                        Err(e) => error!(service = name, error = %e, "Service task panicked"),
                    }
                }
            },
            Err(_) => warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Services did not stop before the shutdown deadline"
            ),
        }

        self.stopped.cancel();
        info!("Shutdown complete");
        Ok(())
    }

    /// Resolve once [`shutdown`](Self::shutdown) has finished
    pub async fn wait_for_shutdown(&self) {
        self.stopped.cancelled().await;
    }

    /// Status of every service
    pub fn status(&self) -> BTreeMap<&'static str, ServiceStatus> {
        self.slots
            .lock()
            .iter()
            .map(|(name, slot)| (*name, slot.service.status()))
            .collect()
    }

    /// Time since a service was last spawned
    pub fn service_uptime(&self, name: &str) -> Option<Duration> {
        self.slots
            .lock()
            .get(name)
            .and_then(|slot| slot.started_at)
            .map(|started| started.elapsed())
    }

    /// Whether every service is running
    pub fn is_healthy(&self) -> bool {
        self.slots
            .lock()
            .values()
            .all(|slot| slot.service.status().is_healthy())
    }

    /// Restart failed services their policy still allows; returns their names
    pub async fn restart_failed(&self) -> Vec<&'static str> {
        if !self.config.auto_restart || self.shutdown.is_cancelled() {
            return Vec::new();
        }

        let due: Vec<(&'static str, Option<Duration>)> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot.service.status(), ServiceStatus::Failed(_)))
            .map(|(name, slot)| {
                let delay = slot.service.restart_policy().next_delay(slot.restarts);
                (*name, delay)
            })
            .collect();

        let mut restarted = Vec::new();
        for (name, delay) in due {
            let Some(delay) = delay else {
                warn!(service = name, "Service failed and may not be restarted");
                continue;
            };
            tokio::time::sleep(delay).await;

            if let Some(slot) = self.slots.lock().get_mut(name) {
                slot.restarts += 1;
            }
            match self.start_service(name).await {
                Ok(()) => restarted.push(name),
                Err(e) => error!(service = name, error = %e, "Failed to restart service"),
            }
        }
        restarted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct IdleService {
        name: &'static str,
        fail: bool,
        status: Mutex<ServiceStatus>,
        runs: AtomicU32,
    }

    impl IdleService {
        fn new(name: &'static str, fail: bool) -> Self {
            Self {
                name,
                fail,
                status: Mutex::new(ServiceStatus::Stopped),
                runs: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Service for IdleService {
        async fn start(&self, shutdown: CancellationToken) -> Result<(), ServiceError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                *self.status.lock() = ServiceStatus::Failed("boom".to_string());
                return Err(ServiceError::Runtime("boom".to_string()));
            }

            *self.status.lock() = ServiceStatus::Running;
            shutdown.cancelled().await;
            *self.status.lock() = ServiceStatus::Stopped;
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.name
        }

        fn status(&self) -> ServiceStatus {
            self.status.lock().clone()
        }

        fn restart_policy(&self) -> RestartPolicy {
            RestartPolicy::OnFailure {
                max_retries: 1,
                backoff: Duration::from_millis(1),
            }
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let manager = ServiceManager::with_defaults();
        let service = Arc::new(IdleService::new("idle", false));
        manager.register(service.clone()).unwrap();

        manager.start_all().await.unwrap();
        assert!(manager.is_healthy());
        assert!(manager.service_uptime("idle").is_some());
        assert!(matches!(
            manager.start_all().await,
            Err(ServiceError::AlreadyStarted)
        ));

        manager.shutdown().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Stopped);

        // Already finished, so this resolves immediately
        manager.wait_for_shutdown().await;
    }

    #[test]
    fn test_duplicate_registration() {
        let manager = ServiceManager::with_defaults();
        manager
            .register(Arc::new(IdleService::new("a", false)))
            .unwrap();
        assert!(matches!(
            manager.register(Arc::new(IdleService::new("a", false))),
            Err(ServiceError::Duplicate("a"))
        ));
    }

    #[test]
    fn test_restart_delays() {
        let policy = RestartPolicy::OnFailure {
            max_retries: 2,
            backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.next_delay(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(2), None);
        assert_eq!(RestartPolicy::Never.next_delay(0), None);
    }

    #[tokio::test]
    async fn test_restart_respects_policy() {
        let manager = ServiceManager::with_defaults();
        let service = Arc::new(IdleService::new("flaky", true));
        manager.register(service.clone()).unwrap();

        manager.start_all().await.unwrap();
        assert_eq!(manager.restart_failed().await, vec!["flaky"]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.restart_failed().await.is_empty());
        assert_eq!(service.runs.load(Ordering::SeqCst), 2);
    }
}
