//! Redis connection pool
//!
//! One multiplexed connection carries every command; a semaphore bounds how
//! many are in flight. Each command runs under a timeout and may be retried
//! with exponential backoff, depending on how safe it is to replay:
//!
//! - [`RedisPool::execute`] retries any transient failure. Use it for reads and
//!   for scripts whose replay leaves the same state (marker commits, settles,
//!   deletes).
//! - [`RedisPool::execute_once`] only retries failures that prove the command
//!   never ran. Counter increments, read-and-delete and compare-and-set must
//!   go through it; replaying them after a timeout could double-count, lose a
//!   drained bucket or misreport a lost race.
//!
//! # Example
//!
//! ```rust,no_run
//! use traffic_ledger::redis::{RedisConfig, RedisPool};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::with_url("redis://127.0.0.1:6379")
//!     .pool_size(32)
//!     .command_timeout(Duration::from_millis(500));
//!
//! let pool = RedisPool::new(config).await?;
//! pool.ping().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::LedgerError;
use crate::metrics;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

use super::util::{safe_redis_error, target_of};

/// Largest accepted in-flight command limit
const MAX_POOL_SIZE: u32 = 1_000;

/// Redis connection settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Server URL, `rediss://` when TLS is enabled
    pub url: String,

    /// Commands allowed in flight at once
    pub pool_size: u32,

    /// Connect timeout, in milliseconds in config files
    #[serde(with = "duration_millis")]
    pub connection_timeout: Duration,

    /// Per-attempt command timeout, in milliseconds in config files
    #[serde(with = "duration_millis")]
    pub command_timeout: Duration,

    /// Require TLS (needs the `redis-tls` feature)
    pub tls_enabled: bool,

    /// Backoff between attempts
    pub retry_policy: RetryPolicy,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            tls_enabled: false,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl RedisConfig {
    /// Defaults pointed at `url`
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// In-flight command limit
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Connect timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Per-attempt command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Backoff between attempts
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Require TLS
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    /// Check the settings before any connection is attempted
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("redis.url must not be empty".to_string());
        }
        if self.pool_size == 0 || self.pool_size > MAX_POOL_SIZE {
            return Err(format!(
                "redis.pool_size must be within 1..={}, got {}",
                MAX_POOL_SIZE, self.pool_size
            ));
        }
        if self.connection_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err("redis timeouts must be greater than 0".to_string());
        }

        #[cfg(not(feature = "redis-tls"))]
        if self.tls_enabled {
            return Err("redis.tls_enabled requires the 'redis-tls' feature".to_string());
        }

        if self.tls_enabled != self.url.starts_with("rediss://") {
            return Err("redis.url must use rediss:// exactly when TLS is enabled".to_string());
        }

        Ok(())
    }
}

/// Exponential backoff between attempts
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound on any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Stretch each delay by up to 25% at random
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt + 1`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let capped_ms = (self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent))
            .min(self.max_delay.as_millis() as f64);

        let stretch = if self.jitter {
            1.0 + rand::random::<f64>() * 0.25
        } else {
            1.0
        };
        Duration::from_millis((capped_ms * stretch) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Replay safety of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Idempotent,
    AtMostOnce,
}

/// Why an attempt failed
enum Failure {
    /// No connection; nothing reached the server
    Unsent(LedgerError),
    /// The server answered with an error
    Command(RedisError),
    /// No answer in time; the command may or may not have run
    Timeout,
}

impl Failure {
    fn cause(&self) -> &'static str {
        match self {
            Failure::Unsent(_) => "connect",
            Failure::Command(_) => "command",
            Failure::Timeout => "timeout",
        }
    }

    fn retriable(&self, replay: Replay) -> bool {
        match (self, replay) {
            (Failure::Unsent(_), _) => true,
            (Failure::Command(e), Replay::Idempotent) => is_transient(e),
            (Failure::Command(e), Replay::AtMostOnce) => was_rejected_unexecuted(e),
            (Failure::Timeout, Replay::Idempotent) => true,
            (Failure::Timeout, Replay::AtMostOnce) => false,
        }
    }

    fn into_error(self, url: &str) -> LedgerError {
        match self {
            Failure::Unsent(e) => e,
            Failure::Command(e) => map_redis_error(url, &e),
            Failure::Timeout => LedgerError::hot_unavailable("Redis command timeout"),
        }
    }
}

/// Shared Redis connection with bounded concurrency, timeouts and retry
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    config: RedisConfig,
    permits: Semaphore,
    target: String,
}

impl RedisPool {
    /// Validate `config` and establish the initial connection
    pub async fn new(config: RedisConfig) -> Result<Self, LedgerError> {
        config.validate().map_err(LedgerError::Configuration)?;

        let client = Client::open(config.url.as_str())
            .map_err(|e| LedgerError::hot_unavailable(safe_redis_error(&config.url, &e)))?;
        let target = target_of(&config.url).unwrap_or_else(|| "[invalid-url]".to_string());

        let pool = Self {
            client,
            connection: RwLock::new(None),
            permits: Semaphore::new(config.pool_size as usize),
            config,
            target,
        };
        pool.connect().await?;
        debug!(server = %pool.target, pool_size = pool.config.pool_size, "Redis pool ready");
        Ok(pool)
    }

    async fn connect(&self) -> Result<MultiplexedConnection, LedgerError> {
        let start = Instant::now();
        let result = tokio::time::timeout(
            self.config.connection_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await;
        metrics::record_redis_connection(matches!(result, Ok(Ok(_))));

        let conn = match result {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(LedgerError::hot_unavailable(safe_redis_error(&self.config.url, &e)))
            },
            Err(_) => {
                return Err(LedgerError::hot_unavailable(format!(
                    "Redis {} connect timeout",
                    self.target
                )))
            },
        };

        *self.connection.write().await = Some(conn.clone());
        debug!(server = %self.target, elapsed = ?start.elapsed(), "Redis connected");
        Ok(conn)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, LedgerError> {
        let cached = self.connection.read().await.clone();
        match cached {
            Some(conn) => Ok(conn),
            None => self.connect().await,
        }
    }

    /// Forget the cached connection so the next attempt reconnects
    async fn invalidate(&self) {
        *self.connection.write().await = None;
    }

    /// Run a read or an idempotent write, retrying transient failures
    ///
    /// `f` receives a fresh connection handle on every attempt.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        self.run(Replay::Idempotent, f).await
    }

    /// Run a write that must not be applied twice
    ///
    /// Retries only when the command provably did not run: no connection,
    /// refused connection, or a server that rejected it while loading.
    pub async fn execute_once<F, Fut, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        self.run(Replay::AtMostOnce, f).await
    }

    async fn run<F, Fut, T>(&self, replay: Replay, f: F) -> Result<T, LedgerError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let mut attempt = 0;
        loop {
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| LedgerError::hot_unavailable("Redis pool closed"))?;

            let failure = match self.connection().await {
                Err(e) => Failure::Unsent(e),
                Ok(conn) => {
                    let start = Instant::now();
                    match tokio::time::timeout(self.config.command_timeout, f(conn)).await {
                        Ok(Ok(value)) => {
                            metrics::record_redis_command(Some(start.elapsed().as_secs_f64()));
                            return Ok(value);
                        },
                        Ok(Err(e)) => {
                            metrics::record_redis_command(None);
                            if e.is_connection_dropped() || e.is_io_error() {
                                self.invalidate().await;
                            }
                            Failure::Command(e)
                        },
                        Err(_) => {
                            metrics::record_redis_command(None);
                            Failure::Timeout
                        },
                    }
                },
            };
            drop(permit);

            if !(failure.retriable(replay) && self.config.retry_policy.should_retry(attempt)) {
                return Err(failure.into_error(&self.config.url));
            }

            let delay = self.config.retry_policy.delay_for_attempt(attempt);
            metrics::record_redis_retry(failure.cause());
            warn!(
                server = %self.target,
                attempt = attempt + 1,
                cause = failure.cause(),
                delay_ms = delay.as_millis() as u64,
                "Redis attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Round-trip a PING
    pub async fn ping(&self) -> Result<(), LedgerError> {
        self.execute(|mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }

    /// Pool settings
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

/// Map a Redis error onto the ledger taxonomy
///
/// Type and parse errors mean a stored value has the wrong shape; they surface
/// as serialization errors rather than tier outages.
fn map_redis_error(url: &str, e: &RedisError) -> LedgerError {
    match e.kind() {
        redis::ErrorKind::TypeError | redis::ErrorKind::ParseError => {
            LedgerError::Serialization(safe_redis_error(url, e))
        },
        _ => LedgerError::hot_unavailable(safe_redis_error(url, e)),
    }
}

fn is_transient(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_timeout() || e.is_io_error() || was_rejected_unexecuted(e)
}

fn was_rejected_unexecuted(e: &RedisError) -> bool {
    e.is_connection_refusal()
        || matches!(e.kind(), redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain)
}

/// `Duration` as integer milliseconds in config files
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
