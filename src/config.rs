//! Configuration management for the traffic ledger
//!
//! TOML file support, `LEDGER_*` environment variable overrides, and
//! defaults for every field.

use crate::redis::RedisConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LedgerConfig {
    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,

    /// Hot tier layout and retention
    #[serde(default)]
    pub hot: HotConfig,

    /// Compaction worker tuning
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Query limits
    #[serde(default)]
    pub query: QueryConfig,

    /// Quota and alert side caches
    #[serde(default)]
    pub state: StateConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hot tier configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HotConfig {
    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Sliding window served from the hot tier, in hours
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Extra TTL beyond the retention window, in seconds
    #[serde(default = "default_ttl_grace_secs")]
    pub ttl_grace_secs: u64,

    /// Business timezone as minutes east of UTC
    #[serde(default = "default_zone_offset_minutes")]
    pub zone_offset_minutes: i32,
}

/// Compaction configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompactionConfig {
    /// Enable the background flush service
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between compaction cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Maximum active keys processed per cycle
    #[serde(default = "default_max_keys_per_cycle")]
    pub max_keys_per_cycle: usize,

    /// Keys read per snapshot round-trip
    #[serde(default = "default_snapshot_batch")]
    pub snapshot_batch: usize,

    /// Concurrent cold-tier writes
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Consecutive failures of one key before it is logged at warn
    #[serde(default = "default_failure_warn_threshold")]
    pub failure_warn_threshold: u32,

    /// Drain and delete hot buckets older than the retention window
    #[serde(default = "default_true")]
    pub trim_expired_buckets: bool,
}

/// Query configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Largest accepted page size; larger requests are clamped
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Maximum source rows a cold-tier read may aggregate
    #[serde(default = "default_row_cap")]
    pub row_cap: usize,

    /// Maximum concurrent hot-tier bucket reads per query
    #[serde(default = "default_hot_read_concurrency")]
    pub hot_read_concurrency: usize,
}

/// Side-cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    /// TTL of a subscription's quota entry, refreshed on every write
    #[serde(default = "default_quota_ttl_secs")]
    pub quota_ttl_secs: u64,

    /// TTL of a subscription's alert level
    #[serde(default = "default_alert_ttl_secs")]
    pub alert_ttl_secs: u64,

    /// Usage percentages that raise an alert, ascending
    #[serde(default = "default_alert_thresholds")]
    pub alert_thresholds: Vec<u8>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_key_prefix() -> String { "traffic".to_string() }
fn default_retention_hours() -> u64 { 24 }
fn default_ttl_grace_secs() -> u64 { 3_600 }
fn default_zone_offset_minutes() -> i32 { crate::types::DEFAULT_OFFSET_MINUTES }
fn default_interval_secs() -> u64 { 60 }
fn default_max_keys_per_cycle() -> usize { 10_000 }
fn default_snapshot_batch() -> usize { 256 }
fn default_concurrency() -> usize { 16 }
fn default_failure_warn_threshold() -> u32 { 5 }
fn default_max_page_size() -> usize { 1_000 }
fn default_row_cap() -> usize { crate::cold::DEFAULT_ROW_CAP }
fn default_hot_read_concurrency() -> usize { 8 }
fn default_quota_ttl_secs() -> u64 { 31 * 86_400 }
fn default_alert_ttl_secs() -> u64 { 31 * 86_400 }
fn default_alert_thresholds() -> Vec<u8> { vec![80, 90, 100] }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for HotConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            retention_hours: default_retention_hours(),
            ttl_grace_secs: default_ttl_grace_secs(),
            zone_offset_minutes: default_zone_offset_minutes(),
        }
    }
}

impl HotConfig {
    /// Retention window
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3_600)
    }

    /// TTL applied to hot records and indexes
    pub fn record_ttl(&self) -> Duration {
        self.retention() + Duration::from_secs(self.ttl_grace_secs)
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            max_keys_per_cycle: default_max_keys_per_cycle(),
            snapshot_batch: default_snapshot_batch(),
            concurrency: default_concurrency(),
            failure_warn_threshold: default_failure_warn_threshold(),
            trim_expired_buckets: true,
        }
    }
}

impl CompactionConfig {
    /// Time between cycles
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
            row_cap: default_row_cap(),
            hot_read_concurrency: default_hot_read_concurrency(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            quota_ttl_secs: default_quota_ttl_secs(),
            alert_ttl_secs: default_alert_ttl_secs(),
            alert_thresholds: default_alert_thresholds(),
        }
    }
}

impl StateConfig {
    /// Quota entry TTL
    pub fn quota_ttl(&self) -> Duration {
        Duration::from_secs(self.quota_ttl_secs)
    }

    /// Alert level TTL
    pub fn alert_ttl(&self) -> Duration {
        Duration::from_secs(self.alert_ttl_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl LedgerConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Redis
        if let Ok(url) = std::env::var("LEDGER_REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(size) = env_parse("LEDGER_REDIS_POOL_SIZE") {
            self.redis.pool_size = size;
        }

        // Hot tier
        if let Ok(prefix) = std::env::var("LEDGER_KEY_PREFIX") {
            self.hot.key_prefix = prefix;
        }
        if let Some(hours) = env_parse("LEDGER_RETENTION_HOURS") {
            self.hot.retention_hours = hours;
        }
        if let Some(offset) = env_parse("LEDGER_ZONE_OFFSET_MINUTES") {
            self.hot.zone_offset_minutes = offset;
        }

        // Compaction
        if let Some(secs) = env_parse("LEDGER_COMPACTION_INTERVAL_SECS") {
            self.compaction.interval_secs = secs;
        }
        if let Some(concurrency) = env_parse("LEDGER_COMPACTION_CONCURRENCY") {
            self.compaction.concurrency = concurrency;
        }

        // Logging
        if let Ok(level) = std::env::var("LEDGER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = env_parse("LEDGER_LOG_JSON") {
            self.logging.json = json;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.redis.validate()?;

        if self.hot.key_prefix.is_empty() {
            return Err("Key prefix cannot be empty".to_string());
        }
        if self.hot.key_prefix.contains(char::is_whitespace) {
            return Err("Key prefix cannot contain whitespace".to_string());
        }
        if self.hot.retention_hours == 0 {
            return Err("Retention must be at least one hour".to_string());
        }
        if self.hot.zone_offset_minutes.abs() >= 24 * 60 {
            return Err("Zone offset must be within +/-24h".to_string());
        }

        if self.compaction.interval_secs == 0 {
            return Err("Compaction interval must be > 0".to_string());
        }
        // A key must survive at least one full cycle after its last write
        if self.hot.ttl_grace_secs <= self.compaction.interval_secs {
            return Err(format!(
                "TTL grace ({}s) must exceed the compaction interval ({}s)",
                self.hot.ttl_grace_secs, self.compaction.interval_secs
            ));
        }
        if self.compaction.max_keys_per_cycle == 0 {
            return Err("Max keys per cycle must be > 0".to_string());
        }
        if self.compaction.snapshot_batch == 0 {
            return Err("Snapshot batch must be > 0".to_string());
        }
        if self.compaction.concurrency == 0 {
            return Err("Compaction concurrency must be > 0".to_string());
        }

        if self.query.max_page_size == 0 {
            return Err("Max page size must be > 0".to_string());
        }
        if self.query.row_cap == 0 {
            return Err("Row cap must be > 0".to_string());
        }
        if self.query.hot_read_concurrency == 0 {
            return Err("Hot read concurrency must be > 0".to_string());
        }

        if self.state.quota_ttl_secs == 0 || self.state.alert_ttl_secs == 0 {
            return Err("State TTLs must be > 0".to_string());
        }
        if self.state.alert_thresholds.is_empty() {
            return Err("At least one alert threshold is required".to_string());
        }
        if !self.state.alert_thresholds.windows(2).all(|w| w[0] < w[1]) {
            return Err("Alert thresholds must be strictly ascending".to_string());
        }
        if self.state.alert_thresholds[0] == 0 {
            return Err("Alert thresholds must be > 0".to_string());
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path, e))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();
        assert_eq!(config.hot.key_prefix, "traffic");
        assert_eq!(config.hot.retention(), Duration::from_secs(24 * 3600));
        assert_eq!(config.hot.record_ttl(), Duration::from_secs(25 * 3600));
        assert!(config.compaction.enabled);
    }

    #[test]
    fn test_config_validation() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_grace_must_exceed_interval() {
        let mut config = LedgerConfig::default();
        config.compaction.interval_secs = config.hot.ttl_grace_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_alert_thresholds_must_ascend() {
        let mut config = LedgerConfig::default();
        config.state.alert_thresholds = vec![90, 80];
        assert!(config.validate().is_err());

        config.state.alert_thresholds = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_prefix() {
        let mut config = LedgerConfig::default();
        config.hot.key_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: LedgerConfig = toml::from_str(
            r#"
            [hot]
            retention_hours = 48

            [compaction]
            interval_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.hot.retention_hours, 48);
        assert_eq!(config.hot.key_prefix, "traffic");
        assert_eq!(config.compaction.interval_secs, 30);
        assert_eq!(config.query.max_page_size, 1_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        let path = path.to_str().unwrap();

        let mut config = LedgerConfig::default();
        config.hot.retention_hours = 36;
        config.save_to_file(path).unwrap();

        let loaded = LedgerConfig::from_file(path).unwrap();
        assert_eq!(loaded.hot.retention_hours, 36);
        assert_eq!(loaded.redis.url, config.redis.url);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("LEDGER_RETENTION_HOURS", "12");
        let config = LedgerConfig::from_env();
        assert_eq!(config.hot.retention_hours, 12);
        std::env::remove_var("LEDGER_RETENTION_HOURS");
    }
}
