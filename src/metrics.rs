//! Prometheus metrics for the traffic ledger
//!
//! Counters and histograms are registered once in the default registry and
//! exported as text through [`gather_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec, CounterVec,
    Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Write path ===

    /// Increments accepted by the hot tier
    pub static ref INCREMENTS_TOTAL: CounterVec = register_counter_vec!(
        "ledger_increments_total",
        "Total hot-tier increments",
        &["status"]
    ).unwrap();

    /// Bytes accepted by the hot tier
    pub static ref INCREMENT_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "ledger_increment_bytes_total",
        "Total bytes accepted by direction",
        &["direction"]
    ).unwrap();

    // === Compaction ===

    /// Per-key compaction outcomes
    pub static ref COMPACTION_KEYS_TOTAL: CounterVec = register_counter_vec!(
        "ledger_compaction_keys_total",
        "Keys processed by compaction by outcome",
        &["outcome"]
    ).unwrap();

    /// Compaction cycle duration
    pub static ref COMPACTION_DURATION: HistogramVec = register_histogram_vec!(
        "ledger_compaction_duration_seconds",
        "Compaction cycle latency in seconds",
        &["status"],
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    /// Keys whose consecutive flush failures crossed the warning threshold
    pub static ref FAILING_KEYS: Gauge = register_gauge!(
        "ledger_failing_keys",
        "Keys at or above the consecutive failure threshold"
    ).unwrap();

    /// Counter resets detected during compaction
    pub static ref COUNTER_RESETS_TOTAL: CounterVec = register_counter_vec!(
        "ledger_counter_resets_total",
        "Counters found below their flushed markers",
        &["resource_type"]
    ).unwrap();

    // === Queries ===

    /// Tier reads issued by the merge-query engine
    pub static ref QUERY_TIER_READS_TOTAL: CounterVec = register_counter_vec!(
        "ledger_query_tier_reads_total",
        "Tier reads by tier and status",
        &["tier", "status"]
    ).unwrap();

    /// Merge query latency
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "ledger_query_duration_seconds",
        "Merge query latency in seconds",
        &["operation"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // === Redis ===

    /// Commands and scripts sent through the pool
    pub static ref REDIS_COMMANDS_TOTAL: CounterVec = register_counter_vec!(
        "ledger_redis_commands_total",
        "Redis commands by status",
        &["status"]
    ).unwrap();

    /// Redis command latency
    pub static ref REDIS_COMMAND_DURATION: Histogram = register_histogram!(
        "ledger_redis_command_duration_seconds",
        "Redis command latency in seconds",
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.25, 1.0]
    ).unwrap();

    /// Retried Redis commands
    pub static ref REDIS_RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "ledger_redis_retries_total",
        "Redis retries by cause",
        &["cause"]
    ).unwrap();

    /// Connection attempts
    pub static ref REDIS_CONNECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "ledger_redis_connections_total",
        "Redis connection attempts by status",
        &["status"]
    ).unwrap();

    // === Errors ===

    /// Errors by type and operation
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "ledger_errors_total",
        "Total errors by type and operation",
        &["error_type", "operation"]
    ).unwrap();
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record an increment
#[inline]
pub fn record_increment(upload: u64, download: u64, success: bool) {
    let status = if success { "success" } else { "error" };
    INCREMENTS_TOTAL.with_label_values(&[status]).inc();

    if success {
        INCREMENT_BYTES_TOTAL
            .with_label_values(&["upload"])
            .inc_by(upload as f64);
        INCREMENT_BYTES_TOTAL
            .with_label_values(&["download"])
            .inc_by(download as f64);
    }
}

/// Record one key's compaction outcome
#[inline]
pub fn record_compaction_key(outcome: &str) {
    COMPACTION_KEYS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a finished compaction cycle
#[inline]
pub fn record_compaction_cycle(duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };
    COMPACTION_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Update the failing keys gauge
#[inline]
pub fn update_failing_keys(count: usize) {
    FAILING_KEYS.set(count as f64);
}

/// Record a counter reset
#[inline]
pub fn record_counter_reset(resource_type: &str) {
    COUNTER_RESETS_TOTAL
        .with_label_values(&[resource_type])
        .inc();
}

/// Record a tier read made by a query
#[inline]
pub fn record_tier_read(tier: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    QUERY_TIER_READS_TOTAL
        .with_label_values(&[tier, status])
        .inc();
}

/// Record merge query latency
#[inline]
pub fn record_query(operation: &str, duration_secs: f64) {
    QUERY_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record one Redis command attempt
#[inline]
pub fn record_redis_command(duration_secs: Option<f64>) {
    match duration_secs {
        Some(secs) => {
            REDIS_COMMANDS_TOTAL.with_label_values(&["success"]).inc();
            REDIS_COMMAND_DURATION.observe(secs);
        },
        None => REDIS_COMMANDS_TOTAL.with_label_values(&["error"]).inc(),
    }
}

/// Record a Redis retry
#[inline]
pub fn record_redis_retry(cause: &str) {
    REDIS_RETRIES_TOTAL.with_label_values(&[cause]).inc();
}

/// Record a Redis connection attempt
#[inline]
pub fn record_redis_connection(success: bool) {
    let status = if success { "success" } else { "error" };
    REDIS_CONNECTIONS_TOTAL.with_label_values(&[status]).inc();
}

/// Record an error
#[inline]
pub fn record_error(error_type: &str, operation: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, operation])
        .inc();
}
