//! Traffic Ledger - hot/cold byte accounting for edge traffic reports
//!
//! This library meters upload/download bytes reported by many concurrent
//! edge processes and answers windowed analytics without a durable write per
//! report:
//! - A TTL-bound hot tier (Redis or in-memory) absorbing increments
//! - Exactly-once-effective compaction into a durable cold tier
//! - Merge queries that split a window at the hot/cold boundary
//! - Quota and alert side caches per subscription
//!
//! # Layout
//!
//! ```text
//!  increment ──▶ HotStore ──(Compactor)──▶ ColdStore
//!                   │                          │
//!                   └──────▶ MergeQueryEngine ◀┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod cold;
pub mod compaction;
pub mod error;
pub mod hot;
pub mod key;
pub mod query;
pub mod state;
pub mod types;

/// Prometheus metrics
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Redis connection pool and Lua scripts shared by the hot tier and side caches
pub mod redis;

/// Background services: service manager and periodic flush
pub mod services;

/// Tracing subscriber setup
pub mod telemetry;

/// Ledger facade wiring both tiers, compaction, queries and quotas
pub mod ledger;

// Re-export main types
pub use error::{LedgerError, Result};
pub use key::{ResourceKey, ResourceType};
pub use ledger::{Overview, TrafficLedger, TrafficLedgerBuilder};
pub use types::{
    GroupDimension, GroupKey, Granularity, Page, TimeWindow, TrafficEntry, TrafficSummary,
};
