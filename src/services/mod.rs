//! Background services
//!
//! ```text
//! ┌────────────────┐   shutdown   ┌──────────────┐  run_cycle   ┌───────────┐
//! │ ServiceManager │─────────────▶│ FlushService │─────────────▶│ Compactor │
//! └────────────────┘    token     └──────────────┘ drain_bucket └───────────┘
//! ```
//!
//! - **ServiceManager**: spawns services, cancels them on shutdown, restarts failures
//! - **FlushService**: periodic compaction and expired-bucket trimming
//!
//! # Example
//!
//! ```rust
//! use traffic_ledger::services::{ServiceConfig, ServiceManager};
//!
//! let manager = ServiceManager::new(ServiceConfig::default());
//! assert!(manager.status().is_empty());
//! ```

pub mod flush;
pub mod framework;

pub use flush::FlushService;
pub use framework::{
    RestartPolicy, Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus,
};
