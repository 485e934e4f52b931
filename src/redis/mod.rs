//! Redis plumbing shared by the hot tier and the side caches
//!
//! # Features
//!
//! - Connection pooling with per-command timeouts
//! - Exponential backoff retry for transient failures
//! - Atomic multi-field operations via Lua scripts
//! - Credential-safe error messages
//!
//! # Example
//!
//! ```rust,no_run
//! use traffic_ledger::redis::{LuaScripts, RedisConfig, RedisPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = RedisPool::new(RedisConfig::default()).await?;
//! let scripts = LuaScripts::new();
//! let _increment = scripts.increment();
//! pool.ping().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod scripts;
pub mod util;

pub use connection::{RedisConfig, RedisPool, RetryPolicy};
pub use scripts::LuaScripts;
