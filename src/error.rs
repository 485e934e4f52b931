//! Error types for the traffic ledger

use std::fmt;
use thiserror::Error;

/// Storage tier an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// TTL-bound counter store (Redis or in-memory)
    Hot,
    /// Durable aggregate store
    Cold,
    /// Quota / alert side caches
    State,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Cold => write!(f, "cold"),
            Tier::State => write!(f, "state"),
        }
    }
}

/// Main error type for the ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Caller input rejected: malformed resource type, empty window,
    /// inverted range, bad pagination
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource no longer exists downstream
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient failure talking to a storage tier
    #[error("{tier} tier unavailable: {message}")]
    TierUnavailable {
        /// Tier that failed
        tier: Tier,
        /// Sanitized description of the failure
        message: String,
    },

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Shorthand for a hot tier failure
    pub fn hot_unavailable(message: impl Into<String>) -> Self {
        LedgerError::TierUnavailable {
            tier: Tier::Hot,
            message: message.into(),
        }
    }

    /// Shorthand for a cold tier failure
    pub fn cold_unavailable(message: impl Into<String>) -> Self {
        LedgerError::TierUnavailable {
            tier: Tier::Cold,
            message: message.into(),
        }
    }

    /// Shorthand for a side-cache failure
    pub fn state_unavailable(message: impl Into<String>) -> Self {
        LedgerError::TierUnavailable {
            tier: Tier::State,
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::TierUnavailable { .. } | LedgerError::Cancelled
        )
    }

    /// Whether the error means the resource is gone for good
    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound(_))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, LedgerError>;
