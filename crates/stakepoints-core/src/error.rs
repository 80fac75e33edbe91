//! Error types for the staking points pipeline.

use thiserror::Error;

/// Errors that can occur while ingesting and accruing stake events.
#[derive(Debug, Error)]
pub enum PointsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Malformed event: {reason}")]
    MalformedEvent { reason: String },

    /// The store could not be reached or was busy; the operation may succeed if retried.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Accrual for event {key} failed after {attempts} attempts: {reason}")]
    AccrualFailed {
        key: String,
        attempts: u32,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

impl PointsError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::Rpc(_) | Self::Subscription(_)
        )
    }

    /// Returns `true` if the error concerns a single bad event payload.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedEvent { .. })
    }
}
