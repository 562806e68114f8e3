//! Error types for the fleet controller.

use thiserror::Error;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while checkpointing to the redb store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

/// Result type alias for controller operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Error taxonomy shared by the autoscaler, rollout engine, and reconciler.
///
/// `Conflict` and `Config` are synchronous rejections of a command and never
/// come with a state change. `Driver` and `Timeout` are surfaced through
/// rollout and worker status instead of stopping the reconciliation loop.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("fleet controller is not running")]
    Stopped,
}

impl FleetError {
    /// Whether this error rejects a command without touching fleet state.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Config(_) | Self::NotFound(_))
    }
}
