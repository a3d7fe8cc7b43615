use crate::container::LifecycleState;
use thiserror::Error;

/// Main error type for the berth lifecycle daemon
#[derive(Debug, Error)]
pub enum BerthError {
    // Container-related errors
    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Container name already in use: {0}")]
    NameConflict(String),

    #[error("Container {0} is in invalid state for this operation: {1}")]
    InvalidState(String, String),

    // Lifecycle conflicts
    #[error("Conflict on container {id}: expected state {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("Invalid state transition for container {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    // Caller-side request errors
    #[error("Request cancelled")]
    RequestCancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    // Process-related errors
    #[error("Failed to start container {0}: {1}")]
    StartError(String, String),

    #[error("Failed to stop container {0}: {1}")]
    StopError(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    #[error("Process supervisor error: {0}")]
    SupervisorError(String),

    #[error("Reconciliation failed for container {0}: {1}")]
    ReconcileError(String, String),

    // Health check errors
    #[error("Health check error: {0}")]
    HealthCheckError(String),

    // State persistence errors
    #[error("State error: {0}")]
    StateError(String),

    #[error("Failed to load state: {0}")]
    StateLoadError(String),

    #[error("Failed to save state: {0}")]
    StateSaveError(String),

    #[error("State corruption detected: {0}")]
    StateCorruption(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BerthError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BerthError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BerthError::Conflict { .. } | BerthError::InvalidTransition { .. }
        )
    }

    /// True for errors that only describe the caller's request, not the operation
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            BerthError::RequestCancelled | BerthError::DeadlineExceeded
        )
    }
}

/// Result type alias for berth operations
pub type Result<T> = std::result::Result<T, BerthError>;
