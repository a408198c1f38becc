//! Error types for axbridge.

use thiserror::Error;

/// Main error type for axbridge.
///
/// These are infrastructure failures (spawning, I/O, registry misuse). Failures
/// of an individual dispatched operation are not errors at this level: they are
/// returned to the caller as a [`DispatchResult`](crate::dispatch::DispatchResult).
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Worker did not become ready within {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("Operation name must not be empty")]
    EmptyOperationName,

    #[error("Operation '{0}' is already registered")]
    DuplicateOperation(String),

    #[error("Invalid request state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// Result type alias for axbridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
