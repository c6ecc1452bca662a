//! Error taxonomy shared by the store, its transports and the processes built on top

use thiserror::Error;

/// Errors surfaced by store operations and the coordination layer
#[derive(Debug, Error)]
pub enum ShareError {
    /// Connection refused or timed out during normal operation; callers retry
    #[error("Store transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Connect retries were exhausted
    #[error("Could not reach the shared store after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },

    /// The ping/pong liveness check with a worker never completed
    #[error("Connection verification with client process failed after {attempts} attempts")]
    HandshakeFailed { attempts: u32 },

    #[error("Listener for event '{0}' already exists")]
    DuplicateListener(String),

    #[error("Method {0} not found")]
    MethodNotFound(String),

    /// A registered method ran and returned an error
    #[error("Method call failed: {0}")]
    CallFailed(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unauthorized: shared secret rejected")]
    Unauthorized,

    #[error("Store is closed")]
    StoreClosed,

    #[error("Address already in use: {0}")]
    AddrInUse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ShareError {
    /// Whether a caller may reasonably retry the operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShareError::TransportUnavailable(_))
    }
}

/// Result alias for store operations
pub type ShareResult<T> = Result<T, ShareError>;
