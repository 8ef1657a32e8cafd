//! Queue error types

use runflow_types::JobId;

/// Errors raised by the scheduling queue and its backends
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Scheduling queue is disabled")]
    Disabled,

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Queue backend unavailable: {0}")]
    Connection(String),

    #[error("Queue backend failure: {0}")]
    Backend(String),

    #[error("Job serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
