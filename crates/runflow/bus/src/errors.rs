//! Event bus errors

/// Errors raised by the bus or reported by handlers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Event bus is shutting down")]
    ShuttingDown,

    #[error("Invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Handler failed: {0}")]
    Handler(String),
}

impl BusError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// Result type alias for bus operations
pub type BusResult<T> = Result<T, BusError>;
