//! Rule engine errors

use runflow_bus::BusError;
use runflow_script::ScriptError;
use runflow_types::StoreError;

/// Errors raised while loading or executing rules
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Rule store error: {0}")]
    Store(#[from] StoreError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },
}

/// Result type alias for rule operations
pub type RuleResult<T> = Result<T, RuleError>;
