//! Daemon error types

use runflow_bus::BusError;
use runflow_rules::RuleError;
use runflow_types::RunflowError;

/// Daemon errors
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Seed file {path}: {message}")]
    Seed { path: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] RunflowError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

pub type DaemonResult<T> = Result<T, DaemonError>;
