//! Error types for the Runflow data model and engine

use crate::{RunDefinitionId, RunId, RunState, StepId};

/// Errors that can occur in run definition and run operations
#[derive(Debug, thiserror::Error)]
pub enum RunflowError {
    #[error("Run definition not found: {0}")]
    DefinitionNotFound(RunDefinitionId),

    #[error("No run definition with code '{code}' visible from scope '{scope}'")]
    DefinitionCodeNotFound { code: String, scope: String },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("Run is not waiting (state: {0})")]
    NotWaiting(RunState),

    #[error("No start step defined")]
    NoStartStep,

    #[error("Expected exactly one start step, found {0}")]
    MultipleStartSteps(usize),

    #[error("Edge references unknown step: {from} -> {to}")]
    DanglingEdge { from: StepId, to: StepId },

    #[error("End step has outgoing edges: {0}")]
    EndStepHasEdges(StepId),

    #[error("Step is unreachable from start: {0}")]
    UnreachableStep(StepId),

    #[error("Duplicate step ID: {0}")]
    DuplicateStepId(StepId),

    #[error("Step '{step}' may suspend and cannot be nested in '{container}'")]
    SuspensionInBranch { container: StepId, step: StepId },

    #[error("Step failed: {0}")]
    StepFailed(String),

    #[error("Capability '{topic}' did not reply within {timeout_ms}ms")]
    CapabilityTimeout { topic: String, timeout_ms: u64 },

    #[error("Run definition validation error: {0}")]
    ValidationError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Result type alias for run operations
pub type RunflowResult<T> = Result<T, RunflowError>;

/// Errors from run, record and rule stores
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
