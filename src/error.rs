//! Error types for the workflow engine

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, WorkflowError>;

/// Error taxonomy shared by all executors
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Provided governance hash differs from the expected value
    #[error("constitutional hash mismatch: expected {expected}, got {actual}")]
    ConstitutionalMismatch { expected: String, actual: String },

    /// Per-attempt step deadline exceeded
    #[error("step '{step}' timed out after {timeout_secs}s")]
    StepTimeout { step: String, timeout_secs: u64 },

    /// Step execution raised an error
    #[error("step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    /// Outer deadline of a workflow run exceeded
    #[error("workflow timed out after {timeout_secs}s")]
    OverallTimeout { timeout_secs: u64 },

    /// A rollback step failed after its retry budget
    #[error("compensation '{name}' failed after {attempts} attempts")]
    CompensationFailed { name: String, attempts: u32 },

    /// A graph mutation would create a cycle
    #[error("adding node '{node}' would create a cycle")]
    CycleDetected { node: String },

    /// A node references a dependency absent at execution time
    #[error("node '{node}' references missing dependency '{dependency}'")]
    MissingDependency { node: String, dependency: String },

    /// Node identifier already present in the graph
    #[error("node '{node}' already exists")]
    DuplicateNode { node: String },

    /// A cyclic graph did not converge within its iteration budget
    #[error("graph exceeded iteration budget of {budget}")]
    IterationBudgetExceeded { budget: u32 },

    /// Overall cancellation signal observed
    #[error("workflow cancelled")]
    Cancelled,

    /// Invalid step or workflow state transition
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Template parsing or validation error
    #[error("template error: {0}")]
    Template(String),

    /// External activity error
    #[error("activity error: {0}")]
    Activity(String),

    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for WorkflowError {
    fn from(err: serde_yaml::Error) -> Self {
        WorkflowError::Template(format!("YAML parsing error: {}", err))
    }
}
