//! Workflow results and terminal status

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::ConstitutionalHash;
use crate::error::EngineResult;

/// Status of a workflow execution (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Not started
    Pending,
    /// Currently executing
    Executing,
    /// Completed successfully
    Completed,
    /// Failed with no compensations attempted
    Failed,
    /// Overall deadline exceeded
    TimedOut,
    /// Rollback in progress
    Compensating,
    /// All compensations succeeded after a failure
    Compensated,
    /// Some compensations failed after a failure
    PartiallyCompensated,
    /// Cancellation signal observed
    Cancelled,
}

impl WorkflowStatus {
    /// Status as a metric/log label
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Executing => "executing",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::TimedOut => "timed_out",
            WorkflowStatus::Compensating => "compensating",
            WorkflowStatus::Compensated => "compensated",
            WorkflowStatus::PartiallyCompensated => "partially_compensated",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

/// Terminal outcome of a workflow execution.
///
/// `run` always returns one of these, never an error: the caller inspects
/// `status` and `errors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Workflow instance identifier
    pub workflow_id: String,
    /// Terminal status
    pub status: WorkflowStatus,
    /// Workflow output on success
    pub output: Option<Value>,
    /// Wall time of the run in milliseconds
    pub execution_time_ms: f64,
    /// Names of completed steps, in completion order
    pub steps_completed: Vec<String>,
    /// Names of failed steps
    pub steps_failed: Vec<String>,
    /// Compensations that executed successfully, in invocation order
    pub compensations_executed: Vec<String>,
    /// Compensations that failed after their retry budget
    pub compensations_failed: Vec<String>,
    /// Governance hash the run was validated against
    pub constitutional_hash: ConstitutionalHash,
    /// Errors accumulated during the run
    pub errors: Vec<String>,
    /// Audit record identifier, when audit recording succeeded
    pub audit_id: Option<String>,
}

impl WorkflowResult {
    /// Successful completion
    pub fn success(
        workflow_id: impl Into<String>,
        constitutional_hash: ConstitutionalHash,
        output: Value,
        execution_time_ms: f64,
        steps_completed: Vec<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Completed,
            output: Some(output),
            execution_time_ms,
            steps_completed,
            steps_failed: Vec::new(),
            compensations_executed: Vec::new(),
            compensations_failed: Vec::new(),
            constitutional_hash,
            errors: Vec::new(),
            audit_id: None,
        }
    }

    /// Failure after exhausting the forward path
    pub fn failure(
        workflow_id: impl Into<String>,
        constitutional_hash: ConstitutionalHash,
        errors: Vec<String>,
        execution_time_ms: f64,
        steps_completed: Vec<String>,
        steps_failed: Vec<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Failed,
            output: None,
            execution_time_ms,
            steps_completed,
            steps_failed,
            compensations_executed: Vec::new(),
            compensations_failed: Vec::new(),
            constitutional_hash,
            errors,
            audit_id: None,
        }
    }

    /// Overall deadline exceeded
    pub fn timeout(
        workflow_id: impl Into<String>,
        constitutional_hash: ConstitutionalHash,
        errors: Vec<String>,
        execution_time_ms: f64,
        steps_completed: Vec<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::TimedOut,
            output: None,
            execution_time_ms,
            steps_completed,
            steps_failed: Vec::new(),
            compensations_executed: Vec::new(),
            compensations_failed: Vec::new(),
            constitutional_hash,
            errors,
            audit_id: None,
        }
    }

    /// Cancellation observed
    pub fn cancelled(
        workflow_id: impl Into<String>,
        constitutional_hash: ConstitutionalHash,
        errors: Vec<String>,
        execution_time_ms: f64,
        steps_completed: Vec<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Cancelled,
            output: None,
            execution_time_ms,
            steps_completed,
            steps_failed: Vec::new(),
            compensations_executed: Vec::new(),
            compensations_failed: Vec::new(),
            constitutional_hash,
            errors,
            audit_id: None,
        }
    }

    /// Override the terminal status (compensated / partially compensated)
    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach compensation outcomes
    pub fn with_compensations(mut self, executed: Vec<String>, failed: Vec<String>) -> Self {
        self.compensations_executed = executed;
        self.compensations_failed = failed;
        self
    }

    /// Attach failed step names
    pub fn with_steps_failed(mut self, steps_failed: Vec<String>) -> Self {
        self.steps_failed = steps_failed;
        self
    }

    /// Attach the audit record identifier
    pub fn with_audit_id(mut self, audit_id: Option<String>) -> Self {
        self.audit_id = audit_id;
        self
    }

    /// Whether the run completed successfully
    pub fn is_successful(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// Whether the run terminated on a failure path
    pub fn is_failed(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Failed
                | WorkflowStatus::TimedOut
                | WorkflowStatus::Compensated
                | WorkflowStatus::PartiallyCompensated
                | WorkflowStatus::Cancelled
        )
    }

    /// Convert to a mapping with stable key order
    pub fn to_mapping(&self) -> EngineResult<Value> {
        serde_json::to_value(self).map_err(Into::into)
    }
}
