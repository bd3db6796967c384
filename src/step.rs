//! Workflow steps and compensations
//!
//! A step is a unit of work paired with an optional compensation. Step and
//! compensation lifecycles are strict state machines; invalid transitions
//! are errors rather than silent corrections.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    DEFAULT_COMPENSATION_RETRIES, DEFAULT_COMPENSATION_TIMEOUT, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_DELAY, DEFAULT_STEP_TIMEOUT,
};
use crate::error::{EngineResult, WorkflowError};

/// Boxed future returned by a step's execute closure
pub type StepFuture = BoxFuture<'static, EngineResult<Value>>;

/// Async step operation: input mapping to result value
pub type StepFn = Arc<dyn Fn(Value) -> StepFuture + Send + Sync>;

/// Boxed future returned by a compensation's execute closure
pub type CompensationFuture = BoxFuture<'static, EngineResult<bool>>;

/// Async compensation operation: input mapping to success flag
pub type CompensationFn = Arc<dyn Fn(Value) -> CompensationFuture + Send + Sync>;

/// Step lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step has not started
    Pending,
    /// Step is executing (re-entered on retry)
    Executing,
    /// Step completed successfully
    Completed,
    /// Step failed after exhausting its retry budget
    Failed,
    /// Step was skipped
    Skipped,
    /// Step's compensation is executing
    Compensating,
    /// Step's compensation completed
    Compensated,
}

impl StepStatus {
    /// Status as a metric/log label
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Executing => "executing",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Compensating => "compensating",
            StepStatus::Compensated => "compensated",
        }
    }
}

/// Compensation lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompensationStatus {
    /// Registered but not invoked
    Pending,
    /// Compensation is executing
    Executing,
    /// Compensation completed
    Completed,
    /// Compensation failed after its retry budget
    Failed,
}

/// A unit of work within a workflow
#[derive(Clone)]
pub struct WorkflowStep {
    /// Step name, unique within the workflow
    pub name: String,
    execute: StepFn,
    /// Paired rollback action, registered before the step executes
    pub compensation: Option<StepCompensation>,
    /// Retry budget beyond the first attempt
    pub max_retries: u32,
    /// Delay between retries
    pub retry_delay: Duration,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// If true, failure is tolerated and the workflow continues
    pub is_optional: bool,
    /// Validate the governance hash before executing
    pub requires_constitutional_check: bool,

    /// Current lifecycle state
    pub status: StepStatus,
    /// Number of attempts made so far
    pub attempt_count: u32,
    /// First attempt start timestamp
    pub started_at: Option<DateTime<Utc>>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    /// Create a step from an async closure
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |input| Box::pin(f(input))),
            compensation: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_STEP_TIMEOUT,
            is_optional: false,
            requires_constitutional_check: true,
            status: StepStatus::Pending,
            attempt_count: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Attach a compensation, invoked on rollback in LIFO order
    pub fn with_compensation(mut self, compensation: StepCompensation) -> Self {
        self.compensation = Some(compensation);
        self
    }

    /// Set the retry budget
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between retries
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the step as optional (failure tolerated)
    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    /// Skip the governance pre-check for this step
    pub fn without_constitutional_check(mut self) -> Self {
        self.requires_constitutional_check = false;
        self
    }

    /// Whether another attempt is allowed within the budget
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_retries + 1
    }

    /// Invoke the step's execute closure
    pub fn invoke(&self, input: Value) -> StepFuture {
        (self.execute)(input)
    }

    /// Transition to executing, counting the attempt
    pub fn mark_executing(&mut self) -> EngineResult<()> {
        match self.status {
            StepStatus::Pending | StepStatus::Executing => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                self.status = StepStatus::Executing;
                self.attempt_count += 1;
                Ok(())
            }
            other => Err(invalid_transition(other, StepStatus::Executing)),
        }
    }

    /// Transition to completed
    pub fn mark_completed(&mut self) -> EngineResult<()> {
        match self.status {
            StepStatus::Executing => {
                self.status = StepStatus::Completed;
                self.completed_at = Some(Utc::now());
                Ok(())
            }
            other => Err(invalid_transition(other, StepStatus::Completed)),
        }
    }

    /// Transition to failed
    pub fn mark_failed(&mut self) -> EngineResult<()> {
        match self.status {
            StepStatus::Pending | StepStatus::Executing => {
                self.status = StepStatus::Failed;
                self.completed_at = Some(Utc::now());
                Ok(())
            }
            other => Err(invalid_transition(other, StepStatus::Failed)),
        }
    }

    /// Transition to skipped
    pub fn mark_skipped(&mut self) -> EngineResult<()> {
        match self.status {
            StepStatus::Pending => {
                self.status = StepStatus::Skipped;
                Ok(())
            }
            other => Err(invalid_transition(other, StepStatus::Skipped)),
        }
    }

    /// Wall time between first attempt and completion, in milliseconds
    pub fn execution_time_ms(&self) -> f64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                end.signed_duration_since(start)
                    .num_microseconds()
                    .unwrap_or(0) as f64
                    / 1000.0
            }
            _ => 0.0,
        }
    }
}

impl fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("attempt_count", &self.attempt_count)
            .field("max_retries", &self.max_retries)
            .field("is_optional", &self.is_optional)
            .finish()
    }
}

/// An idempotent action that undoes the externally observable effect of a
/// step.
///
/// Registered before the paired step executes (in the base engine and the
/// DAG executor); must be safe to invoke more than once with the same
/// idempotency key, and must not depend on forward-direction success of its
/// own step.
#[derive(Clone)]
pub struct StepCompensation {
    /// Compensation name
    pub name: String,
    execute: CompensationFn,
    /// Idempotency key; defaults to `"{workflow_id}:{name}"` when absent
    pub idempotency_key: Option<String>,
    /// Total attempt budget
    pub max_retries: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Current lifecycle state
    pub status: CompensationStatus,
}

impl StepCompensation {
    /// Create a compensation from an async closure returning a success flag
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<bool>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |input| Box::pin(f(input))),
            idempotency_key: None,
            max_retries: DEFAULT_COMPENSATION_RETRIES,
            retry_delay: Duration::from_millis(100),
            timeout: DEFAULT_COMPENSATION_TIMEOUT,
            status: CompensationStatus::Pending,
        }
    }

    /// Set an explicit idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the attempt budget
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invoke the compensation closure
    pub fn invoke(&self, input: Value) -> CompensationFuture {
        (self.execute)(input)
    }

    /// Transition to executing
    pub fn mark_executing(&mut self) {
        self.status = CompensationStatus::Executing;
    }

    /// Transition to completed
    pub fn mark_completed(&mut self) {
        self.status = CompensationStatus::Completed;
    }

    /// Transition to failed
    pub fn mark_failed(&mut self) {
        self.status = CompensationStatus::Failed;
    }
}

impl fmt::Debug for StepCompensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepCompensation")
            .field("name", &self.name)
            .field("idempotency_key", &self.idempotency_key)
            .field("max_retries", &self.max_retries)
            .field("status", &self.status)
            .finish()
    }
}

fn invalid_transition(from: StepStatus, to: StepStatus) -> WorkflowError {
    WorkflowError::InvalidStateTransition {
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_step() -> WorkflowStep {
        WorkflowStep::new("noop", |_input| async { Ok(json!("done")) })
    }

    #[tokio::test]
    async fn step_invokes_closure() {
        let step = noop_step();
        let result = step.invoke(json!({})).await.unwrap();
        assert_eq!(result, json!("done"));
    }

    #[test]
    fn step_state_machine_enforces_transitions() {
        let mut step = noop_step();
        assert_eq!(step.status, StepStatus::Pending);

        step.mark_executing().unwrap();
        assert_eq!(step.attempt_count, 1);

        // Retry re-enters executing
        step.mark_executing().unwrap();
        assert_eq!(step.attempt_count, 2);

        step.mark_completed().unwrap();
        assert_eq!(step.status, StepStatus::Completed);

        // Completed is terminal
        assert!(step.mark_executing().is_err());
        assert!(step.mark_failed().is_err());
    }

    #[test]
    fn retry_budget_counts_total_attempts() {
        let mut step = noop_step().with_retries(1);
        assert!(step.can_retry());
        step.mark_executing().unwrap();
        assert!(step.can_retry());
        step.mark_executing().unwrap();
        assert!(!step.can_retry());
    }

    #[test]
    fn zero_retries_allows_single_attempt() {
        let mut step = noop_step().with_retries(0);
        step.mark_executing().unwrap();
        assert!(!step.can_retry());
    }

    #[test]
    fn skipped_only_from_pending() {
        let mut step = noop_step();
        step.mark_executing().unwrap();
        assert!(step.mark_skipped().is_err());

        let mut fresh = noop_step();
        fresh.mark_skipped().unwrap();
        assert_eq!(fresh.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn compensation_reports_success_flag() {
        let comp = StepCompensation::new("undo", |_input| async { Ok(true) });
        assert!(comp.invoke(json!({})).await.unwrap());
    }
}
