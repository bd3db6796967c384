//! Base workflow engine
//!
//! Composition instead of inheritance: a [`WorkflowEngine`] runs any
//! [`Workflow`] implementation, providing overall timeout wrapping,
//! cooperative cancellation, step retries, LIFO compensation, best-effort
//! audit recording, and metrics emission. `run` never raises to the caller;
//! it always returns a [`WorkflowResult`] for inspection.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activities::Activities;
use crate::config::WorkflowConfig;
use crate::constants::ConstitutionalHash;
use crate::context::WorkflowContext;
use crate::error::{EngineResult, WorkflowError};
use crate::observability::metrics;
use crate::result::{WorkflowResult, WorkflowStatus};
use crate::step::{StepCompensation, WorkflowStep};

/// A workflow body executed by the engine.
///
/// Implementations drive their steps through the [`WorkflowRun`] handle and
/// return the workflow output. Errors bubbling out of `execute` put the run
/// on the failure path: compensations execute in LIFO order and the caller
/// receives a failure-class result.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Workflow name used in metrics and logs
    fn name(&self) -> &str;

    /// Fixed workflow instance identifier; generated per run when `None`
    fn workflow_id(&self) -> Option<String> {
        None
    }

    /// Workflow body
    async fn execute(&self, run: &mut WorkflowRun<'_>, input: &Value) -> EngineResult<Value>;
}

/// Engine executing workflows under governance contracts.
///
/// Holds the activity boundary, the run configuration, and the expected
/// governance hash, all injected at construction.
pub struct WorkflowEngine {
    activities: Arc<dyn Activities>,
    config: WorkflowConfig,
    expected_hash: ConstitutionalHash,
}

impl WorkflowEngine {
    /// Create an engine with the default configuration
    pub fn new(activities: Arc<dyn Activities>, expected_hash: ConstitutionalHash) -> Self {
        Self {
            activities,
            config: WorkflowConfig::default(),
            expected_hash,
        }
    }

    /// Replace the run configuration
    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Activity boundary
    pub fn activities(&self) -> &Arc<dyn Activities> {
        &self.activities
    }

    /// Run configuration
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Expected governance hash
    pub fn expected_hash(&self) -> &ConstitutionalHash {
        &self.expected_hash
    }

    /// Run a workflow to completion
    pub async fn run(&self, workflow: &dyn Workflow, input: Value) -> WorkflowResult {
        self.run_with_cancellation(workflow, input, CancellationToken::new())
            .await
    }

    /// Run a workflow, honoring an external cancellation signal.
    ///
    /// Cancellation is cooperative and never bypasses the compensation
    /// pass: registered compensations run after the body is dropped.
    pub async fn run_with_cancellation(
        &self,
        workflow: &dyn Workflow,
        input: Value,
        cancel: CancellationToken,
    ) -> WorkflowResult {
        let workflow_id = workflow
            .workflow_id()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let workflow_name = workflow.name().to_string();

        let mut run = WorkflowRun::new(self, workflow_name.clone(), workflow_id.clone());
        run.context
            .metadata
            .insert("input".to_string(), input.clone());
        run.status = WorkflowStatus::Executing;
        info!(workflow_id = %workflow_id, workflow = %workflow_name, "starting workflow");

        let overall_timeout = self.config.timeout();
        let outcome = {
            let body = tokio::time::timeout(overall_timeout, workflow.execute(&mut run, &input));
            tokio::select! {
                _ = cancel.cancelled() => RunOutcome::Cancelled,
                res = body => match res {
                    Ok(Ok(output)) => RunOutcome::Completed(output),
                    Ok(Err(err)) => RunOutcome::Failed(err),
                    Err(_) => RunOutcome::TimedOut,
                },
            }
        };

        let result = match outcome {
            RunOutcome::Completed(output) => {
                run.status = WorkflowStatus::Completed;
                let elapsed_ms = run.elapsed_ms();
                let audit_id = if self.config.enable_audit_trail {
                    self.record_completion_audit(&run, &output, elapsed_ms).await
                } else {
                    None
                };
                info!(
                    workflow_id = %workflow_id,
                    elapsed_ms,
                    steps = run.completed_steps.len(),
                    "workflow completed"
                );
                WorkflowResult::success(
                    &workflow_id,
                    self.expected_hash.clone(),
                    output,
                    elapsed_ms,
                    run.completed_steps.clone(),
                )
                .with_audit_id(audit_id)
            }
            RunOutcome::Failed(err) => {
                run.status = WorkflowStatus::Failed;
                let err_text = err.to_string();
                if !run.errors.iter().any(|e| e.contains(err_text.as_str())) {
                    run.errors.push(err_text);
                }
                error!(workflow_id = %workflow_id, error = %err, "workflow failed");
                let (executed, failed) = run.run_compensations().await;
                let status = run.status;
                WorkflowResult::failure(
                    &workflow_id,
                    self.expected_hash.clone(),
                    run.errors.clone(),
                    run.elapsed_ms(),
                    run.completed_steps.clone(),
                    run.failed_steps.clone(),
                )
                .with_compensations(executed, failed)
                .with_status(status)
            }
            RunOutcome::TimedOut => {
                run.status = WorkflowStatus::TimedOut;
                run.errors.push(format!(
                    "workflow timed out after {}s",
                    overall_timeout.as_secs()
                ));
                warn!(workflow_id = %workflow_id, timeout_secs = overall_timeout.as_secs(), "workflow timed out");
                let (executed, failed) = run.run_compensations().await;
                WorkflowResult::timeout(
                    &workflow_id,
                    self.expected_hash.clone(),
                    run.errors.clone(),
                    run.elapsed_ms(),
                    run.completed_steps.clone(),
                )
                .with_steps_failed(run.failed_steps.clone())
                .with_compensations(executed, failed)
            }
            RunOutcome::Cancelled => {
                run.status = WorkflowStatus::Cancelled;
                run.errors.push(WorkflowError::Cancelled.to_string());
                warn!(workflow_id = %workflow_id, "workflow cancelled");
                let (executed, failed) = run.run_compensations().await;
                WorkflowResult::cancelled(
                    &workflow_id,
                    self.expected_hash.clone(),
                    run.errors.clone(),
                    run.elapsed_ms(),
                    run.completed_steps.clone(),
                )
                .with_steps_failed(run.failed_steps.clone())
                .with_compensations(executed, failed)
            }
        };

        if self.config.enable_metrics {
            metrics::record_workflow_execution(
                &workflow_name,
                result.status.as_str(),
                result.execution_time_ms / 1000.0,
            );
        }

        result
    }

    async fn record_completion_audit(
        &self,
        run: &WorkflowRun<'_>,
        output: &Value,
        elapsed_ms: f64,
    ) -> Option<String> {
        let event = json!({
            "workflow_id": run.workflow_id(),
            "event_type": "workflow_completed",
            "output": output,
            "steps_completed": run.completed_steps,
            "execution_time_ms": elapsed_ms,
            "governance_hash": self.expected_hash.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        match self
            .activities
            .record_audit(run.workflow_id(), "workflow_completed", &event)
            .await
        {
            Ok(audit_id) => Some(audit_id),
            Err(err) => {
                warn!(workflow_id = %run.workflow_id(), error = %err, "audit recording failed");
                None
            }
        }
    }
}

enum RunOutcome {
    Completed(Value),
    Failed(WorkflowError),
    TimedOut,
    Cancelled,
}

/// Per-execution state handle passed to a workflow body.
///
/// Owns the context and the compensation stack. The stack is mutated only
/// from the executor's control path; no suspension occurs during push/pop.
pub struct WorkflowRun<'a> {
    engine: &'a WorkflowEngine,
    workflow_name: String,
    context: WorkflowContext,
    compensations: Vec<StepCompensation>,
    completed_steps: Vec<String>,
    failed_steps: Vec<String>,
    errors: Vec<String>,
    status: WorkflowStatus,
    start: Instant,
}

impl<'a> WorkflowRun<'a> {
    fn new(engine: &'a WorkflowEngine, workflow_name: String, workflow_id: String) -> Self {
        Self {
            context: WorkflowContext::new(workflow_id, engine.expected_hash.clone()),
            engine,
            workflow_name,
            compensations: Vec::new(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            errors: Vec::new(),
            status: WorkflowStatus::Pending,
            start: Instant::now(),
        }
    }

    /// Workflow instance identifier
    pub fn workflow_id(&self) -> &str {
        &self.context.workflow_id
    }

    /// Workflow name
    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    /// Execution context
    pub fn context(&self) -> &WorkflowContext {
        &self.context
    }

    /// Mutable execution context
    pub fn context_mut(&mut self) -> &mut WorkflowContext {
        &mut self.context
    }

    /// Activity boundary
    pub fn activities(&self) -> &Arc<dyn Activities> {
        &self.engine.activities
    }

    /// Expected governance hash
    pub fn expected_hash(&self) -> &ConstitutionalHash {
        &self.engine.expected_hash
    }

    /// Current run status
    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    /// Names of completed steps, in completion order
    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    /// Names of failed steps
    pub fn failed_steps(&self) -> &[String] {
        &self.failed_steps
    }

    /// Errors accumulated so far
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Wall time since the run started, in milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Record an error against the run
    pub fn add_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.context.add_error(error.clone());
        self.errors.push(error);
    }

    /// Record a named step as completed outside of `run_step`
    pub fn record_step_success(&mut self, name: impl Into<String>) {
        self.completed_steps.push(name.into());
    }

    /// Record a named step as failed outside of `run_step`
    pub fn record_step_failure(&mut self, name: impl Into<String>) {
        self.failed_steps.push(name.into());
    }

    /// Register a compensation action.
    ///
    /// Must be called before the operation that needs compensation.
    /// Compensations execute in LIFO order on the failure path.
    pub fn register_compensation(&mut self, compensation: StepCompensation) {
        self.compensations.push(compensation);
    }

    /// Validate the governance hash through the activity boundary.
    ///
    /// Uses the expected hash when no provided value is given. With the
    /// fail-closed policy (default) a mismatch is an error; with fail-open
    /// the mismatch is recorded, logged at warn level, and `false` is
    /// returned.
    pub async fn validate_constitutional_hash(
        &mut self,
        provided: Option<&str>,
    ) -> EngineResult<bool> {
        let expected = self.engine.expected_hash.clone();
        let provided_value = provided.unwrap_or_else(|| expected.as_str()).to_string();

        let validation = self
            .engine
            .activities
            .validate_constitutional_hash(&self.context.workflow_id, &provided_value, &expected)
            .await?;

        if validation.is_valid {
            debug!(workflow_id = %self.context.workflow_id, "constitutional validation passed");
            return Ok(true);
        }

        for err in &validation.errors {
            self.add_error(err.clone());
        }

        if self.engine.config.failure_policy.is_fail_closed() {
            return Err(WorkflowError::ConstitutionalMismatch {
                expected: expected.to_string(),
                actual: provided_value,
            });
        }

        warn!(
            workflow_id = %self.context.workflow_id,
            "constitutional validation failed but failure policy is fail_open, continuing"
        );
        Ok(false)
    }

    /// Execute a single workflow step.
    ///
    /// Performs the governance pre-check when the step requires it,
    /// registers the step's compensation before entering the retry loop,
    /// and retries on error or per-attempt timeout up to the step's budget.
    /// Returns `Ok(None)` when an optional step exhausted its budget; a
    /// non-optional exhaustion re-raises the last error.
    pub async fn run_step(
        &mut self,
        step: &mut WorkflowStep,
        input: &Value,
    ) -> EngineResult<Option<Value>> {
        if step.requires_constitutional_check
            && self.engine.config.require_constitutional_validation
        {
            self.validate_constitutional_hash(None).await?;
        }

        // Register compensation before executing: it must already be on the
        // stack if the attempt fails mid-effect.
        if let Some(compensation) = step.compensation.clone() {
            self.compensations.push(compensation);
        }

        let mut last_error: Option<WorkflowError> = None;

        while step.can_retry() {
            step.mark_executing()?;
            let step_input = json!({
                "workflow_id": self.context.workflow_id,
                "step_name": step.name,
                "attempt": step.attempt_count,
                "input": input,
                "context": self.context.step_results_value(),
                "constitutional_hash": self.engine.expected_hash.as_str(),
            });

            match tokio::time::timeout(step.timeout, step.invoke(step_input)).await {
                Ok(Ok(result)) => {
                    step.mark_completed()?;
                    self.completed_steps.push(step.name.clone());
                    self.context.set_step_result(&step.name, result.clone())?;
                    info!(
                        workflow_id = %self.context.workflow_id,
                        step = %step.name,
                        attempt = step.attempt_count,
                        elapsed_ms = step.execution_time_ms(),
                        "step completed"
                    );
                    if self.engine.config.enable_metrics {
                        metrics::record_step_duration(
                            &self.workflow_name,
                            &step.name,
                            "completed",
                            step.execution_time_ms() / 1000.0,
                        );
                    }
                    return Ok(Some(result));
                }
                Ok(Err(err)) => {
                    warn!(
                        workflow_id = %self.context.workflow_id,
                        step = %step.name,
                        attempt = step.attempt_count,
                        error = %err,
                        "step failed"
                    );
                    last_error = Some(err);
                }
                Err(_) => {
                    warn!(
                        workflow_id = %self.context.workflow_id,
                        step = %step.name,
                        attempt = step.attempt_count,
                        "step timed out"
                    );
                    last_error = Some(WorkflowError::StepTimeout {
                        step: step.name.clone(),
                        timeout_secs: step.timeout.as_secs(),
                    });
                }
            }

            if step.can_retry() {
                if self.engine.config.enable_metrics {
                    metrics::record_step_retry(&self.workflow_name, &step.name);
                }
                tokio::time::sleep(step.retry_delay).await;
            }
        }

        step.mark_failed()?;
        self.failed_steps.push(step.name.clone());
        let err = last_error.unwrap_or_else(|| WorkflowError::StepFailed {
            step: step.name.clone(),
            reason: "retry budget exhausted".to_string(),
        });
        self.add_error(format!("step '{}' failed: {}", step.name, err));
        if self.engine.config.enable_metrics {
            metrics::record_step_duration(
                &self.workflow_name,
                &step.name,
                "failed",
                step.execution_time_ms() / 1000.0,
            );
        }

        if step.is_optional {
            warn!(
                workflow_id = %self.context.workflow_id,
                step = %step.name,
                "optional step failed, continuing"
            );
            return Ok(None);
        }
        Err(err)
    }

    /// Execute registered compensations in reverse order (LIFO).
    ///
    /// Each compensation runs under its own timeout with its own retry
    /// budget. The run status becomes `compensated` when all succeed,
    /// `partially_compensated` otherwise; with an empty stack the status is
    /// left untouched. Compensation errors are recorded, never propagated.
    pub async fn run_compensations(&mut self) -> (Vec<String>, Vec<String>) {
        if self.compensations.is_empty() {
            return (Vec::new(), Vec::new());
        }

        self.status = WorkflowStatus::Compensating;
        info!(
            workflow_id = %self.context.workflow_id,
            count = self.compensations.len(),
            "running compensations"
        );

        let mut stack = std::mem::take(&mut self.compensations);
        let snapshot = self.context.step_results_value();
        let mut executed = Vec::new();
        let mut failed = Vec::new();

        for compensation in stack.iter_mut().rev() {
            let idempotency_key = compensation.idempotency_key.clone().unwrap_or_else(|| {
                format!("{}:{}", self.context.workflow_id, compensation.name)
            });
            let comp_input = json!({
                "workflow_id": self.context.workflow_id,
                "compensation_name": compensation.name,
                "context": snapshot,
                "idempotency_key": idempotency_key,
            });

            compensation.mark_executing();
            let attempts = compensation.max_retries.max(1);
            let mut success = false;
            for attempt in 0..attempts {
                match tokio::time::timeout(
                    compensation.timeout,
                    compensation.invoke(comp_input.clone()),
                )
                .await
                {
                    Ok(Ok(true)) => {
                        success = true;
                        break;
                    }
                    Ok(Ok(false)) => warn!(
                        compensation = %compensation.name,
                        attempt = attempt + 1,
                        "compensation reported failure"
                    ),
                    Ok(Err(err)) => warn!(
                        compensation = %compensation.name,
                        attempt = attempt + 1,
                        error = %err,
                        "compensation failed"
                    ),
                    Err(_) => warn!(
                        compensation = %compensation.name,
                        attempt = attempt + 1,
                        "compensation timed out"
                    ),
                }
                if attempt + 1 < attempts {
                    tokio::time::sleep(compensation.retry_delay).await;
                }
            }

            if success {
                compensation.mark_completed();
                executed.push(compensation.name.clone());
                info!(compensation = %compensation.name, "compensation completed");
            } else {
                compensation.mark_failed();
                failed.push(compensation.name.clone());
                let message = format!("compensation '{}' failed", compensation.name);
                error!(workflow_id = %self.context.workflow_id, "{}", message);
                self.errors.push(message.clone());
                self.context.add_error(message);
            }
        }

        self.compensations = stack;
        self.status = if failed.is_empty() {
            WorkflowStatus::Compensated
        } else {
            WorkflowStatus::PartiallyCompensated
        };
        (executed, failed)
    }
}

/// Workflow built from an ordered list of step prototypes.
///
/// Each run clones the prototypes so runtime state never leaks between
/// executions. The output is the result of the last completed step.
pub struct SequentialWorkflow {
    name: String,
    workflow_id: Option<String>,
    steps: Vec<WorkflowStep>,
}

impl SequentialWorkflow {
    /// Create an empty sequential workflow
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workflow_id: None,
            steps: Vec::new(),
        }
    }

    /// Fix the workflow instance identifier
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Append a step
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Number of configured steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no steps are configured
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl Workflow for SequentialWorkflow {
    fn name(&self) -> &str {
        &self.name
    }

    fn workflow_id(&self) -> Option<String> {
        self.workflow_id.clone()
    }

    async fn execute(&self, run: &mut WorkflowRun<'_>, input: &Value) -> EngineResult<Value> {
        let mut output = Value::Null;
        for prototype in &self.steps {
            let mut step = prototype.clone();
            if let Some(value) = run.run_step(&mut step, input).await? {
                output = value;
            }
        }
        Ok(output)
    }
}
