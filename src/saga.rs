//! Saga engine with LIFO compensation
//!
//! Steps execute sequentially. A critical failure stops forward execution
//! and compensations run in reverse order with per-compensation retries.
//! Unlike the base engine and the DAG executor, a saga registers a step's
//! compensation only after the step succeeds: the activity has produced an
//! effect only at that point. Compensations must still be idempotent.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SagaConfig;
use crate::constants::{ConstitutionalHash, DEFAULT_STEP_TIMEOUT};
use crate::context::WorkflowContext;
use crate::error::EngineResult;
use crate::result::{WorkflowResult, WorkflowStatus};
use crate::step::{CompensationFn, StepFn};

/// A step in the saga with its compensation action
#[derive(Clone)]
pub struct SagaStep {
    /// Step name
    pub name: String,
    execute: StepFn,
    compensate: Option<CompensationFn>,
    /// Maximum execution time per attempt
    pub timeout: Duration,
    /// If true (default), failure stops the saga
    pub is_critical: bool,
    /// Idempotency key for the compensation; defaults to `"{saga_id}:{name}"`
    pub idempotency_key: Option<String>,

    /// Step result once executed
    pub result: Option<Value>,
    /// Error message on failure
    pub error: Option<String>,
    /// Execution timestamp
    pub executed_at: Option<DateTime<Utc>>,
    /// Compensation timestamp
    pub compensated_at: Option<DateTime<Utc>>,
}

impl SagaStep {
    /// Create a step from an async closure
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: std::sync::Arc::new(move |input| Box::pin(f(input))),
            compensate: None,
            timeout: DEFAULT_STEP_TIMEOUT,
            is_critical: true,
            idempotency_key: None,
            result: None,
            error: None,
            executed_at: None,
            compensated_at: None,
        }
    }

    /// Attach a compensation closure returning a success flag
    pub fn with_compensation<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<bool>> + Send + 'static,
    {
        self.compensate = Some(std::sync::Arc::new(move |input| Box::pin(f(input))));
        self
    }

    /// Set the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the step non-critical: its failure does not stop the saga
    pub fn non_critical(mut self) -> Self {
        self.is_critical = false;
        self
    }

    /// Set an explicit idempotency key for the compensation
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Whether a compensation is attached
    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }
}

impl fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("is_critical", &self.is_critical)
            .field("has_compensation", &self.compensate.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// A named snapshot of saga state, recording the work done so far.
///
/// Shared with the transaction engine: a checkpoint captures the state
/// before a risky phase and the identifiers of everything already executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint identifier
    pub checkpoint_id: String,
    /// Checkpoint name
    pub name: String,
    /// State snapshot taken when the checkpoint was created
    pub state_before: Value,
    /// Identifiers of steps or actions executed before this checkpoint
    pub executed: Vec<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Governance hash carried by the snapshot
    pub constitutional_hash: ConstitutionalHash,
}

impl Checkpoint {
    /// Create a checkpoint
    pub fn new(
        name: impl Into<String>,
        state_before: Value,
        executed: Vec<String>,
        constitutional_hash: ConstitutionalHash,
    ) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            name: name.into(),
            state_before,
            executed,
            created_at: Utc::now(),
            constitutional_hash,
        }
    }
}

/// Result of saga execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaResult {
    /// Saga identifier
    pub saga_id: String,
    /// Terminal status
    pub status: WorkflowStatus,
    /// Names of completed steps, in order
    pub steps_completed: Vec<String>,
    /// Names of failed steps
    pub steps_failed: Vec<String>,
    /// Compensations that executed successfully, in invocation order
    pub compensations_executed: Vec<String>,
    /// Compensations that failed after their retry budget
    pub compensations_failed: Vec<String>,
    /// Wall time in milliseconds
    pub execution_time_ms: f64,
    /// Governance hash the saga ran under
    pub constitutional_hash: ConstitutionalHash,
    /// Result of the last successful step on completion
    pub output: Option<Value>,
    /// Errors accumulated during execution
    pub errors: Vec<String>,
}

impl SagaResult {
    /// Convert to a mapping with stable key order
    pub fn to_mapping(&self) -> EngineResult<Value> {
        serde_json::to_value(self).map_err(Into::into)
    }

    /// Lift into a [`WorkflowResult`] with the same classification
    pub fn into_workflow_result(self) -> WorkflowResult {
        let mut result = WorkflowResult::failure(
            self.saga_id.clone(),
            self.constitutional_hash.clone(),
            self.errors.clone(),
            self.execution_time_ms,
            self.steps_completed.clone(),
            self.steps_failed.clone(),
        )
        .with_compensations(
            self.compensations_executed.clone(),
            self.compensations_failed.clone(),
        )
        .with_status(self.status);
        result.output = self.output;
        result
    }
}

/// Saga orchestrator with LIFO compensation
pub struct Saga {
    /// Saga identifier
    pub saga_id: String,
    constitutional_hash: ConstitutionalHash,
    config: SagaConfig,
    steps: Vec<SagaStep>,
    checkpoints: Vec<Checkpoint>,
}

impl Saga {
    /// Create a saga with a generated identifier
    pub fn new(constitutional_hash: ConstitutionalHash) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), constitutional_hash)
    }

    /// Create a saga with a fixed identifier
    pub fn with_id(saga_id: impl Into<String>, constitutional_hash: ConstitutionalHash) -> Self {
        Self {
            saga_id: saga_id.into(),
            constitutional_hash,
            config: SagaConfig::default(),
            steps: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    /// Replace the saga configuration
    pub fn with_config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a step
    pub fn add_step(&mut self, step: SagaStep) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Append a step, builder style
    pub fn with_step(mut self, step: SagaStep) -> Self {
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

    /// Checkpoints recorded so far
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Record a named checkpoint of the current saga state
    pub fn checkpoint(&mut self, name: impl Into<String>, state_before: Value) -> &Checkpoint {
        let executed = self
            .steps
            .iter()
            .filter(|s| s.executed_at.is_some())
            .map(|s| s.name.clone())
            .collect();
        self.checkpoints.push(Checkpoint::new(
            name,
            state_before,
            executed,
            self.constitutional_hash.clone(),
        ));
        // Just pushed
        &self.checkpoints[self.checkpoints.len() - 1]
    }

    /// Execute the saga.
    ///
    /// Steps run sequentially; a failed critical step stops forward
    /// execution and rolls back the compensation stack in LIFO order.
    pub async fn execute(&mut self, context: &mut WorkflowContext, input: &Value) -> SagaResult {
        let start = std::time::Instant::now();
        if let Err(err) = context.set_step_result("_saga_id", json!(self.saga_id)) {
            debug!(saga_id = %self.saga_id, error = %err, "saga id already recorded");
        }

        let mut steps_completed: Vec<String> = Vec::new();
        let mut steps_failed: Vec<String> = Vec::new();
        let mut compensation_stack: Vec<usize> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        info!(saga_id = %self.saga_id, steps = self.steps.len(), "starting saga");

        for index in 0..self.steps.len() {
            let success = self.execute_step(index, context, input).await;
            let step = &self.steps[index];

            if success {
                steps_completed.push(step.name.clone());
                // Register compensation after success: only now has the
                // step produced an effect worth undoing.
                if step.has_compensation() {
                    compensation_stack.push(index);
                }
            } else {
                steps_failed.push(step.name.clone());
                errors.push(format!(
                    "step '{}' failed: {}",
                    step.name,
                    step.error.as_deref().unwrap_or("unknown error")
                ));
                if step.is_critical {
                    warn!(
                        saga_id = %self.saga_id,
                        step = %step.name,
                        "critical step failed, initiating compensation"
                    );
                    break;
                }
            }
        }

        let critical_failed = self
            .steps
            .iter()
            .any(|s| s.is_critical && steps_failed.contains(&s.name));

        let mut compensations_executed = Vec::new();
        let mut compensations_failed = Vec::new();

        if critical_failed && !compensation_stack.is_empty() {
            if self.config.checkpoint_before_compensation {
                let snapshot = context.step_results_value();
                self.checkpoint("pre_compensation", snapshot);
            }
            let (executed, failed) = self
                .run_compensations(&compensation_stack, context, input)
                .await;
            compensations_executed = executed;
            compensations_failed = failed;
            errors.extend(
                compensations_failed
                    .iter()
                    .map(|name| format!("compensation '{}' failed", name)),
            );
        }

        let status = self.classify(critical_failed, &compensations_executed, &compensations_failed);
        let output = if status == WorkflowStatus::Completed {
            steps_completed
                .last()
                .and_then(|name| self.steps.iter().find(|s| &s.name == name))
                .and_then(|s| s.result.clone())
        } else {
            None
        };

        let execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            saga_id = %self.saga_id,
            status = status.as_str(),
            completed = steps_completed.len(),
            failed = steps_failed.len(),
            elapsed_ms = execution_time_ms,
            "saga finished"
        );

        SagaResult {
            saga_id: self.saga_id.clone(),
            status,
            steps_completed,
            steps_failed,
            compensations_executed,
            compensations_failed,
            execution_time_ms,
            constitutional_hash: self.constitutional_hash.clone(),
            output,
            errors,
        }
    }

    async fn execute_step(
        &mut self,
        index: usize,
        context: &mut WorkflowContext,
        input: &Value,
    ) -> bool {
        let step_input = self.build_step_input(index, context, input, None);
        let step = &mut self.steps[index];
        debug!(saga_id = %self.saga_id, step = %step.name, "executing saga step");

        match tokio::time::timeout(step.timeout, (step.execute)(step_input)).await {
            Ok(Ok(result)) => {
                step.result = Some(result.clone());
                step.executed_at = Some(Utc::now());
                let name = step.name.clone();
                if let Err(err) = context.set_step_result(&name, result) {
                    warn!(saga_id = %self.saga_id, step = %name, error = %err, "result not recorded");
                }
                debug!(saga_id = %self.saga_id, step = %name, "saga step completed");
                true
            }
            Ok(Err(err)) => {
                step.error = Some(err.to_string());
                warn!(saga_id = %self.saga_id, step = %step.name, error = %err, "saga step failed");
                false
            }
            Err(_) => {
                step.error = Some(format!("timeout after {}s", step.timeout.as_secs()));
                warn!(saga_id = %self.saga_id, step = %step.name, "saga step timed out");
                false
            }
        }
    }

    async fn run_compensations(
        &mut self,
        stack: &[usize],
        context: &mut WorkflowContext,
        input: &Value,
    ) -> (Vec<String>, Vec<String>) {
        let mut executed = Vec::new();
        let mut failed = Vec::new();

        info!(saga_id = %self.saga_id, count = stack.len(), "running saga compensations");

        for &index in stack.iter().rev() {
            let success = self.execute_compensation(index, context, input).await;
            let name = self.steps[index].name.clone();
            if success {
                executed.push(name);
            } else {
                failed.push(name);
            }
        }

        (executed, failed)
    }

    async fn execute_compensation(
        &mut self,
        index: usize,
        context: &mut WorkflowContext,
        input: &Value,
    ) -> bool {
        let idempotency_key = self.steps[index]
            .idempotency_key
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.saga_id, self.steps[index].name));
        let comp_input = self.build_step_input(index, context, input, Some(idempotency_key));

        let max_attempts = self.config.max_compensation_retries.max(1);
        let timeout = self.config.compensation_timeout();
        let step = &mut self.steps[index];
        let compensate = match &step.compensate {
            Some(f) => f.clone(),
            None => return true,
        };

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(timeout, compensate(comp_input.clone())).await {
                Ok(Ok(true)) => {
                    step.compensated_at = Some(Utc::now());
                    info!(saga_id = %self.saga_id, step = %step.name, "compensation completed");
                    return true;
                }
                Ok(Ok(false)) => warn!(
                    saga_id = %self.saga_id,
                    step = %step.name,
                    attempt,
                    max_attempts,
                    "compensation reported failure"
                ),
                Ok(Err(err)) => warn!(
                    saga_id = %self.saga_id,
                    step = %step.name,
                    attempt,
                    max_attempts,
                    error = %err,
                    "compensation failed"
                ),
                Err(_) => warn!(
                    saga_id = %self.saga_id,
                    step = %step.name,
                    attempt,
                    max_attempts,
                    "compensation timed out"
                ),
            }
        }

        error!(
            saga_id = %self.saga_id,
            step = %self.steps[index].name,
            attempts = max_attempts,
            "compensation exhausted its retry budget"
        );
        false
    }

    fn build_step_input(
        &self,
        index: usize,
        context: &WorkflowContext,
        input: &Value,
        idempotency_key: Option<String>,
    ) -> Value {
        let step = &self.steps[index];
        let mut map = match input {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other.clone());
                map
            }
        };
        map.insert("saga_id".to_string(), json!(self.saga_id));
        map.insert("step_name".to_string(), json!(step.name));
        map.insert("context".to_string(), context.step_results_value());
        map.insert(
            "constitutional_hash".to_string(),
            json!(self.constitutional_hash.as_str()),
        );
        if let Some(result) = &step.result {
            map.insert("step_result".to_string(), result.clone());
        }
        if let Some(key) = idempotency_key {
            map.insert("idempotency_key".to_string(), json!(key));
        }
        Value::Object(map)
    }

    fn classify(
        &self,
        critical_failed: bool,
        compensations_executed: &[String],
        compensations_failed: &[String],
    ) -> WorkflowStatus {
        if !critical_failed {
            return WorkflowStatus::Completed;
        }
        if compensations_executed.is_empty() && compensations_failed.is_empty() {
            return WorkflowStatus::Failed;
        }
        if !compensations_failed.is_empty() {
            return WorkflowStatus::PartiallyCompensated;
        }
        WorkflowStatus::Compensated
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::WorkflowError;
    use std::sync::Arc;

    fn hash() -> ConstitutionalHash {
        ConstitutionalHash::new("cdd01ef066bc6cf2").unwrap()
    }

    fn context() -> WorkflowContext {
        WorkflowContext::generate(hash())
    }

    #[tokio::test]
    async fn happy_path_returns_last_output() {
        let mut saga = Saga::with_id("happy", hash())
            .with_step(SagaStep::new("a", |_| async { Ok(json!("a")) }))
            .with_step(SagaStep::new("b", |_| async { Ok(json!("b")) }))
            .with_step(SagaStep::new("c", |_| async { Ok(json!("c")) }));

        let mut ctx = context();
        let result = saga.execute(&mut ctx, &json!({})).await;

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps_completed, vec!["a", "b", "c"]);
        assert_eq!(result.output, Some(json!("c")));
        assert!(result.compensations_executed.is_empty());
    }

    #[tokio::test]
    async fn critical_failure_compensates_in_lifo_order() {
        let order: Arc<parking_lot::Mutex<Vec<String>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        let track = |name: &str, order: &Arc<parking_lot::Mutex<Vec<String>>>| {
            let order = order.clone();
            let name = name.to_string();
            move |_input: Value| {
                let order = order.clone();
                let name = name.clone();
                async move {
                    order.lock().push(name);
                    Ok(true)
                }
            }
        };

        let mut saga = Saga::with_id("rollback", hash())
            .with_step(
                SagaStep::new("a", |_| async { Ok(json!("a")) })
                    .with_compensation(track("undo_a", &order)),
            )
            .with_step(
                SagaStep::new("b", |_| async { Ok(json!("b")) })
                    .with_compensation(track("undo_b", &order)),
            )
            .with_step(SagaStep::new("c", |_| async {
                Err(WorkflowError::StepFailed {
                    step: "c".to_string(),
                    reason: "boom".to_string(),
                })
            }));

        let mut ctx = context();
        let result = saga.execute(&mut ctx, &json!({})).await;

        assert_eq!(result.status, WorkflowStatus::Compensated);
        assert_eq!(result.steps_completed, vec!["a", "b"]);
        assert_eq!(result.steps_failed, vec!["c"]);
        assert_eq!(result.compensations_executed, vec!["undo_b", "undo_a"]);
        assert_eq!(*order.lock(), vec!["undo_b", "undo_a"]);
    }

    #[tokio::test]
    async fn failed_compensation_yields_partial() {
        let mut saga = Saga::with_id("partial", hash())
            .with_config(SagaConfig {
                max_compensation_retries: 1,
                ..Default::default()
            })
            .with_step(
                SagaStep::new("a", |_| async { Ok(json!("a")) })
                    .with_compensation(|_| async { Ok(true) }),
            )
            .with_step(
                SagaStep::new("b", |_| async { Ok(json!("b")) })
                    .with_compensation(|_| async { Ok(false) }),
            )
            .with_step(SagaStep::new("c", |_| async {
                Err(WorkflowError::StepFailed {
                    step: "c".to_string(),
                    reason: "boom".to_string(),
                })
            }));

        let mut ctx = context();
        let result = saga.execute(&mut ctx, &json!({})).await;

        assert_eq!(result.status, WorkflowStatus::PartiallyCompensated);
        assert_eq!(result.compensations_executed, vec!["a"]);
        assert_eq!(result.compensations_failed, vec!["b"]);
    }

    #[tokio::test]
    async fn non_critical_failure_continues() {
        let mut saga = Saga::with_id("tolerant", hash())
            .with_step(SagaStep::new("a", |_| async { Ok(json!("a")) }))
            .with_step(
                SagaStep::new("optional", |_| async {
                    Err(WorkflowError::StepFailed {
                        step: "optional".to_string(),
                        reason: "flaky".to_string(),
                    })
                })
                .non_critical(),
            )
            .with_step(SagaStep::new("b", |_| async { Ok(json!("b")) }));

        let mut ctx = context();
        let result = saga.execute(&mut ctx, &json!({})).await;

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps_completed, vec!["a", "b"]);
        assert_eq!(result.steps_failed, vec!["optional"]);
        assert_eq!(result.output, Some(json!("b")));
    }

    #[tokio::test]
    async fn failure_without_compensations_is_failed() {
        let mut saga = Saga::with_id("bare", hash()).with_step(SagaStep::new("a", |_| async {
            Err(WorkflowError::StepFailed {
                step: "a".to_string(),
                reason: "boom".to_string(),
            })
        }));

        let mut ctx = context();
        let result = saga.execute(&mut ctx, &json!({})).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn checkpoint_records_executed_steps() {
        let mut saga = Saga::with_id("checkpointed", hash())
            .with_step(
                SagaStep::new("a", |_| async { Ok(json!("a")) })
                    .with_compensation(|_| async { Ok(true) }),
            )
            .with_step(SagaStep::new("b", |_| async {
                Err(WorkflowError::StepFailed {
                    step: "b".to_string(),
                    reason: "boom".to_string(),
                })
            }));

        let mut ctx = context();
        let result = saga.execute(&mut ctx, &json!({})).await;
        assert_eq!(result.status, WorkflowStatus::Compensated);

        // Automatic pre-compensation checkpoint captured the executed steps
        let checkpoint = &saga.checkpoints()[0];
        assert_eq!(checkpoint.name, "pre_compensation");
        assert_eq!(checkpoint.executed, vec!["a"]);
        assert!(checkpoint.state_before.get("a").is_some());
    }

    #[tokio::test]
    async fn step_results_visible_downstream() {
        let mut saga = Saga::with_id("chained", hash())
            .with_step(SagaStep::new("produce", |_| async { Ok(json!(21)) }))
            .with_step(SagaStep::new("consume", |input: Value| async move {
                let prior = input["context"]["produce"].as_i64().unwrap_or(0);
                Ok(json!(prior * 2))
            }));

        let mut ctx = context();
        let result = saga.execute(&mut ctx, &json!({})).await;
        assert_eq!(result.output, Some(json!(42)));
    }
}
