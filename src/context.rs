//! Workflow execution context
//!
//! State container passed through workflow execution. Accumulates results
//! from each step and provides shared state. A context is owned by exactly
//! one workflow execution; only the executor's own control path mutates it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::constants::ConstitutionalHash;
use crate::error::{EngineResult, WorkflowError};

/// Context passed through workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Unique workflow instance identifier
    pub workflow_id: String,
    /// Expected governance hash for validation
    pub constitutional_hash: ConstitutionalHash,
    /// Multi-tenant isolation identifier
    pub tenant_id: Option<String>,
    /// Tracing correlation identifier
    pub correlation_id: String,
    /// Parent workflow for sub-workflows
    pub parent_workflow_id: Option<String>,
    /// Trace identifier
    pub trace_id: String,
    /// Results from completed steps (set at most once per name)
    step_results: BTreeMap<String, Value>,
    /// Accumulated errors during execution
    errors: Vec<String>,
    /// Additional context data
    pub metadata: BTreeMap<String, Value>,
    /// Workflow start timestamp
    pub started_at: DateTime<Utc>,
}

impl WorkflowContext {
    /// Create a new context for a workflow execution
    pub fn new(workflow_id: impl Into<String>, constitutional_hash: ConstitutionalHash) -> Self {
        let trace_id = Uuid::new_v4().to_string();
        Self {
            workflow_id: workflow_id.into(),
            constitutional_hash,
            tenant_id: None,
            correlation_id: trace_id.clone(),
            parent_workflow_id: None,
            trace_id,
            step_results: BTreeMap::new(),
            errors: Vec::new(),
            metadata: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Create a context with a freshly generated workflow identifier
    pub fn generate(constitutional_hash: ConstitutionalHash) -> Self {
        Self::new(Uuid::new_v4().to_string(), constitutional_hash)
    }

    /// Set the tenant identifier
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set initial metadata
    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Get result from a previously completed step
    pub fn get_step_result(&self, step_name: &str) -> Option<&Value> {
        self.step_results.get(step_name)
    }

    /// Store result from a completed step.
    ///
    /// Insertion is idempotent only when the value is identical; re-setting
    /// a different value for the same name is an error.
    pub fn set_step_result(&mut self, step_name: &str, result: Value) -> EngineResult<()> {
        if let Some(existing) = self.step_results.get(step_name) {
            if *existing == result {
                return Ok(());
            }
            return Err(WorkflowError::Validation(format!(
                "step result '{}' already set with a different value",
                step_name
            )));
        }
        self.step_results.insert(step_name.to_string(), result);
        Ok(())
    }

    /// Check if a step has completed with a result
    pub fn has_step_result(&self, step_name: &str) -> bool {
        self.step_results.contains_key(step_name)
    }

    /// All step results recorded so far
    pub fn step_results(&self) -> &BTreeMap<String, Value> {
        &self.step_results
    }

    /// Step results as a JSON object, suitable for step and compensation inputs
    pub fn step_results_value(&self) -> Value {
        Value::Object(
            self.step_results
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Add an error to the context
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Check if any errors have been recorded
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Errors recorded so far
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Elapsed time since workflow start in milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        let elapsed = Utc::now().signed_duration_since(self.started_at);
        elapsed.num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0
    }

    /// Convert to a mapping for serialization.
    ///
    /// Key order is stable; `elapsed_time_ms` is computed on read.
    pub fn to_mapping(&self) -> EngineResult<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("elapsed_time_ms".to_string(), Value::from(self.elapsed_ms()));
        }
        Ok(value)
    }

    /// Restore a context from a mapping produced by [`Self::to_mapping`]
    pub fn from_mapping(mut value: Value) -> EngineResult<Self> {
        if let Value::Object(map) = &mut value {
            map.remove("elapsed_time_ms");
        }
        serde_json::from_value(value).map_err(Into::into)
    }

    /// Create a child context for sub-workflow execution.
    ///
    /// Inherits the governance hash, tenant, correlation, trace, and a copy
    /// of the metadata; carries a back-reference to this workflow.
    pub fn create_child(&self, child_workflow_id: Option<String>) -> Self {
        let child_id = child_workflow_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(parent = %self.workflow_id, child = %child_id, "creating child context");
        Self {
            workflow_id: child_id,
            constitutional_hash: self.constitutional_hash.clone(),
            tenant_id: self.tenant_id.clone(),
            correlation_id: self.correlation_id.clone(),
            parent_workflow_id: Some(self.workflow_id.clone()),
            trace_id: self.trace_id.clone(),
            step_results: BTreeMap::new(),
            errors: Vec::new(),
            metadata: self.metadata.clone(),
            started_at: Utc::now(),
        }
    }

    /// Merge results from a child workflow context.
    ///
    /// Step results are copied under an optional prefix; the error list is
    /// extended with the child's errors.
    pub fn merge_child_results(&mut self, child: &WorkflowContext, prefix: &str) {
        for (step_name, result) in &child.step_results {
            let key = if prefix.is_empty() {
                step_name.clone()
            } else {
                format!("{}{}", prefix, step_name)
            };
            self.step_results.insert(key, result.clone());
        }
        self.errors.extend(child.errors.iter().cloned());
    }
}
