//! Configuration for workflow execution
//!
//! All configuration is injected; the engine reads no environment variables
//! and holds no process-wide state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineResult, WorkflowError};

/// Workflow execution patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    /// Ordered steps on the base engine
    Sequential,
    /// Independent steps executed concurrently
    Parallel,
    /// Dependency-scheduled graph
    Dag,
    /// Sequential steps with LIFO compensation
    Saga,
    /// Stateful graph with conditional edges
    Cyclic,
}

/// How to handle governance and validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reject on any failure (default, secure)
    FailClosed,
    /// Record a warning and continue; unsuitable for production
    FailOpen,
    /// Run compensations on failure
    Compensate,
}

impl FailurePolicy {
    /// Whether governance failures reject the operation
    pub fn is_fail_closed(&self) -> bool {
        !matches!(self, FailurePolicy::FailOpen)
    }
}

/// Configuration for a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Maximum workflow execution time in seconds
    pub timeout_seconds: u64,
    /// Maximum retry attempts per step (beyond the first)
    pub max_retries: u32,
    /// Base delay between step retries in seconds
    pub retry_delay_seconds: f64,
    /// Enforce the governance hash check before steps that require it
    pub require_constitutional_validation: bool,
    /// Record audit events on completion
    pub enable_audit_trail: bool,
    /// How to handle failures
    pub failure_policy: FailurePolicy,
    /// Emit workflow and step metrics
    pub enable_metrics: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            max_retries: 3,
            retry_delay_seconds: 1.0,
            require_constitutional_validation: true,
            enable_audit_trail: true,
            failure_policy: FailurePolicy::FailClosed,
            enable_metrics: true,
        }
    }
}

impl WorkflowConfig {
    /// Overall timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Retry delay as a duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_seconds)
    }

    /// Validate the configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.timeout_seconds == 0 {
            return Err(WorkflowError::Validation(
                "workflow timeout must be positive".to_string(),
            ));
        }
        if self.retry_delay_seconds < 0.0 {
            return Err(WorkflowError::Validation(
                "retry delay must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for individual workflow steps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Maximum step execution time per attempt, in seconds
    pub timeout_seconds: u64,
    /// Maximum retry attempts beyond the first
    pub max_retries: u32,
    /// Delay between retries in seconds
    pub retry_delay_seconds: f64,
    /// Whether step failure is tolerated
    pub is_optional: bool,
    /// Validate the governance hash before the step
    pub requires_constitutional_check: bool,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_seconds: 1.0,
            is_optional: false,
            requires_constitutional_check: true,
        }
    }
}

impl StepConfig {
    /// Per-attempt timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Retry delay as a duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_seconds)
    }
}

/// Configuration for DAG execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DagConfig {
    /// Maximum concurrently executing nodes
    pub max_parallel_nodes: usize,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
        }
    }
}

/// Configuration for saga execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Maximum time per compensation attempt, in seconds
    pub compensation_timeout_seconds: u64,
    /// Total attempts per failed compensation
    pub max_compensation_retries: u32,
    /// Snapshot state before starting a rollback
    pub checkpoint_before_compensation: bool,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            compensation_timeout_seconds: 60,
            max_compensation_retries: 3,
            checkpoint_before_compensation: true,
        }
    }
}

impl SagaConfig {
    /// Compensation timeout as a duration
    pub fn compensation_timeout(&self) -> Duration {
        Duration::from_secs(self.compensation_timeout_seconds)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_fail_closed() {
        let config = WorkflowConfig::default();
        assert!(config.failure_policy.is_fail_closed());
        assert!(config.require_constitutional_validation);
        assert_eq!(config.timeout_seconds, 300);
        config.validate().unwrap();
    }

    #[test]
    fn compensate_policy_is_still_fail_closed() {
        assert!(FailurePolicy::Compensate.is_fail_closed());
        assert!(!FailurePolicy::FailOpen.is_fail_closed());
    }

    #[test]
    fn rejects_zero_timeout() {
        let config = WorkflowConfig {
            timeout_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_from_partial_mapping() {
        let config: WorkflowConfig =
            serde_json::from_value(serde_json::json!({"max_retries": 1})).unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.timeout_seconds, 300);
    }
}
