//! Workflow metric instruments
//!
//! Prometheus-style names and labels. The `metrics` facade records into
//! whatever recorder the host process installed at bootstrap; with no
//! recorder installed every call is a no-op.

use metrics::{counter, histogram};

/// Histogram of workflow run durations (labels: workflow_name, status)
pub const WORKFLOW_EXECUTION_DURATION: &str = "workflow_execution_duration";

/// Counter of workflow runs (labels: workflow_name, status)
pub const WORKFLOW_EXECUTIONS_TOTAL: &str = "workflow_executions_total";

/// Histogram of step durations (labels: workflow_name, step_name, status)
pub const WORKFLOW_STEP_DURATION: &str = "workflow_step_duration";

/// Counter of step retries (labels: workflow_name, step_name)
pub const WORKFLOW_STEP_RETRIES_TOTAL: &str = "workflow_step_retries_total";

/// Record a finished workflow run
pub fn record_workflow_execution(workflow_name: &str, status: &str, duration_secs: f64) {
    histogram!(
        WORKFLOW_EXECUTION_DURATION,
        "workflow_name" => workflow_name.to_string(),
        "status" => status.to_string()
    )
    .record(duration_secs);
    counter!(
        WORKFLOW_EXECUTIONS_TOTAL,
        "workflow_name" => workflow_name.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a finished step attempt
pub fn record_step_duration(workflow_name: &str, step_name: &str, status: &str, duration_secs: f64) {
    histogram!(
        WORKFLOW_STEP_DURATION,
        "workflow_name" => workflow_name.to_string(),
        "step_name" => step_name.to_string(),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

/// Record a step retry
pub fn record_step_retry(workflow_name: &str, step_name: &str) {
    counter!(
        WORKFLOW_STEP_RETRIES_TOTAL,
        "workflow_name" => workflow_name.to_string(),
        "step_name" => step_name.to_string()
    )
    .increment(1);
}
