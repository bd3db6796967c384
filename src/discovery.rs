//! Agent discovery workflow
//!
//! Finds suitable agents by capability, availability, and reputation
//! through the agent directory activity.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::workflow::{Workflow, WorkflowRun};

/// Workflow discovering agents that meet given criteria
pub struct AgentDiscoveryWorkflow {
    workflow_id: Option<String>,
}

impl Default for AgentDiscoveryWorkflow {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentDiscoveryWorkflow {
    /// Create a discovery workflow
    pub fn new() -> Self {
        Self { workflow_id: None }
    }

    /// Fix the workflow instance identifier
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

#[async_trait]
impl Workflow for AgentDiscoveryWorkflow {
    fn name(&self) -> &str {
        "discovery"
    }

    fn workflow_id(&self) -> Option<String> {
        self.workflow_id.clone()
    }

    /// Expected input: `required_capabilities`, optional `min_reputation`,
    /// `status` (default `active`) and `max_results` (default 10).
    async fn execute(&self, run: &mut WorkflowRun<'_>, input: &Value) -> EngineResult<Value> {
        run.validate_constitutional_hash(None).await?;

        let required_capabilities: Vec<String> = input
            .get("required_capabilities")
            .and_then(|v| v.as_array())
            .map(|caps| {
                caps.iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let min_reputation = input
            .get("min_reputation")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let status = input
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("active");
        let max_results = input
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(10) as usize;

        info!(
            workflow_id = %run.workflow_id(),
            capabilities = ?required_capabilities,
            min_reputation,
            "searching for agents"
        );

        let agents = run
            .activities()
            .list_agents(&required_capabilities, Some(status))
            .await?;
        run.record_step_success("query_directory");

        let total_found = agents.len();
        let mut qualified: Vec<_> = agents
            .into_iter()
            .filter(|a| a.reputation_score >= min_reputation)
            .collect();
        run.record_step_success("filter_results");

        // Reputation descending, then latency ascending
        qualified.sort_by(|a, b| {
            b.reputation_score
                .partial_cmp(&a.reputation_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.latency_ms.cmp(&b.latency_ms))
        });
        run.record_step_success("sort_results");

        qualified.truncate(max_results);
        let results: Vec<Value> = qualified
            .iter()
            .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
            .collect();

        Ok(json!({
            "discovery_id": Uuid::new_v4().to_string(),
            "status": "success",
            "agents": results,
            "count": results.len(),
            "total_found": total_found,
        }))
    }
}
