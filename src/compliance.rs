//! Compliance-audit workflow
//!
//! Verifies that recorded agent actions comply with governance policy.
//! Used for post-action auditing or high-stakes validation; a violation
//! emits a `compliance_violation` audit event.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use crate::error::EngineResult;
use crate::workflow::{Workflow, WorkflowRun};

/// Policy path evaluated per action
const COMPLIANCE_POLICY_PATH: &str = "governance/constitutional/allow";

/// Workflow auditing agent actions against constitutional policy
pub struct ComplianceCheckWorkflow {
    workflow_id: Option<String>,
}

impl Default for ComplianceCheckWorkflow {
    fn default() -> Self {
        Self::new()
    }
}

impl ComplianceCheckWorkflow {
    /// Create a compliance workflow
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
impl Workflow for ComplianceCheckWorkflow {
    fn name(&self) -> &str {
        "compliance"
    }

    fn workflow_id(&self) -> Option<String> {
        self.workflow_id.clone()
    }

    /// Expected input: `target_agent_id`, `actions` (list of recorded
    /// actions), optional `ruleset`.
    async fn execute(&self, run: &mut WorkflowRun<'_>, input: &Value) -> EngineResult<Value> {
        run.validate_constitutional_hash(None).await?;

        let agent_id = input
            .get("target_agent_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let actions: Vec<Value> = input
            .get("actions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let ruleset = input
            .get("ruleset")
            .and_then(|v| v.as_str())
            .unwrap_or("standard");

        info!(
            workflow_id = %run.workflow_id(),
            agent_id = %agent_id,
            actions = actions.len(),
            ruleset,
            "auditing agent actions"
        );

        // Actions must carry the fields required for an audit trail
        let mut valid_actions = Vec::new();
        let mut malformed_actions = Vec::new();
        for action in actions.iter() {
            if action.get("action_id").is_some() && action.get("timestamp").is_some() {
                valid_actions.push(action.clone());
            } else {
                malformed_actions.push(action.clone());
            }
        }
        run.record_step_success("structure_validation");

        let mut compliance_results = Vec::new();
        let mut violations = Vec::new();
        for action in &valid_actions {
            let decision = run
                .activities()
                .evaluate_policy(
                    run.workflow_id(),
                    COMPLIANCE_POLICY_PATH,
                    &json!({"message": action, "context": {"agent_id": agent_id}}),
                )
                .await?;

            let entry = json!({
                "action_id": action.get("action_id"),
                "allowed": decision.allowed,
                "reasons": decision.reasons,
            });
            if !decision.allowed {
                violations.push(entry.clone());
            }
            compliance_results.push(entry);
        }
        run.record_step_success("policy_evaluation");

        let is_compliant = violations.is_empty() && malformed_actions.is_empty();
        let output = json!({
            "audit_id": run.workflow_id(),
            "agent_id": agent_id,
            "timestamp": Utc::now().to_rfc3339(),
            "is_compliant": is_compliant,
            "summary": {
                "total_actions": actions.len(),
                "valid_actions": valid_actions.len(),
                "malformed_actions": malformed_actions.len(),
                "violations_detected": violations.len(),
            },
            "details": {
                "compliance_results": compliance_results,
                "violations": violations,
                "malformed": malformed_actions,
            },
            "constitutional_hash": run.expected_hash().as_str(),
        });

        if !is_compliant {
            run.activities()
                .record_audit(run.workflow_id(), "compliance_violation", &output)
                .await?;
            run.record_step_success("record_violation_audit");
        }

        Ok(output)
    }
}
