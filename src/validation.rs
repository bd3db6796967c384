//! Constitutional validation workflow
//!
//! Multi-stage validation pipeline on the base engine:
//! hash check, integrity check, policy check, compliance score, audit
//! record. In strict mode a failing hash or integrity stage short-circuits
//! before policy and compliance run.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{EngineResult, WorkflowError};
use crate::workflow::{Workflow, WorkflowRun};

/// Stages of constitutional validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    /// Governance hash equality
    HashCheck,
    /// Content digest verification
    IntegrityCheck,
    /// Policy evaluation
    PolicyCheck,
    /// Aggregate compliance score
    ComplianceCheck,
    /// Audit trail recording
    AuditRecord,
}

impl ValidationStage {
    /// Stage name used as a step identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStage::HashCheck => "hash_check",
            ValidationStage::IntegrityCheck => "integrity_check",
            ValidationStage::PolicyCheck => "policy_check",
            ValidationStage::ComplianceCheck => "compliance_check",
            ValidationStage::AuditRecord => "audit_record",
        }
    }
}

/// Result of a single validation stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage identifier
    pub stage: ValidationStage,
    /// Whether the stage passed
    pub passed: bool,
    /// Human-readable outcome
    pub message: String,
    /// Stage-specific details
    pub details: Value,
    /// Completion timestamp
    pub timestamp: chrono::DateTime<Utc>,
}

impl StageResult {
    fn new(stage: ValidationStage, passed: bool, message: impl Into<String>, details: Value) -> Self {
        Self {
            stage,
            passed,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }

    /// Convert to a mapping with stable key order
    pub fn to_mapping(&self) -> EngineResult<Value> {
        serde_json::to_value(self).map_err(Into::into)
    }
}

/// Input for the validation workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// Content under validation
    #[serde(default)]
    pub content: String,
    /// Expected content digest (hex prefix of SHA-256)
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Governance hash supplied by the caller
    #[serde(default)]
    pub provided_constitutional_hash: Option<String>,
    /// Caller metadata carried into the audit record
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Skip the policy stage
    #[serde(default)]
    pub skip_policy_check: bool,
    /// Strict mode: 100% compliance required, early termination on
    /// hash/integrity failure
    #[serde(default = "default_strict")]
    pub require_strict_compliance: bool,
}

fn default_strict() -> bool {
    true
}

/// Multi-stage constitutional validation workflow
pub struct ConstitutionalValidationWorkflow {
    workflow_id: Option<String>,
    policy_path: Option<String>,
}

impl Default for ConstitutionalValidationWorkflow {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstitutionalValidationWorkflow {
    /// Create a validation workflow without a policy backend; the policy
    /// stage reports `skipped`
    pub fn new() -> Self {
        Self {
            workflow_id: None,
            policy_path: None,
        }
    }

    /// Fix the workflow instance identifier
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Evaluate the policy stage against the given policy path
    pub fn with_policy_path(mut self, policy_path: impl Into<String>) -> Self {
        self.policy_path = Some(policy_path.into());
        self
    }

    fn check_hash(&self, run: &WorkflowRun<'_>, request: &ValidationRequest) -> StageResult {
        let provided = request
            .provided_constitutional_hash
            .clone()
            .unwrap_or_default();
        if run.expected_hash().matches(&provided) {
            StageResult::new(
                ValidationStage::HashCheck,
                true,
                "constitutional hash verified",
                json!({"expected": run.expected_hash().as_str(), "provided": provided}),
            )
        } else {
            StageResult::new(
                ValidationStage::HashCheck,
                false,
                "constitutional hash mismatch",
                json!({
                    "expected": run.expected_hash().as_str(),
                    "provided": provided,
                    "action": "reject",
                }),
            )
        }
    }

    fn check_integrity(&self, request: &ValidationRequest) -> StageResult {
        let digest = hex::encode(Sha256::digest(request.content.as_bytes()));
        match &request.content_hash {
            None => {
                // No digest supplied: computed but unverifiable
                StageResult::new(
                    ValidationStage::IntegrityCheck,
                    true,
                    "content digest computed (no verification possible)",
                    json!({"computed_hash": &digest[..16], "verified": false}),
                )
            }
            Some(expected) => {
                let computed = &digest[..expected.len().min(digest.len())];
                if !expected.is_empty() && computed == expected.as_str() {
                    StageResult::new(
                        ValidationStage::IntegrityCheck,
                        true,
                        "content integrity verified",
                        json!({"hash": expected, "verified": true}),
                    )
                } else {
                    StageResult::new(
                        ValidationStage::IntegrityCheck,
                        false,
                        "content integrity check failed",
                        json!({
                            "expected": expected,
                            "computed": computed,
                            "action": "reject",
                        }),
                    )
                }
            }
        }
    }

    async fn check_policies(
        &self,
        run: &WorkflowRun<'_>,
        request: &ValidationRequest,
    ) -> StageResult {
        let policy_path = match &self.policy_path {
            Some(path) => path.clone(),
            None => {
                return StageResult::new(
                    ValidationStage::PolicyCheck,
                    true,
                    "policy check skipped (no policy backend configured)",
                    json!({"skipped": true}),
                )
            }
        };

        let input = json!({
            "content": request.content,
            "metadata": request.metadata,
            "constitutional_hash": run.expected_hash().as_str(),
        });
        match run
            .activities()
            .evaluate_policy(run.workflow_id(), &policy_path, &input)
            .await
        {
            Ok(decision) => StageResult::new(
                ValidationStage::PolicyCheck,
                decision.allowed,
                if decision.allowed {
                    "policy evaluation passed".to_string()
                } else {
                    format!("policy denied: {}", decision.reasons.join("; "))
                },
                json!({"allowed": decision.allowed, "reasons": decision.reasons}),
            ),
            Err(err) => {
                warn!(workflow_id = %run.workflow_id(), error = %err, "policy check error");
                StageResult::new(
                    ValidationStage::PolicyCheck,
                    false,
                    format!("policy check error: {}", err),
                    json!({"error": err.to_string()}),
                )
            }
        }
    }

    fn check_compliance(
        &self,
        request: &ValidationRequest,
        prior_results: &[StageResult],
    ) -> StageResult {
        let passed_count = prior_results.iter().filter(|r| r.passed).count();
        let failed_count = prior_results.len() - passed_count;
        let total = prior_results.len();
        let compliance_score = if total > 0 {
            passed_count as f64 / total as f64
        } else {
            0.0
        };
        let threshold = if request.require_strict_compliance {
            1.0
        } else {
            0.8
        };
        let passed = compliance_score >= threshold;

        StageResult::new(
            ValidationStage::ComplianceCheck,
            passed,
            format!("compliance score: {:.2}", compliance_score),
            json!({
                "compliance_score": compliance_score,
                "threshold": threshold,
                "passed_stages": passed_count,
                "failed_stages": failed_count,
                "strict_mode": request.require_strict_compliance,
            }),
        )
    }

    async fn record_audit(
        &self,
        run: &WorkflowRun<'_>,
        request: &ValidationRequest,
        results: &[StageResult],
        all_passed: bool,
    ) -> StageResult {
        let stages: Vec<Value> = results
            .iter()
            .filter_map(|r| r.to_mapping().ok())
            .collect();
        let record = json!({
            "workflow_id": run.workflow_id(),
            "constitutional_hash": run.expected_hash().as_str(),
            "timestamp": Utc::now().to_rfc3339(),
            "all_passed": all_passed,
            "stages": stages,
            "metadata": request.metadata,
        });

        match run
            .activities()
            .record_audit(run.workflow_id(), "constitutional_validation", &record)
            .await
        {
            Ok(audit_id) => StageResult::new(
                ValidationStage::AuditRecord,
                true,
                "audit record created",
                json!({"audit_id": audit_id}),
            ),
            Err(err) => {
                // Audit failures never invalidate the workflow
                warn!(workflow_id = %run.workflow_id(), error = %err, "audit recording error");
                StageResult::new(
                    ValidationStage::AuditRecord,
                    true,
                    format!("audit recording failed: {}", err),
                    json!({"error": err.to_string()}),
                )
            }
        }
    }

    fn record_stage(run: &mut WorkflowRun<'_>, result: &StageResult) -> EngineResult<()> {
        let mapping = result.to_mapping()?;
        run.context_mut()
            .set_step_result(result.stage.as_str(), mapping)?;
        if result.passed {
            run.record_step_success(result.stage.as_str());
        } else {
            run.record_step_failure(result.stage.as_str());
            run.add_error(result.message.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Workflow for ConstitutionalValidationWorkflow {
    fn name(&self) -> &str {
        "constitutional_validation"
    }

    fn workflow_id(&self) -> Option<String> {
        self.workflow_id.clone()
    }

    async fn execute(&self, run: &mut WorkflowRun<'_>, input: &Value) -> EngineResult<Value> {
        let request: ValidationRequest = serde_json::from_value(input.clone())?;
        let mut results: Vec<StageResult> = Vec::new();
        let mut all_passed = true;

        let hash_result = self.check_hash(run, &request);
        Self::record_stage(run, &hash_result)?;
        let hash_passed = hash_result.passed;
        results.push(hash_result);
        if !hash_passed {
            all_passed = false;
            if request.require_strict_compliance {
                return Err(WorkflowError::Validation("hash check failed".to_string()));
            }
        }

        let integrity_result = self.check_integrity(&request);
        Self::record_stage(run, &integrity_result)?;
        let integrity_passed = integrity_result.passed;
        results.push(integrity_result);
        if !integrity_passed {
            all_passed = false;
            if request.require_strict_compliance {
                return Err(WorkflowError::Validation(
                    "integrity check failed".to_string(),
                ));
            }
        }

        if !request.skip_policy_check {
            let policy_result = self.check_policies(run, &request).await;
            Self::record_stage(run, &policy_result)?;
            let policy_passed = policy_result.passed;
            results.push(policy_result);
            if !policy_passed {
                all_passed = false;
                if request.require_strict_compliance {
                    return Err(WorkflowError::Validation("policy check failed".to_string()));
                }
            }
        } else {
            debug!(workflow_id = %run.workflow_id(), "policy check skipped by request");
        }

        let compliance_result = self.check_compliance(&request, &results);
        Self::record_stage(run, &compliance_result)?;
        let compliance_passed = compliance_result.passed;
        results.push(compliance_result);
        if !compliance_passed {
            all_passed = false;
        }

        let audit_result = self.record_audit(run, &request, &results, all_passed).await;
        Self::record_stage(run, &audit_result)?;
        results.push(audit_result);

        if all_passed {
            let stages: Vec<Value> = results.iter().filter_map(|r| r.to_mapping().ok()).collect();
            Ok(json!({
                "validated": true,
                "stages": stages,
                "constitutional_hash": run.expected_hash().as_str(),
            }))
        } else {
            Err(WorkflowError::Validation(
                "constitutional validation failed".to_string(),
            ))
        }
    }
}
