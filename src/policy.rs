//! Prebuilt governance sagas
//!
//! Policy deployment, policy update, and agent registration as configured
//! [`Saga`] instances. Each either completes fully or rolls back to the
//! previous state through its compensations.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::activities::Activities;
use crate::constants::ConstitutionalHash;
use crate::error::{EngineResult, WorkflowError};
use crate::saga::{Saga, SagaStep};

/// Saga deploying a governance policy with rollback support.
///
/// Steps: validate the policy, back up the current version, deploy the new
/// version, verify the deployment. A failure after the backup restores the
/// previous policy.
pub fn policy_deployment_saga(constitutional_hash: ConstitutionalHash) -> Saga {
    Saga::with_id("policy-deployment-saga", constitutional_hash)
        .with_step(
            SagaStep::new("validate_policy", validate_policy)
                // Nothing to undo if validation fails
                .with_compensation(noop_compensation),
        )
        .with_step(SagaStep::new("backup_policy", backup_policy).with_compensation(delete_backup))
        .with_step(SagaStep::new("deploy_policy", deploy_policy).with_compensation(restore_backup))
        .with_step(
            SagaStep::new("verify_deployment", verify_deployment)
                // Rolled back by the previous steps
                .with_compensation(noop_compensation),
        )
}

async fn validate_policy(input: Value) -> EngineResult<Value> {
    let policy_content = input
        .get("policy_content")
        .cloned()
        .ok_or_else(|| WorkflowError::Validation("missing policy content".to_string()))?;
    if policy_content.to_string().contains("unsafe") {
        return Err(WorkflowError::Validation(
            "policy contains unsafe directives".to_string(),
        ));
    }
    info!("policy validated");
    Ok(json!({"valid": true}))
}

async fn backup_policy(input: Value) -> EngineResult<Value> {
    let policy_id = input
        .get("policy_id")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let backup_id = format!("{}_backup_v1", policy_id);
    info!(policy_id = %policy_id, backup_id = %backup_id, "backed up policy");
    Ok(json!({"backup_id": backup_id, "policy_id": policy_id}))
}

async fn deploy_policy(input: Value) -> EngineResult<Value> {
    if input
        .get("simulate_deploy_failure")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return Err(WorkflowError::Internal(
            "deployment simulation failure".to_string(),
        ));
    }
    let policy_id = input.get("policy_id").and_then(|v| v.as_str()).unwrap_or("unknown");
    info!(policy_id, "deployed new policy content");
    Ok(json!({"deployed_version": "v2"}))
}

async fn verify_deployment(input: Value) -> EngineResult<Value> {
    if input
        .get("simulate_verify_failure")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return Err(WorkflowError::Validation(
            "policy verification failed health check".to_string(),
        ));
    }
    let policy_id = input.get("policy_id").and_then(|v| v.as_str()).unwrap_or("unknown");
    info!(policy_id, "policy verified active");
    Ok(json!({"active": true}))
}

async fn noop_compensation(_input: Value) -> EngineResult<bool> {
    Ok(true)
}

async fn delete_backup(input: Value) -> EngineResult<bool> {
    if let Some(backup_id) = input
        .get("context")
        .and_then(|c| c.get("backup_policy"))
        .and_then(|b| b.get("backup_id"))
        .and_then(|v| v.as_str())
    {
        info!(backup_id, "deleted backup");
    }
    Ok(true)
}

async fn restore_backup(input: Value) -> EngineResult<bool> {
    let backup = input
        .get("context")
        .and_then(|c| c.get("backup_policy"))
        .cloned()
        .unwrap_or(Value::Null);
    match (
        backup.get("backup_id").and_then(|v| v.as_str()),
        backup.get("policy_id").and_then(|v| v.as_str()),
    ) {
        (Some(backup_id), Some(policy_id)) => {
            warn!(policy_id, backup_id, "restoring policy from backup");
            Ok(true)
        }
        _ => {
            warn!("no backup recorded, nothing to restore");
            Ok(true)
        }
    }
}

/// Saga rolling out a policy change: stage, canary deployment, global
/// commit. A canary failure rolls the canary back.
pub fn policy_update_saga(
    activities: Arc<dyn Activities>,
    constitutional_hash: ConstitutionalHash,
) -> Saga {
    let stage_activities = activities.clone();
    let canary_activities = activities.clone();
    let canary_rollback = activities.clone();
    let commit_activities = activities;

    Saga::new(constitutional_hash)
        .with_step(
            SagaStep::new("stage_policy", move |input: Value| {
                let activities = stage_activities.clone();
                async move {
                    let saga_id = field(&input, "saga_id");
                    let policy_data = input.get("policy_data").cloned().unwrap_or(Value::Null);
                    let decision = activities
                        .evaluate_policy(&saga_id, "governance/constitutional/validate_policy", &policy_data)
                        .await?;
                    if !decision.allowed {
                        return Err(WorkflowError::Validation(format!(
                            "policy staging rejected: {}",
                            decision.reasons.join("; ")
                        )));
                    }
                    serde_json::to_value(decision).map_err(Into::into)
                }
            })
            .with_compensation(|input: Value| async move {
                info!(saga_id = %field(&input, "saga_id"), "staging rolled back, no cleanup needed");
                Ok(true)
            }),
        )
        .with_step(
            SagaStep::new("canary_deployment", move |input: Value| {
                let activities = canary_activities.clone();
                async move {
                    activities
                        .execute_agent_task("governance", "deploy_canary_policy", &input)
                        .await
                }
            })
            .with_compensation(move |input: Value| {
                let activities = canary_rollback.clone();
                async move {
                    activities
                        .execute_agent_task("governance", "rollback_canary_policy", &input)
                        .await?;
                    Ok(true)
                }
            }),
        )
        .with_step(SagaStep::new("global_commit", move |input: Value| {
            let activities = commit_activities.clone();
            async move {
                let saga_id = field(&input, "saga_id");
                let audit_id = activities
                    .record_audit(&saga_id, "policy_committed", &input)
                    .await?;
                Ok(json!({"audit_id": audit_id}))
            }
        }))
}

/// Saga onboarding a new agent: identity verification, capability audit,
/// directory entry. The directory entry is compensated by an unregister
/// audit event.
pub fn agent_registration_saga(
    activities: Arc<dyn Activities>,
    constitutional_hash: ConstitutionalHash,
) -> Saga {
    let verify_activities = activities.clone();
    let audit_activities = activities.clone();
    let register_activities = activities.clone();
    let unregister_activities = activities;

    Saga::new(constitutional_hash)
        .with_step(SagaStep::new("verify_identity", move |input: Value| {
            let activities = verify_activities.clone();
            async move {
                let saga_id = field(&input, "saga_id");
                let agent_data = input.get("agent_data").cloned().unwrap_or(Value::Null);
                let decision = activities
                    .evaluate_policy(&saga_id, "governance/security/verify_identity", &agent_data)
                    .await?;
                if !decision.allowed {
                    return Err(WorkflowError::Validation(format!(
                        "identity verification failed: {}",
                        decision.reasons.join("; ")
                    )));
                }
                serde_json::to_value(decision).map_err(Into::into)
            }
        }))
        .with_step(SagaStep::new("audit_capabilities", move |input: Value| {
            let activities = audit_activities.clone();
            async move {
                activities
                    .execute_agent_task("compliance", "audit_agent", &input)
                    .await
            }
        }))
        .with_step(
            SagaStep::new("create_directory_entry", move |input: Value| {
                let activities = register_activities.clone();
                async move {
                    let saga_id = field(&input, "saga_id");
                    let audit_id = activities
                        .record_audit(&saga_id, "agent_registered", &input)
                        .await?;
                    Ok(json!({"audit_id": audit_id}))
                }
            })
            .with_compensation(move |input: Value| {
                let activities = unregister_activities.clone();
                async move {
                    let saga_id = field(&input, "saga_id");
                    activities
                        .record_audit(&saga_id, "agent_unregistered", &input)
                        .await?;
                    Ok(true)
                }
            }),
        )
}

fn field(input: &Value, name: &str) -> String {
    input
        .get(name)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::activities::InMemoryActivities;
    use crate::context::WorkflowContext;
    use crate::result::WorkflowStatus;

    fn hash() -> ConstitutionalHash {
        ConstitutionalHash::new("cdd01ef066bc6cf2").unwrap()
    }

    #[tokio::test]
    async fn deployment_succeeds_end_to_end() {
        let mut saga = policy_deployment_saga(hash());
        let mut ctx = WorkflowContext::generate(hash());
        let result = saga
            .execute(
                &mut ctx,
                &json!({
                    "policy_id": "access-control",
                    "policy_content": {"rules": ["allow"]},
                }),
            )
            .await;

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(
            result.steps_completed,
            vec![
                "validate_policy",
                "backup_policy",
                "deploy_policy",
                "verify_deployment"
            ]
        );
        assert_eq!(result.output, Some(json!({"active": true})));
    }

    #[tokio::test]
    async fn deploy_failure_restores_backup() {
        let mut saga = policy_deployment_saga(hash());
        let mut ctx = WorkflowContext::generate(hash());
        let result = saga
            .execute(
                &mut ctx,
                &json!({
                    "policy_id": "access-control",
                    "policy_content": {"rules": ["allow"]},
                    "simulate_deploy_failure": true,
                }),
            )
            .await;

        assert_eq!(result.status, WorkflowStatus::Compensated);
        assert_eq!(result.steps_failed, vec!["deploy_policy"]);
        // Backup and validation are rolled back, deploy never registered
        assert_eq!(
            result.compensations_executed,
            vec!["backup_policy", "validate_policy"]
        );
    }

    #[tokio::test]
    async fn unsafe_policy_is_rejected_upfront() {
        let mut saga = policy_deployment_saga(hash());
        let mut ctx = WorkflowContext::generate(hash());
        let result = saga
            .execute(
                &mut ctx,
                &json!({
                    "policy_id": "access-control",
                    "policy_content": {"rules": ["unsafe directive"]},
                }),
            )
            .await;

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.steps_failed, vec!["validate_policy"]);
        assert!(result.compensations_executed.is_empty());
    }

    #[tokio::test]
    async fn registration_records_directory_entry() {
        let activities = Arc::new(InMemoryActivities::new());
        let mut saga = agent_registration_saga(activities.clone(), hash());
        let mut ctx = WorkflowContext::generate(hash());

        let result = saga
            .execute(
                &mut ctx,
                &json!({"agent_data": {"agent_id": "agent-9", "capabilities": ["validate"]}}),
            )
            .await;

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(activities.events_of_type("agent_registered").len(), 1);
        assert!(activities.events_of_type("agent_unregistered").is_empty());
    }

    #[tokio::test]
    async fn rejected_identity_stops_registration() {
        let activities = Arc::new(InMemoryActivities::new());
        activities.deny_policy("governance/security/verify_identity");
        let mut saga = agent_registration_saga(activities.clone(), hash());
        let mut ctx = WorkflowContext::generate(hash());

        let result = saga
            .execute(&mut ctx, &json!({"agent_data": {"agent_id": "agent-9"}}))
            .await;

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(activities.events_of_type("agent_registered").is_empty());
    }

    #[tokio::test]
    async fn policy_update_commits_and_audits() {
        let activities = Arc::new(InMemoryActivities::new());
        let mut saga = policy_update_saga(activities.clone(), hash());
        let mut ctx = WorkflowContext::generate(hash());

        let result = saga
            .execute(&mut ctx, &json!({"policy_data": {"rules": ["allow"]}}))
            .await;

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(activities.events_of_type("policy_committed").len(), 1);
    }
}
