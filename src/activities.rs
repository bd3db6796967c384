//! External activity boundary
//!
//! The only way the engine touches the outside world. Implementations wrap
//! policy engines, audit stores, and agent runtimes; the engine holds one
//! instance by dependency injection and never reflects on it.
//!
//! The engine never assumes idempotency on forward-direction activities; it
//! requires idempotency on compensation activities only. `record_audit` is
//! idempotent by (workflow_id, event_type, data hash).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::constants::ConstitutionalHash;
use crate::error::EngineResult;

/// Outcome of a governance hash validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashValidation {
    /// Whether the provided value matched
    pub is_valid: bool,
    /// Mismatch details when invalid
    pub errors: Vec<String>,
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Whether the policy allows the operation
    pub allowed: bool,
    /// Reasons supporting the decision
    pub reasons: Vec<String>,
    /// Engine-opaque decision details
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

/// Directory entry for a registered agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent identifier
    pub agent_id: String,
    /// Declared capabilities
    pub capabilities: Vec<String>,
    /// Directory status (e.g. `active`)
    pub status: String,
    /// Reputation score in [0, 1]
    pub reputation_score: f64,
    /// Observed latency in milliseconds
    pub latency_ms: u64,
}

/// Set of external operations the engine may invoke
#[async_trait]
pub trait Activities: Send + Sync {
    /// Validate a provided governance hash against the expected value
    async fn validate_constitutional_hash(
        &self,
        workflow_id: &str,
        provided: &str,
        expected: &ConstitutionalHash,
    ) -> EngineResult<HashValidation>;

    /// Evaluate a policy at `policy_path` against the given input
    async fn evaluate_policy(
        &self,
        workflow_id: &str,
        policy_path: &str,
        input: &Value,
    ) -> EngineResult<PolicyDecision>;

    /// Record an audit event; returns the audit record identifier.
    ///
    /// Idempotent by (workflow_id, event_type, hash of event_data).
    async fn record_audit(
        &self,
        workflow_id: &str,
        event_type: &str,
        event_data: &Value,
    ) -> EngineResult<String>;

    /// Execute a named task on an agent
    async fn execute_agent_task(
        &self,
        agent_id: &str,
        task_name: &str,
        payload: &Value,
    ) -> EngineResult<Value>;

    /// List agents matching the given capabilities and status
    async fn list_agents(
        &self,
        capabilities: &[String],
        status: Option<&str>,
    ) -> EngineResult<Vec<AgentInfo>>;
}

/// Recorded audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Audit record identifier
    pub audit_id: String,
    /// Workflow that emitted the event
    pub workflow_id: String,
    /// Event type (e.g. `workflow_completed`, `compliance_violation`)
    pub event_type: String,
    /// Event payload
    pub event_data: Value,
    /// Recording timestamp
    pub recorded_at: DateTime<Utc>,
}

/// In-memory activity implementation backing tests and local runs.
///
/// Validates hashes by equality, allows every policy unless a path has been
/// explicitly denied, keeps an idempotent audit log, and serves agents from
/// a registered directory.
#[derive(Default)]
pub struct InMemoryActivities {
    audit_log: DashMap<String, AuditRecord>,
    denied_policies: RwLock<Vec<String>>,
    agents: RwLock<Vec<AgentInfo>>,
}

impl InMemoryActivities {
    /// Create an empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny every evaluation of the given policy path
    pub fn deny_policy(&self, policy_path: impl Into<String>) {
        self.denied_policies.write().push(policy_path.into());
    }

    /// Register an agent in the directory
    pub fn register_agent(&self, agent: AgentInfo) {
        self.agents.write().push(agent);
    }

    /// All recorded audit events
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit_log.iter().map(|e| e.value().clone()).collect()
    }

    /// Audit events of the given type
    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditRecord> {
        self.audit_log
            .iter()
            .filter(|e| e.value().event_type == event_type)
            .map(|e| e.value().clone())
            .collect()
    }

    fn audit_key(workflow_id: &str, event_type: &str, event_data: &Value) -> String {
        let digest = Sha256::digest(event_data.to_string().as_bytes());
        format!(
            "{}:{}:{}",
            workflow_id,
            event_type,
            &hex::encode(digest)[..16]
        )
    }
}

#[async_trait]
impl Activities for InMemoryActivities {
    async fn validate_constitutional_hash(
        &self,
        workflow_id: &str,
        provided: &str,
        expected: &ConstitutionalHash,
    ) -> EngineResult<HashValidation> {
        if expected.matches(provided) {
            Ok(HashValidation {
                is_valid: true,
                errors: Vec::new(),
            })
        } else {
            debug!(workflow_id, provided, expected = %expected, "hash validation failed");
            Ok(HashValidation {
                is_valid: false,
                errors: vec![format!(
                    "constitutional hash mismatch: expected {}, got {}",
                    expected, provided
                )],
            })
        }
    }

    async fn evaluate_policy(
        &self,
        _workflow_id: &str,
        policy_path: &str,
        _input: &Value,
    ) -> EngineResult<PolicyDecision> {
        let denied = self
            .denied_policies
            .read()
            .iter()
            .any(|p| p == policy_path);
        if denied {
            Ok(PolicyDecision {
                allowed: false,
                reasons: vec![format!("policy '{}' denied", policy_path)],
                details: BTreeMap::new(),
            })
        } else {
            Ok(PolicyDecision {
                allowed: true,
                reasons: Vec::new(),
                details: BTreeMap::new(),
            })
        }
    }

    async fn record_audit(
        &self,
        workflow_id: &str,
        event_type: &str,
        event_data: &Value,
    ) -> EngineResult<String> {
        let key = Self::audit_key(workflow_id, event_type, event_data);
        if let Some(existing) = self.audit_log.get(&key) {
            return Ok(existing.audit_id.clone());
        }
        let record = AuditRecord {
            audit_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            event_type: event_type.to_string(),
            event_data: event_data.clone(),
            recorded_at: Utc::now(),
        };
        let audit_id = record.audit_id.clone();
        self.audit_log.insert(key, record);
        Ok(audit_id)
    }

    async fn execute_agent_task(
        &self,
        agent_id: &str,
        task_name: &str,
        payload: &Value,
    ) -> EngineResult<Value> {
        Ok(json!({
            "agent_id": agent_id,
            "task_name": task_name,
            "status": "completed",
            "payload": payload,
        }))
    }

    async fn list_agents(
        &self,
        capabilities: &[String],
        status: Option<&str>,
    ) -> EngineResult<Vec<AgentInfo>> {
        let agents = self.agents.read();
        Ok(agents
            .iter()
            .filter(|agent| {
                capabilities
                    .iter()
                    .all(|cap| agent.capabilities.contains(cap))
            })
            .filter(|agent| status.map_or(true, |s| agent.status == s))
            .cloned()
            .collect())
    }
}
