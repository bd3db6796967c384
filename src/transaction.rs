//! Checkpointed transaction engine
//!
//! The transaction variant of the saga model: compensable actions executed
//! in order with exponential-backoff retries, named checkpoints capturing
//! the work done so far, and automatic LIFO compensation on failure. A
//! transaction either completes, or is rolled back and reports exactly what
//! was compensated.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::constants::ConstitutionalHash;
use crate::error::{EngineResult, WorkflowError};
use crate::retry::RetryPolicy;
use crate::saga::Checkpoint;

/// States of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Created; actions may still be added
    Initialized,
    /// Executing forward actions
    Active,
    /// Rolling back
    Compensating,
    /// Rolled back after a failure
    Compensated,
    /// All actions completed
    Completed,
    /// Failed before compensation finished classifying
    Failed,
    /// Overall transaction deadline exceeded
    TimedOut,
}

/// Kinds of governance actions carried by a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// A governance decision with external effect
    GovernanceDecision,
    /// Policy validation
    PolicyValidation,
    /// Access-control change
    AccessControl,
    /// Audit logging (append-only, usually uncompensated)
    AuditLogging,
    /// Resource allocation
    ResourceAllocation,
    /// Governance hash check
    ConstitutionalCheck,
}

type ActionFn = Arc<dyn Fn() -> BoxFuture<'static, EngineResult<Value>> + Send + Sync>;

/// A compensable action in a transaction
#[derive(Clone)]
pub struct TransactionAction {
    /// Action identifier
    pub action_id: String,
    /// Action kind
    pub kind: ActionKind,
    /// Human-readable description
    pub description: String,
    execute: ActionFn,
    compensate: Option<ActionFn>,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Retry schedule (exponential, base 2)
    pub retry_policy: RetryPolicy,
    /// Execution timestamp once executed
    pub executed_at: Option<DateTime<Utc>>,
    /// Compensation timestamp once compensated
    pub compensated_at: Option<DateTime<Utc>>,
    /// Forward execution result
    pub execution_result: Option<Value>,
    /// Compensation result
    pub compensation_result: Option<Value>,
}

impl fmt::Debug for TransactionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionAction")
            .field("action_id", &self.action_id)
            .field("kind", &self.kind)
            .field("description", &self.description)
            .field("executed_at", &self.executed_at)
            .field("compensated_at", &self.compensated_at)
            .finish()
    }
}

/// Outcome classification of a compensation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationLogStatus {
    /// Compensation succeeded
    Compensated,
    /// Compensation raised or timed out
    CompensationFailed,
    /// Action executed but registered no compensation
    NoCompensation,
}

/// Entry in the transaction's compensation log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationLogEntry {
    /// Action the entry refers to
    pub action_id: String,
    /// Outcome classification
    pub status: CompensationLogStatus,
    /// Result or error detail
    pub detail: Option<String>,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// A transaction with compensable actions and checkpoints
pub struct Transaction {
    /// Transaction identifier
    pub transaction_id: String,
    /// Description of the governed operation
    pub description: String,
    actions: Vec<TransactionAction>,
    /// Checkpoints recorded during setup and execution
    pub checkpoints: Vec<Checkpoint>,
    /// Current state
    pub state: TransactionState,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Start timestamp
    pub started_at: Option<DateTime<Utc>>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure timestamp
    pub failed_at: Option<DateTime<Utc>>,
    /// Failure description
    pub failure_reason: Option<String>,
    /// Per-action compensation outcomes, in rollback order
    pub compensation_log: Vec<CompensationLogEntry>,
    /// Caller-supplied metadata
    pub metadata: Value,
    /// Governance hash the transaction runs under
    pub constitutional_hash: ConstitutionalHash,
}

impl Transaction {
    fn new(
        description: impl Into<String>,
        metadata: Value,
        constitutional_hash: ConstitutionalHash,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4().to_string(),
            description: description.into(),
            actions: Vec::new(),
            checkpoints: Vec::new(),
            state: TransactionState::Initialized,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            failure_reason: None,
            compensation_log: Vec::new(),
            metadata,
            constitutional_hash,
        }
    }

    /// Actions in declaration order
    pub fn actions(&self) -> &[TransactionAction] {
        &self.actions
    }

    /// Summarize the transaction as a mapping
    pub fn to_mapping(&self) -> Value {
        json!({
            "transaction_id": self.transaction_id,
            "description": self.description,
            "state": self.state,
            "actions": self.actions.iter().map(|a| json!({
                "action_id": a.action_id,
                "kind": a.kind,
                "description": a.description,
                "executed_at": a.executed_at.map(|t| t.to_rfc3339()),
                "compensated_at": a.compensated_at.map(|t| t.to_rfc3339()),
            })).collect::<Vec<_>>(),
            "checkpoints": self.checkpoints,
            "created_at": self.created_at.to_rfc3339(),
            "started_at": self.started_at.map(|t| t.to_rfc3339()),
            "completed_at": self.completed_at.map(|t| t.to_rfc3339()),
            "failed_at": self.failed_at.map(|t| t.to_rfc3339()),
            "failure_reason": self.failure_reason,
            "compensation_log": self.compensation_log,
            "metadata": self.metadata,
            "constitutional_hash": self.constitutional_hash,
        })
    }
}

/// Engine executing checkpointed transactions.
///
/// Tracks active and completed transactions; a process owns one engine and
/// passes it down explicitly.
pub struct TransactionEngine {
    max_transaction_time: Duration,
    default_action_timeout: Duration,
    compensation_timeout: Duration,
    constitutional_hash: ConstitutionalHash,
    active: DashMap<String, Transaction>,
    completed: DashMap<String, Transaction>,
}

impl TransactionEngine {
    /// Create an engine with default timing bounds
    pub fn new(constitutional_hash: ConstitutionalHash) -> Self {
        Self {
            max_transaction_time: Duration::from_secs(300),
            default_action_timeout: Duration::from_secs(30),
            compensation_timeout: Duration::from_secs(60),
            constitutional_hash,
            active: DashMap::new(),
            completed: DashMap::new(),
        }
    }

    /// Override the overall transaction deadline
    pub fn with_max_transaction_time(mut self, bound: Duration) -> Self {
        self.max_transaction_time = bound;
        self
    }

    /// Override the default per-action timeout
    pub fn with_default_action_timeout(mut self, timeout: Duration) -> Self {
        self.default_action_timeout = timeout;
        self
    }

    /// Override the per-compensation timeout
    pub fn with_compensation_timeout(mut self, timeout: Duration) -> Self {
        self.compensation_timeout = timeout;
        self
    }

    /// Create a new transaction, registering it as active
    pub fn create_transaction(&self, description: impl Into<String>, metadata: Value) -> String {
        let transaction = Transaction::new(description, metadata, self.constitutional_hash.clone());
        let transaction_id = transaction.transaction_id.clone();
        info!(transaction_id = %transaction_id, "created transaction");
        self.active.insert(transaction_id.clone(), transaction);
        transaction_id
    }

    /// Add an action to a transaction still in `initialized` state
    #[allow(clippy::too_many_arguments)]
    pub fn add_action<E, EF, C, CF>(
        &self,
        transaction_id: &str,
        kind: ActionKind,
        description: impl Into<String>,
        execute: E,
        compensate: Option<C>,
        timeout: Option<Duration>,
        max_retries: u32,
    ) -> EngineResult<String>
    where
        E: Fn() -> EF + Send + Sync + 'static,
        EF: Future<Output = EngineResult<Value>> + Send + 'static,
        C: Fn() -> CF + Send + Sync + 'static,
        CF: Future<Output = EngineResult<Value>> + Send + 'static,
    {
        let mut entry = self.active.get_mut(transaction_id).ok_or_else(|| {
            WorkflowError::Internal(format!("transaction '{}' not found", transaction_id))
        })?;
        if entry.state != TransactionState::Initialized {
            return Err(WorkflowError::InvalidStateTransition {
                from: format!("{:?}", entry.state),
                to: "add_action".to_string(),
            });
        }

        let action = TransactionAction {
            action_id: Uuid::new_v4().to_string(),
            kind,
            description: description.into(),
            execute: Arc::new(move || Box::pin(execute())),
            compensate: compensate
                .map(|f| -> ActionFn { Arc::new(move || Box::pin(f())) }),
            timeout: timeout.unwrap_or(self.default_action_timeout),
            retry_policy: RetryPolicy::exponential(max_retries, Duration::from_millis(100)),
            executed_at: None,
            compensated_at: None,
            execution_result: None,
            compensation_result: None,
        };
        let action_id = action.action_id.clone();
        debug!(transaction_id, action_id = %action_id, "added action");
        entry.actions.push(action);
        Ok(action_id)
    }

    /// Record a named checkpoint capturing the executed action ids
    pub fn add_checkpoint(
        &self,
        transaction_id: &str,
        name: impl Into<String>,
        state_before: Value,
    ) -> EngineResult<String> {
        let mut entry = self.active.get_mut(transaction_id).ok_or_else(|| {
            WorkflowError::Internal(format!("transaction '{}' not found", transaction_id))
        })?;
        let executed = entry
            .actions
            .iter()
            .filter(|a| a.executed_at.is_some())
            .map(|a| a.action_id.clone())
            .collect();
        let checkpoint = Checkpoint::new(
            name,
            state_before,
            executed,
            self.constitutional_hash.clone(),
        );
        let checkpoint_id = checkpoint.checkpoint_id.clone();
        debug!(transaction_id, checkpoint = %checkpoint.name, "added checkpoint");
        entry.checkpoints.push(checkpoint);
        Ok(checkpoint_id)
    }

    /// Execute a transaction.
    ///
    /// Returns `true` when every action completed and `false` when the
    /// transaction was rolled back. Compensation failures are recorded in
    /// the compensation log, never propagated.
    pub async fn execute_transaction(&self, transaction_id: &str) -> EngineResult<bool> {
        let (_, mut transaction) = self.active.remove(transaction_id).ok_or_else(|| {
            WorkflowError::Internal(format!("transaction '{}' not found", transaction_id))
        })?;
        if transaction.state != TransactionState::Initialized {
            let state = transaction.state;
            self.active.insert(transaction_id.to_string(), transaction);
            return Err(WorkflowError::InvalidStateTransition {
                from: format!("{:?}", state),
                to: "active".to_string(),
            });
        }

        transaction.state = TransactionState::Active;
        transaction.started_at = Some(Utc::now());
        info!(transaction_id, actions = transaction.actions.len(), "executing transaction");

        let outcome = tokio::time::timeout(
            self.max_transaction_time,
            Self::run_actions(&mut transaction),
        )
        .await;

        let success = match outcome {
            Ok(Ok(())) => {
                transaction.state = TransactionState::Completed;
                transaction.completed_at = Some(Utc::now());
                info!(transaction_id, "transaction completed");
                true
            }
            Ok(Err(reason)) => {
                transaction.state = TransactionState::Failed;
                transaction.failed_at = Some(Utc::now());
                transaction.failure_reason = Some(reason.clone());
                warn!(transaction_id, reason = %reason, "transaction failed, compensating");
                self.compensate(&mut transaction).await;
                false
            }
            Err(_) => {
                transaction.state = TransactionState::TimedOut;
                transaction.failure_reason = Some(format!(
                    "transaction timed out after {}s",
                    self.max_transaction_time.as_secs()
                ));
                warn!(transaction_id, "transaction timed out, compensating");
                self.compensate(&mut transaction).await;
                false
            }
        };

        self.completed
            .insert(transaction_id.to_string(), transaction);
        Ok(success)
    }

    async fn run_actions(transaction: &mut Transaction) -> Result<(), String> {
        for index in 0..transaction.actions.len() {
            let action = &mut transaction.actions[index];
            let policy = action.retry_policy;
            let mut last_error = String::new();
            let mut succeeded = false;

            for attempt in 0..policy.max_attempts() {
                match tokio::time::timeout(action.timeout, (action.execute)()).await {
                    Ok(Ok(value)) => {
                        action.executed_at = Some(Utc::now());
                        action.execution_result = Some(value);
                        debug!(action_id = %action.action_id, attempt = attempt + 1, "action executed");
                        succeeded = true;
                        break;
                    }
                    Ok(Err(err)) => {
                        last_error = err.to_string();
                        warn!(
                            action_id = %action.action_id,
                            attempt = attempt + 1,
                            error = %err,
                            "action failed"
                        );
                    }
                    Err(_) => {
                        last_error = format!("timeout after {}s", action.timeout.as_secs());
                        warn!(
                            action_id = %action.action_id,
                            attempt = attempt + 1,
                            "action timed out"
                        );
                    }
                }
                if attempt + 1 < policy.max_attempts() {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }

            if !succeeded {
                return Err(format!(
                    "action '{}' failed: {}",
                    transaction.actions[index].description, last_error
                ));
            }
        }
        Ok(())
    }

    /// Execute compensations in LIFO order (reverse execution order)
    async fn compensate(&self, transaction: &mut Transaction) {
        transaction.state = TransactionState::Compensating;
        info!(transaction_id = %transaction.transaction_id, "starting compensation");

        let mut log = Vec::new();
        for action in transaction.actions.iter_mut().rev() {
            if action.executed_at.is_none() {
                continue;
            }
            match &action.compensate {
                Some(compensate) => {
                    match tokio::time::timeout(self.compensation_timeout, compensate()).await {
                        Ok(Ok(value)) => {
                            action.compensated_at = Some(Utc::now());
                            action.compensation_result = Some(value.clone());
                            log.push(CompensationLogEntry {
                                action_id: action.action_id.clone(),
                                status: CompensationLogStatus::Compensated,
                                detail: Some(value.to_string()),
                                timestamp: Utc::now(),
                            });
                            debug!(action_id = %action.action_id, "compensation executed");
                        }
                        Ok(Err(err)) => {
                            log.push(CompensationLogEntry {
                                action_id: action.action_id.clone(),
                                status: CompensationLogStatus::CompensationFailed,
                                detail: Some(err.to_string()),
                                timestamp: Utc::now(),
                            });
                            error!(action_id = %action.action_id, error = %err, "compensation failed");
                        }
                        Err(_) => {
                            log.push(CompensationLogEntry {
                                action_id: action.action_id.clone(),
                                status: CompensationLogStatus::CompensationFailed,
                                detail: Some(format!(
                                    "timeout after {}s",
                                    self.compensation_timeout.as_secs()
                                )),
                                timestamp: Utc::now(),
                            });
                            error!(action_id = %action.action_id, "compensation timed out");
                        }
                    }
                }
                None => {
                    log.push(CompensationLogEntry {
                        action_id: action.action_id.clone(),
                        status: CompensationLogStatus::NoCompensation,
                        detail: Some("action executed but no compensation registered".to_string()),
                        timestamp: Utc::now(),
                    });
                    warn!(action_id = %action.action_id, "no compensation for executed action");
                }
            }
        }

        transaction.compensation_log = log;
        transaction.state = TransactionState::Compensated;
        info!(transaction_id = %transaction.transaction_id, "compensation finished");
    }

    /// Look up a transaction by identifier
    pub fn get_state(&self, transaction_id: &str) -> Option<TransactionState> {
        self.active
            .get(transaction_id)
            .map(|t| t.state)
            .or_else(|| self.completed.get(transaction_id).map(|t| t.state))
    }

    /// Compensation log of a finished transaction
    pub fn compensation_log(&self, transaction_id: &str) -> Option<Vec<CompensationLogEntry>> {
        self.completed
            .get(transaction_id)
            .map(|t| t.compensation_log.clone())
    }

    /// Checkpoints of a transaction
    pub fn checkpoints(&self, transaction_id: &str) -> Option<Vec<Checkpoint>> {
        self.active
            .get(transaction_id)
            .map(|t| t.checkpoints.clone())
            .or_else(|| self.completed.get(transaction_id).map(|t| t.checkpoints.clone()))
    }

    /// Identifiers of active transactions
    pub fn active_transactions(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Identifiers of finished transactions
    pub fn completed_transactions(&self) -> Vec<String> {
        self.completed.iter().map(|e| e.key().clone()).collect()
    }

    /// Engine status summary
    pub fn engine_status(&self) -> Value {
        json!({
            "status": "operational",
            "active_transactions": self.active.len(),
            "completed_transactions": self.completed.len(),
            "max_transaction_time_s": self.max_transaction_time.as_secs(),
            "default_action_timeout_s": self.default_action_timeout.as_secs(),
            "compensation_timeout_s": self.compensation_timeout.as_secs(),
            "constitutional_hash": self.constitutional_hash,
        })
    }
}
