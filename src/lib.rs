//! Constitutional-governance workflow engine
//!
//! This crate provides a composable, concurrent orchestration runtime that:
//! - Enforces a shared governance hash at every trust boundary (fail-closed)
//! - Pairs every observable side effect with a compensating action
//! - Bounds long-running work with timeouts and retries
//! - Executes sequential, saga, DAG, and cyclic workflow shapes
//! - Records audit events and Prometheus-style metrics per run and per step

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod activities;
pub mod compliance;
pub mod config;
pub mod constants;
pub mod context;
pub mod cyclic;
pub mod dag;
pub mod discovery;
pub mod error;
pub mod observability;
pub mod policy;
pub mod result;
pub mod retry;
pub mod saga;
pub mod step;
pub mod template;
pub mod transaction;
pub mod validation;
pub mod workflow;

pub use activities::{Activities, AgentInfo, HashValidation, InMemoryActivities, PolicyDecision};
pub use compliance::ComplianceCheckWorkflow;
pub use config::{DagConfig, FailurePolicy, SagaConfig, StepConfig, WorkflowConfig, WorkflowType};
pub use constants::ConstitutionalHash;
pub use context::WorkflowContext;
pub use cyclic::{CyclicExecutor, GlobalState, GraphDefinition, RouterNode, StateNode};
pub use dag::{DagExecutor, DagNode, DagResult, DagStatus, NodeContext};
pub use discovery::AgentDiscoveryWorkflow;
pub use error::{EngineResult, WorkflowError};
pub use policy::{agent_registration_saga, policy_deployment_saga, policy_update_saga};
pub use result::{WorkflowResult, WorkflowStatus};
pub use retry::{Backoff, RetryPolicy};
pub use saga::{Checkpoint, Saga, SagaResult, SagaStep};
pub use step::{StepCompensation, StepStatus, WorkflowStep};
pub use template::{ActionRegistry, BuiltWorkflow, TemplateEngine, WorkflowTemplate};
pub use transaction::{Transaction, TransactionEngine, TransactionState};
pub use validation::ConstitutionalValidationWorkflow;
pub use workflow::{SequentialWorkflow, Workflow, WorkflowEngine, WorkflowRun};
