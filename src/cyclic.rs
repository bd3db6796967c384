//! Cyclic graph executor for stateful workflows
//!
//! Models possibly re-entrant processes as a graph of state reducers over a
//! shared mutable state object, with conditional routing and a bounded
//! iteration budget to prevent accidental infinite loops. Re-entry is
//! opt-in per node and disabled by default.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{ConstitutionalHash, DEFAULT_MAX_ITERATIONS};
use crate::error::{EngineResult, WorkflowError};

/// States for graph nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Node has not executed
    Pending,
    /// Node is executing
    Running,
    /// Node completed successfully
    Completed,
    /// Node failed
    Failed,
    /// Node was skipped
    Skipped,
}

/// Result of executing a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionResult {
    /// Node identifier
    pub node_id: String,
    /// Terminal node state
    pub state: NodeState,
    /// Node output
    pub output: Option<Value>,
    /// Error message on failure
    pub error: Option<String>,
    /// Wall time in milliseconds
    pub execution_time_ms: f64,
    /// Completion timestamp
    pub timestamp: DateTime<Utc>,
    /// Additional result data
    pub metadata: BTreeMap<String, Value>,
}

impl NodeExecutionResult {
    /// Successful result
    pub fn completed(node_id: impl Into<String>, output: Value) -> Self {
        Self {
            node_id: node_id.into(),
            state: NodeState::Completed,
            output: Some(output),
            error: None,
            execution_time_ms: 0.0,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Failed result
    pub fn failed(node_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: NodeState::Failed,
            output: None,
            error: Some(error.into()),
            execution_time_ms: 0.0,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach the measured execution time
    pub fn with_execution_time(mut self, execution_time_ms: f64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Convert to a mapping with stable key order
    pub fn to_mapping(&self) -> EngineResult<Value> {
        serde_json::to_value(self).map_err(Into::into)
    }
}

/// Global state flowing through the graph.
///
/// Replaces message passing with persistent state mutations; every node is
/// a reducer over this object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalState {
    /// Workflow identifier
    pub workflow_id: String,
    /// Node currently executing
    pub current_node: Option<String>,
    state_data: BTreeMap<String, Value>,
    /// Identifiers of executed nodes
    pub executed_nodes: BTreeSet<String>,
    /// Identifiers of failed nodes
    pub failed_nodes: BTreeSet<String>,
    /// Per-node execution results
    pub node_results: BTreeMap<String, NodeExecutionResult>,
    /// Node identifiers in execution order (re-entries repeat)
    pub execution_history: Vec<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
    /// Governance hash the execution runs under
    pub constitutional_hash: ConstitutionalHash,
}

impl GlobalState {
    /// Create a state object for one execution
    pub fn new(
        workflow_id: impl Into<String>,
        state_data: BTreeMap<String, Value>,
        constitutional_hash: ConstitutionalHash,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            current_node: None,
            state_data,
            executed_nodes: BTreeSet::new(),
            failed_nodes: BTreeSet::new(),
            node_results: BTreeMap::new(),
            execution_history: Vec::new(),
            created_at: now,
            updated_at: now,
            constitutional_hash,
        }
    }

    /// Update a state entry
    pub fn update(&mut self, key: impl Into<String>, value: Value) {
        self.state_data.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    /// Read a state entry
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state_data.get(key)
    }

    /// All state entries
    pub fn state_data(&self) -> &BTreeMap<String, Value> {
        &self.state_data
    }

    /// Record a node execution result
    pub fn record_node_execution(&mut self, result: NodeExecutionResult) {
        if result.state == NodeState::Failed {
            self.failed_nodes.insert(result.node_id.clone());
        }
        self.executed_nodes.insert(result.node_id.clone());
        self.execution_history.push(result.node_id.clone());
        self.node_results.insert(result.node_id.clone(), result);
        self.updated_at = Utc::now();
    }

    /// Convert to a mapping with stable key order
    pub fn to_mapping(&self) -> EngineResult<Value> {
        serde_json::to_value(self).map_err(Into::into)
    }
}

/// A node in the state graph.
///
/// All nodes function as state reducers: `(current state) -> result`, with
/// mutations applied directly to the shared state object.
#[async_trait]
pub trait StateNode: Send + Sync {
    /// Node identifier
    fn id(&self) -> &str;

    /// Whether a failure of this node is tolerated
    fn is_optional(&self) -> bool {
        false
    }

    /// Execute the reducer against the current state
    async fn execute(&self, state: &mut GlobalState) -> NodeExecutionResult;
}

/// Reducer node backed by a synchronous closure
pub struct FnNode {
    id: String,
    optional: bool,
    #[allow(clippy::type_complexity)]
    f: Arc<dyn Fn(&mut GlobalState) -> EngineResult<Value> + Send + Sync>,
}

impl FnNode {
    /// Create a reducer node
    pub fn new<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut GlobalState) -> EngineResult<Value> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            optional: false,
            f: Arc::new(f),
        }
    }

    /// Mark the node optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

#[async_trait]
impl StateNode for FnNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_optional(&self) -> bool {
        self.optional
    }

    async fn execute(&self, state: &mut GlobalState) -> NodeExecutionResult {
        let start = std::time::Instant::now();
        match (self.f)(state) {
            Ok(output) => NodeExecutionResult::completed(&self.id, output)
                .with_execution_time(start.elapsed().as_secs_f64() * 1000.0),
            Err(err) => NodeExecutionResult::failed(&self.id, err.to_string())
                .with_execution_time(start.elapsed().as_secs_f64() * 1000.0),
        }
    }
}

/// Node that conditionally routes execution.
///
/// Its output names the next node to schedule.
pub struct RouterNode {
    id: String,
    #[allow(clippy::type_complexity)]
    route: Arc<dyn Fn(&GlobalState) -> String + Send + Sync>,
}

impl RouterNode {
    /// Create a router from a routing function
    pub fn new<F>(id: impl Into<String>, route: F) -> Self
    where
        F: Fn(&GlobalState) -> String + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            route: Arc::new(route),
        }
    }

    /// Evaluate the routing decision
    pub fn route(&self, state: &GlobalState) -> String {
        (self.route)(state)
    }
}

#[async_trait]
impl StateNode for RouterNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, state: &mut GlobalState) -> NodeExecutionResult {
        let start = std::time::Instant::now();
        let next_node = self.route(state);
        NodeExecutionResult::completed(&self.id, serde_json::json!({ "next_node": next_node }))
            .with_metadata("routing_decision", Value::String(next_node))
            .with_execution_time(start.elapsed().as_secs_f64() * 1000.0)
    }
}

/// Definition of a state graph
pub struct GraphDefinition {
    /// Graph identifier
    pub graph_id: String,
    /// Graph name
    pub name: String,
    /// Graph description
    pub description: String,
    nodes: HashMap<String, Arc<dyn StateNode>>,
    edges: HashMap<String, Vec<String>>,
    conditional_edges: HashMap<String, Arc<RouterNode>>,
    /// Node scheduled first
    pub entry_point: String,
    /// Iteration budget for one execution
    pub max_iterations: u32,
    /// Overall execution deadline
    pub max_execution_time: Duration,
    reentrant_nodes: HashSet<String>,
    constitutional_hash: ConstitutionalHash,
}

impl GraphDefinition {
    /// Create a graph definition
    pub fn new(
        graph_id: impl Into<String>,
        name: impl Into<String>,
        entry_point: impl Into<String>,
        constitutional_hash: ConstitutionalHash,
    ) -> Self {
        Self {
            graph_id: graph_id.into(),
            name: name.into(),
            description: String::new(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            conditional_edges: HashMap::new(),
            entry_point: entry_point.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_execution_time: Duration::from_secs(30),
            reentrant_nodes: HashSet::new(),
            constitutional_hash,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Override the iteration budget
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Override the overall deadline
    pub fn with_max_execution_time(mut self, max_execution_time: Duration) -> Self {
        self.max_execution_time = max_execution_time;
        self
    }

    /// Add a node to the graph
    pub fn add_node(&mut self, node: Arc<dyn StateNode>) -> &mut Self {
        self.nodes.insert(node.id().to_string(), node);
        self
    }

    /// Add a directed edge between nodes
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        let to = to.into();
        let entry = self.edges.entry(from.into()).or_default();
        if !entry.contains(&to) {
            entry.push(to);
        }
        self
    }

    /// Route the outgoing edge of `from` through a router node
    pub fn add_conditional_edge(&mut self, from: impl Into<String>, router: RouterNode) -> &mut Self {
        let router = Arc::new(router);
        self.nodes.insert(router.id().to_string(), router.clone());
        self.conditional_edges.insert(from.into(), router);
        self
    }

    /// Permit a node to be scheduled again after it has executed
    pub fn allow_reentry(&mut self, node_id: impl Into<String>) -> &mut Self {
        self.reentrant_nodes.insert(node_id.into());
        self
    }

    /// Whether the node may re-enter
    pub fn is_reentrant(&self, node_id: &str) -> bool {
        self.reentrant_nodes.contains(node_id)
    }

    /// Get a node by identifier
    pub fn get_node(&self, node_id: &str) -> Option<&Arc<dyn StateNode>> {
        self.nodes.get(node_id)
    }

    /// Next nodes to schedule after the given node.
    ///
    /// A conditional edge takes precedence over static edges; its routing
    /// decision is evaluated against the current state.
    pub fn next_nodes(&self, node_id: &str, state: &GlobalState) -> Vec<String> {
        if let Some(router) = self.conditional_edges.get(node_id) {
            return vec![router.route(state)];
        }
        self.edges.get(node_id).cloned().unwrap_or_default()
    }
}

/// Executes a state graph with bounded iteration.
///
/// Termination: empty pending set, iteration budget exhausted (error),
/// failure of a non-optional node (error), or the overall deadline.
pub struct CyclicExecutor {
    definition: GraphDefinition,
    total_executions: u64,
    successful_executions: u64,
    failed_executions: u64,
}

impl CyclicExecutor {
    /// Create an executor for the given graph
    pub fn new(definition: GraphDefinition) -> Self {
        Self {
            definition,
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
        }
    }

    /// Graph definition
    pub fn definition(&self) -> &GraphDefinition {
        &self.definition
    }

    /// Execute the graph from its entry point
    pub async fn execute(
        &mut self,
        initial_state: BTreeMap<String, Value>,
        workflow_id: Option<String>,
    ) -> EngineResult<GlobalState> {
        let workflow_id = workflow_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = GlobalState::new(
            workflow_id.clone(),
            initial_state,
            self.definition.constitutional_hash.clone(),
        );
        self.total_executions += 1;

        info!(
            workflow_id = %workflow_id,
            graph = %self.definition.graph_id,
            "starting cyclic execution"
        );
        let start = std::time::Instant::now();
        let deadline = self.definition.max_execution_time;

        let outcome = tokio::time::timeout(deadline, self.run_loop(&mut state)).await;

        match outcome {
            Ok(Ok(())) => {
                self.successful_executions += 1;
                info!(
                    workflow_id = %workflow_id,
                    iterations = state.execution_history.len(),
                    elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "cyclic execution completed"
                );
                Ok(state)
            }
            Ok(Err(err)) => {
                self.failed_executions += 1;
                warn!(workflow_id = %workflow_id, error = %err, "cyclic execution failed");
                Err(err)
            }
            Err(_) => {
                self.failed_executions += 1;
                warn!(
                    workflow_id = %workflow_id,
                    timeout_secs = deadline.as_secs(),
                    "cyclic execution timed out"
                );
                Err(WorkflowError::OverallTimeout {
                    timeout_secs: deadline.as_secs(),
                })
            }
        }
    }

    async fn run_loop(&self, state: &mut GlobalState) -> EngineResult<()> {
        let mut pending: VecDeque<String> = VecDeque::new();
        pending.push_back(self.definition.entry_point.clone());
        let mut iteration: u32 = 0;

        while let Some(node_id) = pending.pop_front() {
            if iteration >= self.definition.max_iterations {
                return Err(WorkflowError::IterationBudgetExceeded {
                    budget: self.definition.max_iterations,
                });
            }
            iteration += 1;

            let node = match self.definition.get_node(&node_id) {
                Some(node) => node.clone(),
                None => {
                    warn!(node = %node_id, "node not found in graph, skipping");
                    continue;
                }
            };

            debug!(node = %node_id, iteration, "executing node");
            state.current_node = Some(node_id.clone());
            let result = node.execute(state).await;
            let failed = result.state == NodeState::Failed;
            let error = result.error.clone();
            state.record_node_execution(result);

            if failed {
                if node.is_optional() {
                    warn!(node = %node_id, "optional node failed, continuing");
                } else {
                    return Err(WorkflowError::StepFailed {
                        step: node_id,
                        reason: error.unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
            }

            for next in self.definition.next_nodes(&node_id, state) {
                let already_executed = state.executed_nodes.contains(&next);
                if already_executed && !self.definition.is_reentrant(&next) {
                    debug!(node = %next, "already executed and not reentrant, not scheduling");
                    continue;
                }
                if !pending.contains(&next) {
                    pending.push_back(next);
                }
            }
        }

        Ok(())
    }

    /// Executor-level counters
    pub fn metrics(&self) -> Value {
        let success_rate = if self.total_executions > 0 {
            self.successful_executions as f64 / self.total_executions as f64
        } else {
            0.0
        };
        serde_json::json!({
            "total_executions": self.total_executions,
            "successful_executions": self.successful_executions,
            "failed_executions": self.failed_executions,
            "success_rate": success_rate,
            "constitutional_hash": self.definition.constitutional_hash.as_str(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hash() -> ConstitutionalHash {
        ConstitutionalHash::new("cdd01ef066bc6cf2").unwrap()
    }

    fn reducer(id: &str, value: i64) -> Arc<FnNode> {
        let key = id.to_string();
        Arc::new(FnNode::new(id, move |state: &mut GlobalState| {
            state.update(key.clone(), json!(value));
            Ok(json!(value))
        }))
    }

    #[tokio::test]
    async fn linear_graph_executes_in_order() {
        let mut graph = GraphDefinition::new("linear", "Linear", "a", hash());
        graph.add_node(reducer("a", 1));
        graph.add_node(reducer("b", 2));
        graph.add_node(reducer("c", 3));
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");

        let mut executor = CyclicExecutor::new(graph);
        let state = executor.execute(BTreeMap::new(), None).await.unwrap();

        assert_eq!(state.execution_history, vec!["a", "b", "c"]);
        assert_eq!(state.get("c"), Some(&json!(3)));
        assert_eq!(state.executed_nodes.len(), 3);
    }

    #[tokio::test]
    async fn conditional_edge_routes_by_state() {
        let mut graph = GraphDefinition::new("routed", "Routed", "classify", hash());
        graph.add_node(Arc::new(FnNode::new("classify", |state: &mut GlobalState| {
            let complexity = state
                .get("complexity_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            Ok(json!({ "complexity": complexity }))
        })));
        graph.add_node(reducer("deliberate", 1));
        graph.add_node(reducer("execute", 2));
        graph.add_conditional_edge(
            "classify",
            RouterNode::new("complexity_router", |state: &GlobalState| {
                let complexity = state
                    .get("complexity_score")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                if complexity > 0.5 {
                    "deliberate".to_string()
                } else {
                    "execute".to_string()
                }
            }),
        );

        let mut executor = CyclicExecutor::new(graph);
        let mut initial = BTreeMap::new();
        initial.insert("complexity_score".to_string(), json!(0.9));
        let state = executor.execute(initial, None).await.unwrap();

        assert!(state.executed_nodes.contains("deliberate"));
        assert!(!state.executed_nodes.contains("execute"));
    }

    #[tokio::test]
    async fn nodes_do_not_reenter_by_default() {
        let mut graph = GraphDefinition::new("cyclic", "Cyclic", "a", hash());
        graph.add_node(reducer("a", 1));
        graph.add_node(reducer("b", 2));
        graph.add_edge("a", "b");
        graph.add_edge("b", "a");

        let mut executor = CyclicExecutor::new(graph);
        let state = executor.execute(BTreeMap::new(), None).await.unwrap();
        // The back edge to an executed node is not scheduled again
        assert_eq!(state.execution_history, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn reentry_is_bounded_by_iteration_budget() {
        let mut graph = GraphDefinition::new("loop", "Loop", "a", hash()).with_max_iterations(10);
        graph.add_node(reducer("a", 1));
        graph.add_edge("a", "a");
        graph.allow_reentry("a");

        let mut executor = CyclicExecutor::new(graph);
        let err = executor.execute(BTreeMap::new(), None).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::IterationBudgetExceeded { budget: 10 }
        ));
    }

    #[tokio::test]
    async fn non_optional_failure_fails_the_run() {
        let mut graph = GraphDefinition::new("failing", "Failing", "bad", hash());
        graph.add_node(Arc::new(FnNode::new("bad", |_: &mut GlobalState| {
            Err(WorkflowError::Internal("broken reducer".to_string()))
        })));

        let mut executor = CyclicExecutor::new(graph);
        let err = executor.execute(BTreeMap::new(), None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::StepFailed { .. }));
        assert_eq!(executor.metrics()["failed_executions"], json!(1));
    }

    #[tokio::test]
    async fn optional_failure_continues() {
        let mut graph = GraphDefinition::new("tolerant", "Tolerant", "flaky", hash());
        graph.add_node(Arc::new(
            FnNode::new("flaky", |_: &mut GlobalState| {
                Err(WorkflowError::Internal("flaky".to_string()))
            })
            .optional(),
        ));
        graph.add_node(reducer("after", 1));
        graph.add_edge("flaky", "after");

        let mut executor = CyclicExecutor::new(graph);
        let state = executor.execute(BTreeMap::new(), None).await.unwrap();
        assert!(state.failed_nodes.contains("flaky"));
        assert!(state.executed_nodes.contains("after"));
    }

    #[tokio::test]
    async fn overall_timeout_is_enforced() {
        struct SlowNode;

        #[async_trait]
        impl StateNode for SlowNode {
            fn id(&self) -> &str {
                "slow"
            }

            async fn execute(&self, _state: &mut GlobalState) -> NodeExecutionResult {
                tokio::time::sleep(Duration::from_secs(10)).await;
                NodeExecutionResult::completed("slow", json!("late"))
            }
        }

        let mut graph = GraphDefinition::new("slow-graph", "Slow", "slow", hash())
            .with_max_execution_time(Duration::from_millis(50));
        graph.add_node(Arc::new(SlowNode));
        let mut executor = CyclicExecutor::new(graph);
        let err = executor.execute(BTreeMap::new(), None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::OverallTimeout { .. }));
    }

    #[tokio::test]
    async fn state_round_trips_through_mapping() {
        let mut graph = GraphDefinition::new("serialized", "Serialized", "a", hash());
        graph.add_node(reducer("a", 7));

        let mut executor = CyclicExecutor::new(graph);
        let state = executor.execute(BTreeMap::new(), None).await.unwrap();

        let mapping = state.to_mapping().unwrap();
        assert_eq!(mapping["constitutional_hash"], json!("cdd01ef066bc6cf2"));
        let restored: GlobalState = serde_json::from_value(mapping).unwrap();
        assert_eq!(restored.execution_history, state.execution_history);
    }
}
