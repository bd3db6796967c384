//! DAG execution engine with bounded parallelism
//!
//! Executes a workflow as a directed acyclic graph, running independent
//! nodes concurrently and processing completions as they finish so each
//! finishing node immediately unblocks its dependents. Scheduling is biased
//! toward the critical path: nodes with more transitive downstream work run
//! first.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::constants::{ConstitutionalHash, DEFAULT_MAX_PARALLEL_NODES, DEFAULT_STEP_TIMEOUT};
use crate::context::WorkflowContext;
use crate::error::{EngineResult, WorkflowError};
use crate::step::StepCompensation;

/// Boxed future returned by a node's execute closure
pub type NodeFuture = BoxFuture<'static, EngineResult<Value>>;

/// Async node operation over a read-only context snapshot
pub type NodeFn = Arc<dyn Fn(NodeContext) -> NodeFuture + Send + Sync>;

/// Read-only snapshot of the workflow context handed to a node.
///
/// Nodes produce values; only the executor writes to the real context, so
/// parallel nodes never share mutable state.
#[derive(Debug, Clone, Serialize)]
pub struct NodeContext {
    /// DAG identifier
    pub dag_id: String,
    /// Workflow identifier
    pub workflow_id: String,
    /// Governance hash the execution runs under
    pub constitutional_hash: ConstitutionalHash,
    step_results: BTreeMap<String, Value>,
}

impl NodeContext {
    /// Result of a previously completed node or step
    pub fn get_step_result(&self, name: &str) -> Option<&Value> {
        self.step_results.get(name)
    }

    /// All step results visible to this node
    pub fn step_results(&self) -> &BTreeMap<String, Value> {
        &self.step_results
    }
}

/// A node in the execution DAG
#[derive(Clone)]
pub struct DagNode {
    /// Unique node identifier
    pub id: String,
    /// Human-readable node name
    pub name: String,
    execute: NodeFn,
    /// Identifiers of nodes this node depends on
    pub dependencies: Vec<String>,
    /// Optional compensation for rollback
    pub compensation: Option<StepCompensation>,
    /// Maximum execution time
    pub timeout: Duration,
    /// If true, failure does not stop DAG execution
    pub is_optional: bool,
    /// Validate the governance hash before executing
    pub requires_constitutional_check: bool,
    /// Key for result caching; cached results skip execution
    pub cache_key: Option<String>,

    /// Node result once executed
    pub result: Option<Value>,
    /// Error message on failure
    pub error: Option<String>,
    /// Execution start timestamp
    pub started_at: Option<DateTime<Utc>>,
    /// Execution completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time in milliseconds (zero on cache hit)
    pub execution_time_ms: f64,
    /// Count of transitive downstream nodes, derived before execution
    pub priority: usize,
}

impl DagNode {
    /// Create a node from an async closure
    pub fn new<F, Fut>(id: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            execute: Arc::new(move |ctx| Box::pin(f(ctx))),
            dependencies: Vec::new(),
            compensation: None,
            timeout: DEFAULT_STEP_TIMEOUT,
            is_optional: false,
            requires_constitutional_check: true,
            cache_key: None,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            execution_time_ms: 0.0,
            priority: 0,
        }
    }

    /// Declare a dependency on another node
    pub fn depends_on(mut self, node_id: impl Into<String>) -> Self {
        self.dependencies.push(node_id.into());
        self
    }

    /// Replace the dependency list
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Attach a compensation
    pub fn with_compensation(mut self, compensation: StepCompensation) -> Self {
        self.compensation = Some(compensation);
        self
    }

    /// Set the execution timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the node optional: its failure becomes a skip
    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    /// Skip the governance pre-check for this node
    pub fn without_constitutional_check(mut self) -> Self {
        self.requires_constitutional_check = false;
        self
    }

    /// Cache the node's result under the given key
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }
}

impl fmt::Debug for DagNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DagNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("is_optional", &self.is_optional)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Overall DAG outcome classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagStatus {
    /// Every node completed (or was tolerably skipped)
    Completed,
    /// Nodes failed and nothing completed
    Failed,
    /// Some nodes completed, some failed
    PartiallyCompleted,
}

impl DagStatus {
    /// Status as a metric/log label
    pub fn as_str(&self) -> &'static str {
        match self {
            DagStatus::Completed => "completed",
            DagStatus::Failed => "failed",
            DagStatus::PartiallyCompleted => "partially_completed",
        }
    }
}

/// Result of DAG execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagResult {
    /// DAG identifier
    pub dag_id: String,
    /// Overall classification
    pub status: DagStatus,
    /// Per-node results
    pub node_results: BTreeMap<String, Value>,
    /// Completed node identifiers
    pub nodes_completed: Vec<String>,
    /// Failed node identifiers
    pub nodes_failed: Vec<String>,
    /// Skipped node identifiers
    pub nodes_skipped: Vec<String>,
    /// Wall time in milliseconds
    pub execution_time_ms: f64,
    /// Governance hash the execution ran under
    pub constitutional_hash: ConstitutionalHash,
    /// Errors accumulated during execution
    pub errors: Vec<String>,
}

impl DagResult {
    /// Convert to a mapping with stable key order
    pub fn to_mapping(&self) -> EngineResult<Value> {
        serde_json::to_value(self).map_err(Into::into)
    }
}

struct NodeOutcome {
    id: String,
    result: Option<Value>,
    error: Option<String>,
}

/// DAG execution engine.
///
/// Construction validates acyclicity on every insertion; execution computes
/// critical-path priorities, runs ready nodes in parallel up to the
/// configured cap, cascades skips past failed required dependencies, and
/// rolls back registered compensations in LIFO order when anything failed.
#[derive(Debug)]
pub struct DagExecutor {
    /// DAG identifier
    pub dag_id: String,
    constitutional_hash: ConstitutionalHash,
    max_parallel_nodes: usize,
    fail_closed: bool,
    cache: Option<Arc<DashMap<String, Value>>>,
    nodes: BTreeMap<String, DagNode>,
    dependents: HashMap<String, Vec<String>>,
}

impl DagExecutor {
    /// Create an executor with a generated identifier
    pub fn new(constitutional_hash: ConstitutionalHash) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), constitutional_hash)
    }

    /// Create an executor with a fixed identifier
    pub fn with_id(dag_id: impl Into<String>, constitutional_hash: ConstitutionalHash) -> Self {
        Self {
            dag_id: dag_id.into(),
            constitutional_hash,
            max_parallel_nodes: DEFAULT_MAX_PARALLEL_NODES,
            fail_closed: true,
            cache: None,
            nodes: BTreeMap::new(),
            dependents: HashMap::new(),
        }
    }

    /// Cap the number of concurrently executing nodes
    pub fn with_max_parallel_nodes(mut self, max_parallel_nodes: usize) -> Self {
        self.max_parallel_nodes = max_parallel_nodes.max(1);
        self
    }

    /// Share a caller-owned result cache across executions.
    ///
    /// The executor is the only writer during its run; callers sharing one
    /// cache across executors must synchronize themselves or scope one
    /// cache per execution.
    pub fn with_shared_cache(mut self, cache: Arc<DashMap<String, Value>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Tolerate governance mismatches, recording warnings instead of
    /// failing nodes. Diagnostics only; not for production use.
    pub fn with_fail_open(mut self) -> Self {
        self.fail_closed = false;
        self
    }

    /// Number of nodes in the graph
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get a node by identifier
    pub fn get_node(&self, node_id: &str) -> Option<&DagNode> {
        self.nodes.get(node_id)
    }

    /// Add a node to the DAG.
    ///
    /// Rejects duplicate identifiers and self-dependencies, and tests
    /// acyclicity over the current union of declared dependencies; an
    /// addition that would introduce a cycle leaves the graph unchanged.
    /// Dependencies on nodes not yet declared are tolerated here and
    /// validated at execution start.
    pub fn add_node(&mut self, node: DagNode) -> EngineResult<&mut Self> {
        if self.nodes.contains_key(&node.id) {
            return Err(WorkflowError::DuplicateNode {
                node: node.id.clone(),
            });
        }
        if node.dependencies.contains(&node.id) {
            return Err(WorkflowError::CycleDetected {
                node: node.id.clone(),
            });
        }
        for dep_id in &node.dependencies {
            if !self.nodes.contains_key(dep_id) {
                debug!(
                    dag_id = %self.dag_id,
                    node = %node.id,
                    dependency = %dep_id,
                    "dependency not yet added"
                );
            }
        }

        let node_id = node.id.clone();
        self.nodes.insert(node_id.clone(), node);
        if self.has_cycle() {
            self.nodes.remove(&node_id);
            return Err(WorkflowError::CycleDetected { node: node_id });
        }
        Ok(self)
    }

    fn has_cycle(&self) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: HashSet<&str> = HashSet::new();

        fn dfs<'a>(
            nodes: &'a BTreeMap<String, DagNode>,
            node_id: &'a str,
            visited: &mut HashSet<&'a str>,
            stack: &mut HashSet<&'a str>,
        ) -> bool {
            visited.insert(node_id);
            stack.insert(node_id);
            if let Some(node) = nodes.get(node_id) {
                for dep_id in &node.dependencies {
                    if !visited.contains(dep_id.as_str()) {
                        if dfs(nodes, dep_id, visited, stack) {
                            return true;
                        }
                    } else if stack.contains(dep_id.as_str()) {
                        return true;
                    }
                }
            }
            stack.remove(node_id);
            false
        }

        self.nodes
            .keys()
            .any(|id| !visited.contains(id.as_str()) && dfs(&self.nodes, id, &mut visited, &mut stack))
    }

    /// Topological execution order (Kahn's algorithm)
    pub fn get_execution_order(&self) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> = self.nodes.keys().map(|k| (k.as_str(), 0)).collect();
        for node in self.nodes.values() {
            let present = node
                .dependencies
                .iter()
                .filter(|dep| self.nodes.contains_key(*dep))
                .count();
            in_degree.insert(node.id.as_str(), present);
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::new();

        while let Some(node_id) = queue.pop_front() {
            order.push(node_id.to_string());
            for (other_id, other) in &self.nodes {
                if other.dependencies.iter().any(|d| d == node_id) {
                    if let Some(degree) = in_degree.get_mut(other_id.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(other_id.as_str());
                        }
                    }
                }
            }
        }

        order
    }

    /// Priority of each node is the count of its transitive downstream
    /// nodes: nodes unblocking more work are scheduled first.
    fn calculate_priorities(&mut self) {
        self.dependents = self
            .nodes
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        for (node_id, node) in &self.nodes {
            for dep_id in &node.dependencies {
                if let Some(children) = self.dependents.get_mut(dep_id) {
                    children.push(node_id.clone());
                }
            }
        }

        fn count_downstream(
            dependents: &HashMap<String, Vec<String>>,
            node_id: &str,
            memo: &mut HashMap<String, usize>,
        ) -> usize {
            if let Some(&count) = memo.get(node_id) {
                return count;
            }
            let mut count = 0;
            if let Some(children) = dependents.get(node_id) {
                for child in children {
                    count += 1 + count_downstream(dependents, child, memo);
                }
            }
            memo.insert(node_id.to_string(), count);
            count
        }

        let mut memo = HashMap::new();
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        for id in ids {
            let priority = count_downstream(&self.dependents, &id, &mut memo);
            if let Some(node) = self.nodes.get_mut(&id) {
                node.priority = priority;
            }
        }
    }

    /// Execute the DAG.
    ///
    /// Returns an error only when a node references a dependency absent
    /// from the graph; every other failure is classified into the result.
    pub async fn execute(&mut self, context: &mut WorkflowContext) -> EngineResult<DagResult> {
        for node in self.nodes.values() {
            for dep_id in &node.dependencies {
                if !self.nodes.contains_key(dep_id) {
                    return Err(WorkflowError::MissingDependency {
                        node: node.id.clone(),
                        dependency: dep_id.clone(),
                    });
                }
            }
        }

        let start = std::time::Instant::now();
        if let Err(err) = context.set_step_result("_dag_id", Value::String(self.dag_id.clone())) {
            debug!(dag_id = %self.dag_id, error = %err, "dag id already recorded");
        }
        self.calculate_priorities();
        if !self.fail_closed {
            warn!(
                dag_id = %self.dag_id,
                "executing with fail_open governance checks; not for production use"
            );
        }

        info!(dag_id = %self.dag_id, nodes = self.nodes.len(), "starting DAG execution");

        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut results: BTreeMap<String, Value> = BTreeMap::new();
        let mut errors: Vec<String> = Vec::new();
        let mut compensation_stack: Vec<StepCompensation> = Vec::new();
        let mut completed_order: Vec<String> = Vec::new();

        let mut join_set: JoinSet<NodeOutcome> = JoinSet::new();
        let mut task_ids: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut in_flight: HashSet<String> = HashSet::new();

        loop {
            let skipped_before = skipped.len();
            let ready = self.ready_nodes(&completed, &failed, &mut skipped, &in_flight);
            let mut resolved_inline = skipped.len() > skipped_before;

            for node_id in ready {
                if in_flight.len() >= self.max_parallel_nodes {
                    break;
                }

                // Governance check on the executor's control path, before
                // any effect of the node can occur.
                if self
                    .check_node_governance(&node_id, context, &mut errors)
                    .is_err()
                {
                    let optional = self.nodes.get(&node_id).map_or(false, |n| n.is_optional);
                    if optional {
                        skipped.insert(node_id);
                    } else {
                        failed.insert(node_id);
                    }
                    resolved_inline = true;
                    continue;
                }

                // Cache hit: reuse the stored value without executing.
                if let Some(value) = self.cached_value(&node_id) {
                    let node = match self.nodes.get_mut(&node_id) {
                        Some(node) => node,
                        None => continue,
                    };
                    info!(dag_id = %self.dag_id, node = %node_id, "cache hit");
                    node.result = Some(value.clone());
                    node.completed_at = Some(Utc::now());
                    node.execution_time_ms = 0.0;
                    completed.insert(node_id.clone());
                    completed_order.push(node_id.clone());
                    results.insert(node_id.clone(), value.clone());
                    if let Err(err) = context.set_step_result(&node_id, value) {
                        warn!(dag_id = %self.dag_id, node = %node_id, error = %err, "result not recorded");
                    }
                    resolved_inline = true;
                    continue;
                }

                // Register compensation before executing, on the control
                // path: no suspension occurs while the stack is mutated.
                let snapshot = NodeContext {
                    dag_id: self.dag_id.clone(),
                    workflow_id: context.workflow_id.clone(),
                    constitutional_hash: self.constitutional_hash.clone(),
                    step_results: context.step_results().clone(),
                };
                let node = match self.nodes.get_mut(&node_id) {
                    Some(node) => node,
                    None => continue,
                };
                if let Some(compensation) = node.compensation.clone() {
                    compensation_stack.push(compensation);
                }
                node.started_at = Some(Utc::now());

                let future = (node.execute)(snapshot);
                let timeout = node.timeout;
                let id = node_id.clone();
                let handle = join_set.spawn(async move {
                    match tokio::time::timeout(timeout, future).await {
                        Ok(Ok(value)) => NodeOutcome {
                            id,
                            result: Some(value),
                            error: None,
                        },
                        Ok(Err(err)) => NodeOutcome {
                            error: Some(err.to_string()),
                            result: None,
                            id,
                        },
                        Err(_) => NodeOutcome {
                            error: Some(format!("timeout after {}s", timeout.as_secs())),
                            result: None,
                            id,
                        },
                    }
                });
                task_ids.insert(handle.id(), node_id.clone());
                in_flight.insert(node_id);
            }

            if in_flight.is_empty() {
                // Cache hits and governance rejections resolve on the
                // control path; re-derive readiness before concluding.
                if resolved_inline {
                    continue;
                }
                break;
            }

            // As-completed: handle one finished node, then re-derive the
            // ready set so dependents start immediately.
            match join_set.join_next_with_id().await {
                Some(Ok((task_id, outcome))) => {
                    task_ids.remove(&task_id);
                    in_flight.remove(&outcome.id);
                    self.handle_outcome(
                        outcome,
                        context,
                        &mut completed,
                        &mut failed,
                        &mut skipped,
                        &mut results,
                        &mut errors,
                        &mut completed_order,
                    );
                }
                Some(Err(join_err)) => {
                    let node_id = task_ids.remove(&join_err.id());
                    if let Some(node_id) = node_id {
                        in_flight.remove(&node_id);
                        let outcome = NodeOutcome {
                            id: node_id,
                            result: None,
                            error: Some(format!("task aborted: {}", join_err)),
                        };
                        self.handle_outcome(
                            outcome,
                            context,
                            &mut completed,
                            &mut failed,
                            &mut skipped,
                            &mut results,
                            &mut errors,
                            &mut completed_order,
                        );
                    }
                }
                None => break,
            }
        }

        let status = if failed.is_empty() {
            DagStatus::Completed
        } else if completed.is_empty() {
            DagStatus::Failed
        } else {
            DagStatus::PartiallyCompleted
        };

        if !failed.is_empty() {
            self.run_compensations(&mut compensation_stack, context, &mut errors)
                .await;
        }

        let execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            dag_id = %self.dag_id,
            status = status.as_str(),
            completed = completed.len(),
            failed = failed.len(),
            skipped = skipped.len(),
            elapsed_ms = execution_time_ms,
            "DAG execution finished"
        );

        let mut nodes_failed: Vec<String> = failed.into_iter().collect();
        nodes_failed.sort();
        let mut nodes_skipped: Vec<String> = skipped.into_iter().collect();
        nodes_skipped.sort();

        Ok(DagResult {
            dag_id: self.dag_id.clone(),
            status,
            node_results: results,
            nodes_completed: completed_order,
            nodes_failed,
            nodes_skipped,
            execution_time_ms,
            constitutional_hash: self.constitutional_hash.clone(),
            errors,
        })
    }

    /// Nodes whose dependencies are satisfied, ordered by priority.
    ///
    /// Nodes downstream of a failed required dependency transition to
    /// skipped here without being executed.
    fn ready_nodes(
        &mut self,
        completed: &HashSet<String>,
        failed: &HashSet<String>,
        skipped: &mut HashSet<String>,
        in_flight: &HashSet<String>,
    ) -> Vec<String> {
        let mut ready: Vec<(usize, String)> = Vec::new();
        let mut to_skip: Vec<String> = Vec::new();

        for (node_id, node) in &self.nodes {
            if completed.contains(node_id)
                || failed.contains(node_id)
                || skipped.contains(node_id)
                || in_flight.contains(node_id)
            {
                continue;
            }

            let deps_failed = node.dependencies.iter().any(|dep_id| {
                failed.contains(dep_id)
                    && self.nodes.get(dep_id).map_or(false, |dep| !dep.is_optional)
            });
            if deps_failed {
                to_skip.push(node_id.clone());
                continue;
            }

            let deps_satisfied = node
                .dependencies
                .iter()
                .all(|dep_id| completed.contains(dep_id) || skipped.contains(dep_id));
            if deps_satisfied {
                ready.push((node.priority, node_id.clone()));
            }
        }

        for node_id in to_skip {
            debug!(dag_id = %self.dag_id, node = %node_id, "skipping: required dependency failed");
            skipped.insert(node_id);
        }

        // Critical path first; identifier order breaks ties deterministically
        ready.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        ready.into_iter().map(|(_, id)| id).collect()
    }

    fn check_node_governance(
        &mut self,
        node_id: &str,
        context: &WorkflowContext,
        errors: &mut Vec<String>,
    ) -> EngineResult<()> {
        let requires_check = self
            .nodes
            .get(node_id)
            .map_or(false, |n| n.requires_constitutional_check);
        if !requires_check {
            return Ok(());
        }

        let context_hash = context
            .get_step_result("constitutional_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| context.constitutional_hash.as_str())
            .to_string();

        if self.constitutional_hash.matches(&context_hash) {
            debug!(dag_id = %self.dag_id, node = %node_id, "constitutional validation passed");
            return Ok(());
        }

        let message = format!(
            "node '{}' constitutional hash mismatch: expected {}, got {}",
            node_id, self.constitutional_hash, context_hash
        );
        if self.fail_closed {
            error!(dag_id = %self.dag_id, "{}", message);
            errors.push(message);
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.error = Some("constitutional hash mismatch".to_string());
            }
            Err(WorkflowError::ConstitutionalMismatch {
                expected: self.constitutional_hash.to_string(),
                actual: context_hash,
            })
        } else {
            warn!(
                dag_id = %self.dag_id,
                "{} - continuing under fail_open; not for production use",
                message
            );
            Ok(())
        }
    }

    fn cached_value(&self, node_id: &str) -> Option<Value> {
        let node = self.nodes.get(node_id)?;
        let key = node.cache_key.as_ref()?;
        let cache = self.cache.as_ref()?;
        cache.get(key).map(|entry| entry.value().clone())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_outcome(
        &mut self,
        outcome: NodeOutcome,
        context: &mut WorkflowContext,
        completed: &mut HashSet<String>,
        failed: &mut HashSet<String>,
        skipped: &mut HashSet<String>,
        results: &mut BTreeMap<String, Value>,
        errors: &mut Vec<String>,
        completed_order: &mut Vec<String>,
    ) {
        let node = match self.nodes.get_mut(&outcome.id) {
            Some(node) => node,
            None => return,
        };
        node.completed_at = Some(Utc::now());
        if let (Some(start), Some(end)) = (node.started_at, node.completed_at) {
            node.execution_time_ms = end
                .signed_duration_since(start)
                .num_microseconds()
                .unwrap_or(0) as f64
                / 1000.0;
        }

        match outcome.result {
            Some(value) => {
                node.result = Some(value.clone());
                if let (Some(key), Some(cache)) = (node.cache_key.clone(), self.cache.as_ref()) {
                    cache.insert(key, value.clone());
                }
                debug!(
                    dag_id = %self.dag_id,
                    node = %outcome.id,
                    elapsed_ms = node.execution_time_ms,
                    "node completed"
                );
                completed.insert(outcome.id.clone());
                completed_order.push(outcome.id.clone());
                results.insert(outcome.id.clone(), value.clone());
                if let Err(err) = context.set_step_result(&outcome.id, value) {
                    warn!(dag_id = %self.dag_id, node = %outcome.id, error = %err, "result not recorded");
                }
            }
            None => {
                let reason = outcome.error.unwrap_or_else(|| "unknown error".to_string());
                node.error = Some(reason.clone());
                if node.is_optional {
                    warn!(dag_id = %self.dag_id, node = %outcome.id, error = %reason, "optional node failed, skipping");
                    skipped.insert(outcome.id);
                } else {
                    warn!(dag_id = %self.dag_id, node = %outcome.id, error = %reason, "node failed");
                    errors.push(format!("node '{}' failed: {}", outcome.id, reason));
                    failed.insert(outcome.id);
                }
            }
        }
    }

    /// Run compensations in reverse registration order.
    ///
    /// Registration precedes execution, so this equals reverse scheduling
    /// order. Errors are recorded, never propagated.
    async fn run_compensations(
        &self,
        stack: &mut Vec<StepCompensation>,
        context: &WorkflowContext,
        errors: &mut Vec<String>,
    ) {
        if stack.is_empty() {
            return;
        }

        info!(dag_id = %self.dag_id, count = stack.len(), "running DAG compensations");
        let snapshot = context.step_results_value();

        for compensation in stack.iter_mut().rev() {
            let idempotency_key = compensation
                .idempotency_key
                .clone()
                .unwrap_or_else(|| format!("{}:{}", self.dag_id, compensation.name));
            let comp_input = serde_json::json!({
                "dag_id": self.dag_id,
                "compensation_name": compensation.name,
                "context": snapshot,
                "idempotency_key": idempotency_key,
            });

            compensation.mark_executing();
            match tokio::time::timeout(compensation.timeout, compensation.invoke(comp_input)).await
            {
                Ok(Ok(true)) => {
                    compensation.mark_completed();
                    info!(dag_id = %self.dag_id, compensation = %compensation.name, "compensation completed");
                }
                Ok(Ok(false)) => {
                    compensation.mark_failed();
                    errors.push(format!("compensation '{}' failed", compensation.name));
                    error!(dag_id = %self.dag_id, compensation = %compensation.name, "compensation reported failure");
                }
                Ok(Err(err)) => {
                    compensation.mark_failed();
                    errors.push(format!(
                        "compensation '{}' failed: {}",
                        compensation.name, err
                    ));
                    error!(dag_id = %self.dag_id, compensation = %compensation.name, error = %err, "compensation failed");
                }
                Err(_) => {
                    compensation.mark_failed();
                    errors.push(format!("compensation '{}' timed out", compensation.name));
                    error!(dag_id = %self.dag_id, compensation = %compensation.name, "compensation timed out");
                }
            }
        }
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

    fn context() -> WorkflowContext {
        WorkflowContext::generate(hash())
    }

    fn noop(id: &str) -> DagNode {
        DagNode::new(id, id.to_uppercase(), |_| async { Ok(json!("done")) })
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let mut dag = DagExecutor::with_id("dup", hash());
        dag.add_node(noop("a")).unwrap();
        let err = dag.add_node(noop("a")).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateNode { .. }));
    }

    #[test]
    fn rejects_self_dependency() {
        let mut dag = DagExecutor::with_id("selfdep", hash());
        let err = dag.add_node(noop("a").depends_on("a")).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected { .. }));
    }

    #[test]
    fn rejects_cycles_atomically() {
        let mut dag = DagExecutor::with_id("cycle", hash());
        dag.add_node(noop("a").depends_on("c")).unwrap();
        dag.add_node(noop("b").depends_on("a")).unwrap();
        let err = dag.add_node(noop("c").depends_on("b")).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected { .. }));
        // The rejected node must not remain in the graph
        assert!(dag.get_node("c").is_none());
        assert_eq!(dag.len(), 2);
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let mut dag = DagExecutor::with_id("topo", hash());
        dag.add_node(noop("d").with_dependencies(vec!["b".into(), "c".into()]))
            .unwrap();
        dag.add_node(noop("a")).unwrap();
        dag.add_node(noop("b").depends_on("a")).unwrap();
        dag.add_node(noop("c").depends_on("a")).unwrap();

        let order = dag.get_execution_order();
        let position =
            |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(position("a") < position("b"));
        assert!(position("a") < position("c"));
        assert!(position("b") < position("d"));
        assert!(position("c") < position("d"));
    }

    #[tokio::test]
    async fn missing_dependency_is_deferred_to_execution() {
        let mut dag = DagExecutor::with_id("missing", hash());
        dag.add_node(noop("a").depends_on("ghost")).unwrap();
        let mut ctx = context();
        let err = dag.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::MissingDependency { .. }));
    }

    #[tokio::test]
    async fn executes_in_dependency_order_and_shares_results() {
        let mut dag = DagExecutor::with_id("chain", hash());
        dag.add_node(DagNode::new("producer", "Producer", |_| async {
            Ok(json!(42))
        }))
        .unwrap();
        dag.add_node(
            DagNode::new("consumer", "Consumer", |ctx: NodeContext| async move {
                let prior = ctx
                    .get_step_result("producer")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                Ok(json!(prior * 2))
            })
            .depends_on("producer"),
        )
        .unwrap();

        let mut ctx = context();
        let result = dag.execute(&mut ctx).await.unwrap();
        assert_eq!(result.status, DagStatus::Completed);
        assert_eq!(result.node_results["producer"], json!(42));
        assert_eq!(result.node_results["consumer"], json!(84));
        let producer_pos = result
            .nodes_completed
            .iter()
            .position(|n| n == "producer")
            .unwrap();
        let consumer_pos = result
            .nodes_completed
            .iter()
            .position(|n| n == "consumer")
            .unwrap();
        assert!(producer_pos < consumer_pos);
    }

    #[tokio::test]
    async fn required_failure_cascades_to_skipped() {
        let mut dag = DagExecutor::with_id("cascade", hash());
        dag.add_node(noop("a")).unwrap();
        dag.add_node(
            DagNode::new("b", "B", |_| async {
                Err(WorkflowError::StepFailed {
                    step: "b".to_string(),
                    reason: "boom".to_string(),
                })
            })
            .depends_on("a"),
        )
        .unwrap();
        dag.add_node(noop("c").depends_on("b")).unwrap();

        let mut ctx = context();
        let result = dag.execute(&mut ctx).await.unwrap();
        assert_eq!(result.status, DagStatus::PartiallyCompleted);
        assert_eq!(result.nodes_completed, vec!["a"]);
        assert_eq!(result.nodes_failed, vec!["b"]);
        assert_eq!(result.nodes_skipped, vec!["c"]);
    }

    #[tokio::test]
    async fn optional_failure_becomes_skip() {
        let mut dag = DagExecutor::with_id("optional", hash());
        dag.add_node(noop("a")).unwrap();
        dag.add_node(
            DagNode::new("b", "Optional B", |_| async {
                Err(WorkflowError::StepFailed {
                    step: "b".to_string(),
                    reason: "boom".to_string(),
                })
            })
            .depends_on("a")
            .optional(),
        )
        .unwrap();
        dag.add_node(noop("c").depends_on("a")).unwrap();

        let mut ctx = context();
        let result = dag.execute(&mut ctx).await.unwrap();
        assert_eq!(result.status, DagStatus::Completed);
        assert!(result.nodes_completed.contains(&"a".to_string()));
        assert!(result.nodes_completed.contains(&"c".to_string()));
        assert_eq!(result.nodes_skipped, vec!["b"]);
    }

    #[tokio::test]
    async fn node_timeout_is_failure() {
        let mut dag = DagExecutor::with_id("timeout", hash());
        dag.add_node(
            DagNode::new("slow", "Slow", |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("late"))
            })
            .with_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        let mut ctx = context();
        let result = dag.execute(&mut ctx).await.unwrap();
        assert_eq!(result.status, DagStatus::Failed);
        assert_eq!(result.nodes_failed, vec!["slow"]);
        assert!(result.errors[0].contains("timeout"));
    }

    #[tokio::test]
    async fn cache_hit_skips_execution_with_zero_duration() {
        let cache = Arc::new(DashMap::new());
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

        for round in 0..2 {
            let calls = calls.clone();
            let mut dag = DagExecutor::with_id(format!("cached-{round}"), hash())
                .with_shared_cache(cache.clone());
            dag.add_node(
                DagNode::new("expensive", "Expensive", move |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(json!("computed"))
                    }
                })
                .with_cache_key("expensive:v1"),
            )
            .unwrap();

            let mut ctx = context();
            let result = dag.execute(&mut ctx).await.unwrap();
            assert_eq!(result.node_results["expensive"], json!("computed"));
            if round == 1 {
                assert_eq!(dag.get_node("expensive").unwrap().execution_time_ms, 0.0);
            }
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_runs_compensations_in_reverse_registration_order() {
        let order: Arc<parking_lot::Mutex<Vec<String>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let track = |name: &str| {
            let order = order.clone();
            let name = name.to_string();
            StepCompensation::new(name.clone(), move |_| {
                let order = order.clone();
                let name = name.clone();
                async move {
                    order.lock().push(name);
                    Ok(true)
                }
            })
        };

        let mut dag = DagExecutor::with_id("comp", hash()).with_max_parallel_nodes(1);
        dag.add_node(noop("a").with_compensation(track("undo_a")))
            .unwrap();
        dag.add_node(
            noop("b")
                .depends_on("a")
                .with_compensation(track("undo_b")),
        )
        .unwrap();
        dag.add_node(
            DagNode::new("c", "C", |_| async {
                Err(WorkflowError::StepFailed {
                    step: "c".to_string(),
                    reason: "boom".to_string(),
                })
            })
            .depends_on("b"),
        )
        .unwrap();

        let mut ctx = context();
        let result = dag.execute(&mut ctx).await.unwrap();
        assert_eq!(result.status, DagStatus::PartiallyCompleted);
        assert_eq!(*order.lock(), vec!["undo_b", "undo_a"]);
    }

    #[tokio::test]
    async fn fail_closed_rejects_context_hash_mismatch() {
        let mut dag = DagExecutor::with_id("governed", hash());
        dag.add_node(noop("checked")).unwrap();

        let mut ctx = context();
        ctx.set_step_result("constitutional_hash", json!("0000000000000000"))
            .unwrap();
        let result = dag.execute(&mut ctx).await.unwrap();
        assert_eq!(result.status, DagStatus::Failed);
        assert!(result.errors[0].contains("mismatch"));
    }

    #[tokio::test]
    async fn fail_open_tolerates_context_hash_mismatch() {
        let mut dag = DagExecutor::with_id("diagnostic", hash()).with_fail_open();
        dag.add_node(noop("checked")).unwrap();

        let mut ctx = context();
        ctx.set_step_result("constitutional_hash", json!("0000000000000000"))
            .unwrap();
        let result = dag.execute(&mut ctx).await.unwrap();
        assert_eq!(result.status, DagStatus::Completed);
    }

    #[tokio::test]
    async fn result_carries_hash() {
        let mut dag = DagExecutor::with_id("hashed", hash());
        dag.add_node(noop("a")).unwrap();
        let mut ctx = context();
        let result = dag.execute(&mut ctx).await.unwrap();
        let mapping = result.to_mapping().unwrap();
        assert_eq!(mapping["constitutional_hash"], json!("cdd01ef066bc6cf2"));
    }
}
