//! Declarative workflow templates
//!
//! Loads YAML workflow definitions, validates them against the runtime's
//! expected governance hash and registered actions, and instantiates the
//! matching executor. Unknown action names are a hard failure at template
//! validation time, never at execution time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use async_trait::async_trait;

use crate::config::{WorkflowConfig, WorkflowType};
use crate::constants::ConstitutionalHash;
use crate::cyclic::{GlobalState, GraphDefinition, NodeExecutionResult, StateNode};
use crate::dag::{DagExecutor, DagNode};
use crate::error::{EngineResult, WorkflowError};
use crate::saga::{Saga, SagaStep};
use crate::step::{StepCompensation, StepFn, WorkflowStep};
use crate::workflow::SequentialWorkflow;

/// A step declaration inside a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStep {
    /// Step name
    pub name: String,
    /// Registered action executed by the step
    pub action: Option<String>,
    /// Registered action compensating the step
    #[serde(default)]
    pub compensation_action: Option<String>,
    /// Upstream step names (DAG templates)
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether failure is tolerated
    #[serde(default)]
    pub optional: bool,
    /// Whether the step is critical (saga templates)
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// Per-step timeout override in seconds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_critical() -> bool {
    true
}

/// Parsed workflow template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Template name, used in metrics and logs
    pub name: String,
    /// Template version
    pub version: String,
    /// Template description
    #[serde(default)]
    pub description: String,
    /// Governance hash the template was authored against
    pub constitutional_hash: String,
    /// Executor selection
    pub workflow_type: WorkflowType,
    /// Ordered step declarations
    pub steps: Vec<TemplateStep>,
    /// Run configuration
    #[serde(default)]
    pub config: WorkflowConfig,
    /// Free-form template metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl WorkflowTemplate {
    /// Parse a template from YAML
    pub fn from_yaml(content: &str) -> EngineResult<Self> {
        serde_yaml::from_str(content).map_err(Into::into)
    }

    /// Validate the template against the runtime.
    ///
    /// Returns every violation found rather than stopping at the first.
    pub fn validate(
        &self,
        expected_hash: &ConstitutionalHash,
        required_version: Option<&str>,
        registry: &ActionRegistry,
    ) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("template name is required".to_string());
        }
        if let Some(required) = required_version {
            if self.version != required {
                errors.push(format!(
                    "version mismatch: runtime requires {}, template declares {}",
                    required, self.version
                ));
            }
        }
        if !expected_hash.matches(&self.constitutional_hash) {
            errors.push(format!(
                "constitutional hash mismatch: expected {}, got {}",
                expected_hash, self.constitutional_hash
            ));
        }
        if self.steps.is_empty() {
            errors.push("at least one step is required".to_string());
        }
        for (index, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                errors.push(format!("step {}: name is required", index));
            }
            match &step.action {
                None => errors.push(format!("step {}: action is required", index)),
                Some(action) => {
                    if !registry.contains(action) {
                        errors.push(format!("step {}: unknown action '{}'", index, action));
                    }
                }
            }
            if let Some(compensation) = &step.compensation_action {
                if !registry.contains(compensation) {
                    errors.push(format!(
                        "step {}: unknown compensation action '{}'",
                        index, compensation
                    ));
                }
            }
        }

        errors
    }
}

/// Registry mapping action names to activity-invoking closures.
///
/// Populated at startup; templates referencing unregistered names are
/// rejected during validation.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, StepFn>>,
}

impl ActionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under the given name
    pub fn register<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = EngineResult<Value>> + Send + 'static,
    {
        let name = name.into();
        debug!(action = %name, "registered action");
        self.actions
            .write()
            .insert(name, Arc::new(move |input| Box::pin(action(input))));
    }

    /// Look up an action by name
    pub fn get(&self, name: &str) -> Option<StepFn> {
        self.actions.read().get(name).cloned()
    }

    /// Whether an action is registered
    pub fn contains(&self, name: &str) -> bool {
        self.actions.read().contains_key(name)
    }

    /// Registered action names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// A workflow instantiated from a template
pub enum BuiltWorkflow {
    /// Sequential steps on the base engine
    Sequential(SequentialWorkflow),
    /// Saga with LIFO compensation
    Saga(Saga),
    /// Dependency-scheduled DAG (also used for `parallel` templates)
    Dag(DagExecutor),
    /// Linear state graph
    Cyclic(GraphDefinition),
}

/// Template engine loading declarative definitions and instantiating
/// executors from the action registry
pub struct TemplateEngine {
    registry: Arc<ActionRegistry>,
    expected_hash: ConstitutionalHash,
    required_version: Option<String>,
    templates: RwLock<HashMap<String, WorkflowTemplate>>,
}

impl TemplateEngine {
    /// Create a template engine over the given registry
    pub fn new(registry: Arc<ActionRegistry>, expected_hash: ConstitutionalHash) -> Self {
        Self {
            registry,
            expected_hash,
            required_version: None,
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Reject templates not declaring this exact version
    pub fn with_required_version(mut self, version: impl Into<String>) -> Self {
        self.required_version = Some(version.into());
        self
    }

    /// Action registry
    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Load and validate a template from YAML, caching it by name
    pub fn load_from_str(&self, content: &str) -> EngineResult<WorkflowTemplate> {
        let template = WorkflowTemplate::from_yaml(content)?;
        let errors = template.validate(
            &self.expected_hash,
            self.required_version.as_deref(),
            &self.registry,
        );
        if !errors.is_empty() {
            return Err(WorkflowError::Template(format!(
                "template validation failed: {}",
                errors.join("; ")
            )));
        }
        info!(template = %template.name, version = %template.version, "loaded template");
        self.templates
            .write()
            .insert(template.name.clone(), template.clone());
        Ok(template)
    }

    /// Previously loaded template by name
    pub fn get_template(&self, name: &str) -> Option<WorkflowTemplate> {
        self.templates.read().get(name).cloned()
    }

    /// Names of loaded templates, sorted
    pub fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate the executor selected by the template's workflow type
    pub fn build(&self, template: &WorkflowTemplate) -> EngineResult<BuiltWorkflow> {
        match template.workflow_type {
            WorkflowType::Sequential => Ok(BuiltWorkflow::Sequential(
                self.build_sequential(template)?,
            )),
            WorkflowType::Saga => Ok(BuiltWorkflow::Saga(self.build_saga(template)?)),
            WorkflowType::Dag | WorkflowType::Parallel => {
                Ok(BuiltWorkflow::Dag(self.build_dag(template)?))
            }
            WorkflowType::Cyclic => Ok(BuiltWorkflow::Cyclic(self.build_cyclic(template)?)),
        }
    }

    fn action(&self, template: &WorkflowTemplate, step: &TemplateStep) -> EngineResult<StepFn> {
        let name = step.action.as_deref().ok_or_else(|| {
            WorkflowError::Template(format!("step '{}': action is required", step.name))
        })?;
        self.registry.get(name).ok_or_else(|| {
            WorkflowError::Template(format!(
                "template '{}': unknown action '{}'",
                template.name, name
            ))
        })
    }

    fn compensation(
        &self,
        template: &WorkflowTemplate,
        step: &TemplateStep,
    ) -> EngineResult<Option<StepCompensation>> {
        let Some(name) = step.compensation_action.as_deref() else {
            return Ok(None);
        };
        let action = self.registry.get(name).ok_or_else(|| {
            WorkflowError::Template(format!(
                "template '{}': unknown compensation action '{}'",
                template.name, name
            ))
        })?;
        Ok(Some(StepCompensation::new(name, move |input| {
            let action = action.clone();
            async move {
                action(input).await?;
                Ok(true)
            }
        })))
    }

    fn step_timeout(template: &WorkflowTemplate, step: &TemplateStep) -> Duration {
        Duration::from_secs(
            step.timeout_seconds
                .unwrap_or(template.config.timeout_seconds.min(30)),
        )
    }

    fn build_sequential(&self, template: &WorkflowTemplate) -> EngineResult<SequentialWorkflow> {
        let mut workflow = SequentialWorkflow::new(template.name.clone());
        for step in &template.steps {
            let action = self.action(template, step)?;
            let mut built = WorkflowStep::new(step.name.clone(), move |input| {
                let action = action.clone();
                async move { action(input).await }
            })
            .with_retries(template.config.max_retries)
            .with_retry_delay(template.config.retry_delay())
            .with_timeout(Self::step_timeout(template, step));
            if let Some(compensation) = self.compensation(template, step)? {
                built = built.with_compensation(compensation);
            }
            if step.optional {
                built = built.optional();
            }
            if !template.config.require_constitutional_validation {
                built = built.without_constitutional_check();
            }
            workflow = workflow.with_step(built);
        }
        Ok(workflow)
    }

    fn build_saga(&self, template: &WorkflowTemplate) -> EngineResult<Saga> {
        let mut saga = Saga::with_id(template.name.clone(), self.expected_hash.clone());
        for step in &template.steps {
            let action = self.action(template, step)?;
            let mut built = SagaStep::new(step.name.clone(), move |input| {
                let action = action.clone();
                async move { action(input).await }
            })
            .with_timeout(Self::step_timeout(template, step));
            if !step.critical {
                built = built.non_critical();
            }
            if let Some(name) = step.compensation_action.as_deref() {
                let compensation = self.registry.get(name).ok_or_else(|| {
                    WorkflowError::Template(format!(
                        "template '{}': unknown compensation action '{}'",
                        template.name, name
                    ))
                })?;
                built = built.with_compensation(move |input| {
                    let compensation = compensation.clone();
                    async move {
                        compensation(input).await?;
                        Ok(true)
                    }
                });
            }
            saga.add_step(built);
        }
        Ok(saga)
    }

    fn build_dag(&self, template: &WorkflowTemplate) -> EngineResult<DagExecutor> {
        let mut dag = DagExecutor::with_id(template.name.clone(), self.expected_hash.clone());
        let sequential_chain = template.workflow_type == WorkflowType::Dag
            && template.steps.iter().all(|s| s.depends_on.is_empty());

        let mut previous: Option<String> = None;
        for step in &template.steps {
            let action = self.action(template, step)?;
            let mut node = DagNode::new(step.name.clone(), step.name.clone(), move |ctx| {
                let action = action.clone();
                async move {
                    let input = serde_json::to_value(&ctx)?;
                    action(input).await
                }
            })
            .with_timeout(Self::step_timeout(template, step));

            let dependencies = if !step.depends_on.is_empty() {
                step.depends_on.clone()
            } else if sequential_chain {
                // A dag template without explicit dependencies chains its
                // steps in declaration order
                previous.iter().cloned().collect()
            } else {
                Vec::new()
            };
            node = node.with_dependencies(dependencies);

            if let Some(compensation) = self.compensation(template, step)? {
                node = node.with_compensation(compensation);
            }
            if step.optional {
                node = node.optional();
            }
            if !template.config.require_constitutional_validation {
                node = node.without_constitutional_check();
            }
            dag.add_node(node)?;
            previous = Some(step.name.clone());
        }
        Ok(dag)
    }

    fn build_cyclic(&self, template: &WorkflowTemplate) -> EngineResult<GraphDefinition> {
        let first = template.steps.first().ok_or_else(|| {
            WorkflowError::Template(format!("template '{}': no steps", template.name))
        })?;
        let mut graph = GraphDefinition::new(
            template.name.clone(),
            template.name.clone(),
            first.name.clone(),
            self.expected_hash.clone(),
        )
        .with_max_execution_time(template.config.timeout());

        let mut previous: Option<String> = None;
        for step in &template.steps {
            let action = self.action(template, step)?;
            let node = ActionNode {
                id: step.name.clone(),
                optional: step.optional,
                action,
            };
            graph.add_node(Arc::new(node));
            if let Some(prev) = &previous {
                graph.add_edge(prev.clone(), step.name.clone());
            }
            previous = Some(step.name.clone());
        }
        Ok(graph)
    }
}

/// Reducer node backed by a registered action.
///
/// The current state entries form the action input; the action result is
/// recorded in the state under the node's identifier.
struct ActionNode {
    id: String,
    optional: bool,
    action: StepFn,
}

#[async_trait]
impl StateNode for ActionNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_optional(&self) -> bool {
        self.optional
    }

    async fn execute(&self, state: &mut GlobalState) -> NodeExecutionResult {
        let start = std::time::Instant::now();
        let input = match serde_json::to_value(state.state_data()) {
            Ok(input) => input,
            Err(err) => return NodeExecutionResult::failed(&self.id, err.to_string()),
        };
        match (self.action)(input).await {
            Ok(output) => {
                state.update(self.id.clone(), output.clone());
                NodeExecutionResult::completed(&self.id, output)
                    .with_execution_time(start.elapsed().as_secs_f64() * 1000.0)
            }
            Err(err) => NodeExecutionResult::failed(&self.id, err.to_string())
                .with_execution_time(start.elapsed().as_secs_f64() * 1000.0),
        }
    }
}
