//! Stateful pipeline executor.
//!
//! Interprets the AST one step at a time against a live context map and the
//! shared [`ContextService`], calling plugins through a [`PluginManager`].
//! Execution is single-threaded and strictly sequential: iteration elements
//! run one after another and the first error halts the pipeline.
//!
//! # Loop frames
//!
//! Every iterating step pushes a [`LoopFrame`] before its first element and
//! pops it after the last element, after `break`, or on failure. Frames nest
//! with the AST: when an inner frame pops, the enclosing block continues
//! with the step after the inner iterating step. `break` and `continue` set a
//! pending flag that every block checks before its next step; the innermost
//! frame consumes it.
//!
//! # Iteration context
//!
//! Each element runs against the outer context plus `item`. Afterwards every
//! key except `item` is merged back, so an enclosing loop keeps its own
//! `item` binding.
//!
//! # Jumps
//!
//! A `jump` moves execution to a named step in the same block. Each run
//! counts taken jumps and fails once `max_jumps` is exceeded. With
//! `reject_cycles` the executor refuses pipelines whose control graph has a
//! cycle.

use std::sync::Arc;

use pipewright_types::config::ExecutorConfig;
use pipewright_types::context::{Actor, ContextPath};
use pipewright_types::error::ContextError;
use pipewright_types::execution::{ExecutionStateNode, StepStatus};
use pipewright_types::pipeline::{
    AppendContextStep, ContextOperation, ContextOperationStep, LoadContextStep, PluginStep,
    RootNode, SaveContextStep, SetContextStep, StepKind, StepNode,
};
use serde_json::{Map, Value};

use super::expression::{CONTEXT_ROOT, ExpressionError, ExpressionEvaluator};
use super::graph::ControlGraph;
use super::plugin::{PluginError, PluginManager};
use crate::context::{ContextService, SetOptions};

/// Live-context key bound to the current element inside an iteration.
pub const ITEM_KEY: &str = "item";

/// Iteration labels longer than this are truncated.
pub const MAX_LABEL_CHARS: usize = 40;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that halt a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin '{plugin}' failed in step '{step}': {source}")]
    Plugin {
        step: String,
        plugin: String,
        source: PluginError,
    },

    #[error("expression error in step '{step}': {source}")]
    Expression {
        step: String,
        source: ExpressionError,
    },

    #[error("iterate expression of step '{step}' produced {found}, expected a list")]
    NotIterable { step: String, found: &'static str },

    #[error("step '{step}' jumps to unknown step '{target}'")]
    UnknownJumpTarget { step: String, target: String },

    #[error("jump limit of {limit} exceeded at step '{step}'")]
    JumpLimitExceeded { step: String, limit: u32 },

    #[error("'{kind}' step '{step}' used outside a loop")]
    LoopControlOutsideLoop { step: String, kind: &'static str },

    #[error("context error in step '{step}': {source}")]
    Context { step: String, source: ContextError },

    #[error("invalid context path '{path}' in step '{step}'")]
    InvalidContextPath { step: String, path: String },

    #[error("pipeline '{pipeline}' has a cycle: {}", .cycle.join(" -> "))]
    CycleRejected { pipeline: String, cycle: Vec<String> },
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

fn context_error(step: &StepNode) -> impl FnOnce(ContextError) -> ExecutionError + '_ {
    move |source| ExecutionError::Context {
        step: step.name.clone(),
        source,
    }
}

/// Display label for one iteration element.
pub fn iteration_label(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.chars().take(MAX_LABEL_CHARS).collect()
}

// ---------------------------------------------------------------------------
// Loop bookkeeping
// ---------------------------------------------------------------------------

/// Bookkeeping for one active iterating step.
#[derive(Debug, Clone)]
pub struct LoopFrame {
    pub step: String,
    pub data: Vec<Value>,
    pub index: usize,
    /// Position of the iterating step within its block.
    pub original_step_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Break,
    Continue,
}

// ---------------------------------------------------------------------------
// StatefulExecutor
// ---------------------------------------------------------------------------

/// Interprets pipelines from one AST.
pub struct StatefulExecutor {
    ast: Arc<RootNode>,
    context_service: Arc<ContextService>,
    plugins: Arc<dyn PluginManager>,
    evaluator: ExpressionEvaluator,
    config: ExecutorConfig,
    actor: Actor,
    context: Map<String, Value>,
    loop_stack: Vec<LoopFrame>,
    loop_control: Option<LoopControl>,
    states: Vec<ExecutionStateNode>,
    current_pipeline: String,
    jumps: u64,
}

impl StatefulExecutor {
    pub fn new(
        ast: RootNode,
        context_service: Arc<ContextService>,
        plugins: Arc<dyn PluginManager>,
    ) -> Self {
        let config = ExecutorConfig::default();
        Self {
            ast: Arc::new(ast),
            context_service,
            plugins,
            evaluator: ExpressionEvaluator::new(),
            actor: Actor::new(config.actor.as_str()),
            config,
            context: Map::new(),
            loop_stack: Vec::new(),
            loop_control: None,
            states: Vec::new(),
            current_pipeline: String::new(),
            jumps: 0,
        }
    }

    /// Apply executor settings. The configured actor role is used for every
    /// context store access.
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.actor = Actor::new(config.actor.as_str());
        self.config = config;
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    /// Seed the live context.
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn ast(&self) -> &RootNode {
        &self.ast
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    /// State tree of the most recent pipeline run.
    pub fn execution_state(&self) -> Option<&ExecutionStateNode> {
        self.states.last()
    }

    /// State trees of every run so far, oldest first.
    pub fn execution_states(&self) -> &[ExecutionStateNode] {
        &self.states
    }

    /// Number of active loop frames.
    pub fn loop_depth(&self) -> usize {
        self.loop_stack.len()
    }

    /// Run one pipeline by name. Returns the live context afterwards.
    pub fn execute_pipeline(&mut self, name: &str) -> Result<Map<String, Value>, ExecutionError> {
        let ast = Arc::clone(&self.ast);
        let pipeline = ast
            .pipeline(name)
            .ok_or_else(|| ExecutionError::PipelineNotFound(name.to_string()))?;

        if self.config.reject_cycles {
            let graph = ControlGraph::build(&ast);
            if let Some(cycle) = graph.cycles_in(name).into_iter().next() {
                tracing::warn!(pipeline = name, cycle = ?cycle, "refusing cyclic pipeline");
                return Err(ExecutionError::CycleRejected {
                    pipeline: name.to_string(),
                    cycle,
                });
            }
        }

        self.loop_stack.clear();
        self.loop_control = None;
        self.jumps = 0;
        self.current_pipeline = name.to_string();
        let mut root = ExecutionStateNode::for_pipeline(pipeline);
        root.mark_running();
        self.states.push(root);

        tracing::info!(pipeline = name, steps = pipeline.steps.len(), "pipeline started");
        let mut path = Vec::new();
        let result = self.run_block(&pipeline.steps, &mut path);
        self.loop_stack.clear();
        self.loop_control = None;

        match result {
            Ok(()) => {
                self.update_node(&[], |node| node.mark_completed());
                tracing::info!(pipeline = name, jumps = self.jumps, "pipeline completed");
                Ok(self.context.clone())
            }
            Err(e) => {
                let message = e.to_string();
                self.update_node(&[], |node| node.mark_failed(message));
                tracing::error!(pipeline = name, error = %e, "pipeline failed");
                Err(e)
            }
        }
    }

    /// Run every enabled pipeline in declaration order.
    pub fn execute_all(&mut self) -> Result<Map<String, Value>, ExecutionError> {
        let ast = Arc::clone(&self.ast);
        for pipeline in &ast.pipelines {
            if !pipeline.enabled {
                tracing::info!(pipeline = %pipeline.name, "skipping disabled pipeline");
                continue;
            }
            self.execute_pipeline(&pipeline.name)?;
        }
        Ok(self.context.clone())
    }

    // -----------------------------------------------------------------------
    // State tree
    // -----------------------------------------------------------------------

    fn update_node(&mut self, path: &[usize], f: impl FnOnce(&mut ExecutionStateNode)) {
        if let Some(node) = self.states.last_mut().and_then(|root| root.node_mut(path)) {
            f(node);
        }
    }

    fn set_iteration_status(&mut self, path: &[usize], index: usize, status: StepStatus) {
        self.update_node(path, |node| {
            if let Some(iterations) = node.iterations.as_mut() {
                iterations.set_status(index, status);
            }
        });
    }

    // -----------------------------------------------------------------------
    // Blocks and steps
    // -----------------------------------------------------------------------

    fn run_block(&mut self, steps: &[StepNode], path: &mut Vec<usize>) -> Result<(), ExecutionError> {
        let mut index = 0;
        while index < steps.len() {
            if self.loop_control.is_some() {
                return Ok(());
            }

            let step = &steps[index];
            path.push(index);
            let outcome = self.run_step(step, path);
            path.pop();

            match outcome? {
                None => index += 1,
                Some(target) => {
                    index = steps.iter().position(|s| s.name == target).ok_or_else(|| {
                        ExecutionError::UnknownJumpTarget {
                            step: step.name.clone(),
                            target: target.clone(),
                        }
                    })?;
                    self.jumps = self.jumps.saturating_add(1);
                    if self.jumps > u64::from(self.config.max_jumps) {
                        return Err(ExecutionError::JumpLimitExceeded {
                            step: step.name.clone(),
                            limit: self.config.max_jumps,
                        });
                    }
                    tracing::debug!(from = %step.name, to = %target, jumps = self.jumps, "jump");
                }
            }
        }
        Ok(())
    }

    /// Run one step with state tracking. Returns a jump target if taken.
    fn run_step(&mut self, step: &StepNode, path: &[usize]) -> Result<Option<String>, ExecutionError> {
        self.update_node(path, |node| node.mark_running());
        tracing::debug!(
            pipeline = %self.current_pipeline,
            step = %step.name,
            step_type = step.type_name(),
            "step started"
        );

        let mut inner_path = path.to_vec();
        let result = if step.is_iterative() {
            self.run_iterations(step, &mut inner_path).map(|()| None)
        } else {
            self.run_body(step, &mut inner_path)
        };

        match &result {
            Ok(_) => self.update_node(path, |node| node.mark_completed()),
            Err(e) => {
                let message = e.to_string();
                tracing::error!(
                    pipeline = %self.current_pipeline,
                    step = %step.name,
                    error = %message,
                    "step failed"
                );
                self.update_node(path, |node| node.mark_failed(message));
            }
        }
        result
    }

    /// The step's own action followed by its nested steps.
    fn run_body(&mut self, step: &StepNode, path: &mut Vec<usize>) -> Result<Option<String>, ExecutionError> {
        let (jump, run_children) = match &step.kind {
            StepKind::Plugin(plugin) => {
                if plugin.plugin.is_some() {
                    self.call_plugin(step, plugin)?;
                }
                (None, true)
            }
            StepKind::Conditional(conditional) => {
                let holds = self.evaluate_bool(step, &conditional.condition)?;
                tracing::debug!(step = %step.name, holds, "condition evaluated");
                (None, holds)
            }
            StepKind::Jump(jump) => {
                let take = match &jump.condition {
                    Some(condition) => self.evaluate_bool(step, condition)?,
                    None => true,
                };
                (take.then(|| jump.target.clone()), true)
            }
            StepKind::SetContext(set) => {
                self.set_context_step(step, set)?;
                (None, true)
            }
            StepKind::LoadContext(load) => {
                self.load_context_step(step, load)?;
                (None, true)
            }
            StepKind::AppendContext(append) => {
                self.append_context_step(step, append)?;
                (None, true)
            }
            StepKind::SaveContext(save) => {
                self.save_context_step(step, save)?;
                (None, true)
            }
            StepKind::ContextOperation(operation) => {
                self.context_operation_step(step, operation)?;
                (None, true)
            }
            StepKind::Break => {
                self.request_loop_control(step, LoopControl::Break)?;
                (None, false)
            }
            StepKind::Continue => {
                self.request_loop_control(step, LoopControl::Continue)?;
                (None, false)
            }
        };

        if run_children && !step.steps.is_empty() {
            self.run_block(&step.steps, path)?;
        }
        Ok(jump)
    }

    fn request_loop_control(&mut self, step: &StepNode, control: LoopControl) -> Result<(), ExecutionError> {
        if self.loop_stack.is_empty() {
            return Err(ExecutionError::LoopControlOutsideLoop {
                step: step.name.clone(),
                kind: step.type_name(),
            });
        }
        self.loop_control = Some(control);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------------

    fn run_iterations(&mut self, step: &StepNode, path: &mut Vec<usize>) -> Result<(), ExecutionError> {
        let expression = step.iterate.as_deref().unwrap_or_default();
        let data = match self.evaluate(step, expression)? {
            Value::Array(items) => items,
            other => {
                return Err(ExecutionError::NotIterable {
                    step: step.name.clone(),
                    found: value_kind(&other),
                });
            }
        };

        let labels = data.iter().map(iteration_label).collect();
        self.update_node(path, |node| {
            node.iterations.get_or_insert_with(Default::default).start(labels)
        });

        if data.is_empty() {
            tracing::debug!(step = %step.name, "iterate produced no elements");
            return Ok(());
        }

        tracing::debug!(step = %step.name, count = data.len(), depth = self.loop_stack.len() + 1, "loop started");
        self.loop_stack.push(LoopFrame {
            step: step.name.clone(),
            data,
            index: 0,
            original_step_index: path.last().copied().unwrap_or_default(),
        });
        let result = self.drive_loop(step, path);
        self.loop_stack.pop();
        result
    }

    fn drive_loop(&mut self, step: &StepNode, path: &mut Vec<usize>) -> Result<(), ExecutionError> {
        loop {
            let Some(frame) = self.loop_stack.last() else {
                return Ok(());
            };
            if frame.index >= frame.data.len() {
                return Ok(());
            }
            let index = frame.index;
            let item = frame.data[index].clone();

            self.set_iteration_status(path, index, StepStatus::Running);
            if let Err(e) = self.run_iteration(step, path, item) {
                self.set_iteration_status(path, index, StepStatus::Failed);
                return Err(e);
            }
            self.set_iteration_status(path, index, StepStatus::Completed);

            if self.loop_control.take() == Some(LoopControl::Break) {
                tracing::debug!(step = %step.name, index, "loop broken");
                return Ok(());
            }
            if let Some(frame) = self.loop_stack.last_mut() {
                frame.index += 1;
            }
        }
    }

    fn run_iteration(&mut self, step: &StepNode, path: &mut Vec<usize>, item: Value) -> Result<(), ExecutionError> {
        let outer = self.context.clone();
        self.context.insert(ITEM_KEY.to_string(), item);

        let result = self.run_body(step, path).map(|jump| {
            if let Some(target) = jump {
                tracing::warn!(step = %step.name, target = %target, "jump ignored inside iteration");
            }
        });

        let iteration_context = std::mem::replace(&mut self.context, outer);
        self.context.extend(
            iteration_context
                .into_iter()
                .filter(|(key, _)| key != ITEM_KEY),
        );
        result
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn evaluate(&self, step: &StepNode, expression: &str) -> Result<Value, ExecutionError> {
        self.evaluator
            .evaluate(expression, &self.context)
            .map_err(|source| ExecutionError::Expression {
                step: step.name.clone(),
                source,
            })
    }

    fn evaluate_bool(&self, step: &StepNode, expression: &str) -> Result<bool, ExecutionError> {
        self.evaluator
            .evaluate_bool(expression, &self.context)
            .map_err(|source| ExecutionError::Expression {
                step: step.name.clone(),
                source,
            })
    }

    fn resolve(&self, step: &StepNode, value: &Value) -> Result<Value, ExecutionError> {
        self.evaluator
            .resolve_value(value, &self.context)
            .map_err(|source| ExecutionError::Expression {
                step: step.name.clone(),
                source,
            })
    }

    fn context_path(step: &StepNode, path: &str) -> Result<ContextPath, ExecutionError> {
        ContextPath::parse(path).ok_or_else(|| ExecutionError::InvalidContextPath {
            step: step.name.clone(),
            path: path.to_string(),
        })
    }

    // -----------------------------------------------------------------------
    // Step actions
    // -----------------------------------------------------------------------

    fn call_plugin(&mut self, step: &StepNode, plugin_step: &PluginStep) -> Result<(), ExecutionError> {
        let Some((plugin_type, name)) = plugin_step.plugin_ref() else {
            return Ok(());
        };
        let reference = plugin_step.plugin.clone().unwrap_or_default();
        let plugin = match plugin_type {
            Some(plugin_type) => self.plugins.get_plugin(plugin_type, name),
            None => self.plugins.find_plugin(name),
        }
        .ok_or_else(|| ExecutionError::PluginNotFound(reference.clone()))?;

        let mut step_config = Map::new();
        step_config.insert("name".to_string(), Value::String(step.name.clone()));
        step_config.insert("type".to_string(), Value::String(step.type_name().to_string()));
        step_config.insert("plugin".to_string(), Value::String(reference.clone()));
        step_config.insert(
            "config".to_string(),
            self.resolve(step, &Value::Object(plugin_step.config.clone()))?,
        );
        if let Some(input_key) = &plugin_step.input_key {
            step_config.insert("input_key".to_string(), Value::String(input_key.clone()));
        }
        if let Some(output_key) = &plugin_step.output_key {
            step_config.insert("output_key".to_string(), Value::String(output_key.clone()));
        }

        tracing::debug!(step = %step.name, plugin = %reference, "calling plugin");
        let output = plugin
            .execute_pipeline_step(&step_config, &self.context)
            .map_err(|source| ExecutionError::Plugin {
                step: step.name.clone(),
                plugin: reference,
                source,
            })?;

        match &plugin_step.output_key {
            Some(key) => {
                self.context.insert(key.clone(), Value::Object(output));
            }
            None => self.context.extend(output),
        }
        Ok(())
    }

    fn set_context_step(&mut self, step: &StepNode, set: &SetContextStep) -> Result<(), ExecutionError> {
        let path = Self::context_path(step, &set.path)?;
        let value = self.resolve(step, &set.value)?;
        self.context_service
            .set_context(&self.actor, &path.namespace, &path.key, value, SetOptions::default())
            .map_err(context_error(step))?;
        Ok(())
    }

    fn load_context_step(&mut self, step: &StepNode, load: &LoadContextStep) -> Result<(), ExecutionError> {
        let path = Self::context_path(step, &load.path)?;
        let stored = self
            .context_service
            .get_context(&self.actor, &path.namespace, &path.key)
            .map_err(context_error(step))?;
        let value = match (stored, &load.default) {
            (Some(value), _) => value,
            (None, Some(default)) => self.resolve(step, default)?,
            (None, None) => {
                return Err(context_error(step)(ContextError::NotFound {
                    namespace: path.namespace,
                    key: path.key,
                }));
            }
        };
        let destination = load.destination.clone().unwrap_or(path.key);
        self.context.insert(destination, value);
        Ok(())
    }

    fn append_context_step(&mut self, step: &StepNode, append: &AppendContextStep) -> Result<(), ExecutionError> {
        let path = Self::context_path(step, &append.path)?;
        let value = self.resolve(step, &append.value)?;
        self.context_service
            .append_context(&self.actor, &path.namespace, &path.key, value)
            .map_err(context_error(step))?;
        Ok(())
    }

    fn save_context_step(&mut self, step: &StepNode, save: &SaveContextStep) -> Result<(), ExecutionError> {
        let path = Self::context_path(step, &save.path)?;
        let source = save
            .source
            .strip_prefix(CONTEXT_ROOT)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(&save.source);
        let value = self.evaluate(step, &format!("{CONTEXT_ROOT}.{source}"))?;
        self.context_service
            .set_context(&self.actor, &path.namespace, &path.key, value, SetOptions::default())
            .map_err(context_error(step))?;
        Ok(())
    }

    fn context_operation_step(
        &mut self,
        step: &StepNode,
        operation_step: &ContextOperationStep,
    ) -> Result<(), ExecutionError> {
        let service = Arc::clone(&self.context_service);
        let actor = &self.actor;
        let result = match &operation_step.operation {
            ContextOperation::Merge {
                namespace,
                values,
                strategy,
            } => {
                let values = match self.resolve(step, &Value::Object(values.clone()))? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                Value::Object(
                    service
                        .merge_context(actor, namespace, values, *strategy)
                        .map_err(context_error(step))?,
                )
            }
            ContextOperation::Snapshot { namespace } => Value::from(
                service
                    .snapshot_context(actor, namespace)
                    .map_err(context_error(step))?,
            ),
            ContextOperation::Restore { snapshot_id } => {
                let resolved = self.resolve(step, snapshot_id)?;
                let id = resolved.as_u64().ok_or_else(|| ExecutionError::Expression {
                    step: step.name.clone(),
                    source: ExpressionError::Type(format!(
                        "snapshot_id must be a non-negative integer, got {resolved}"
                    )),
                })?;
                Value::Bool(service.restore_context(actor, id).map_err(context_error(step))?)
            }
            ContextOperation::Delete { namespace, key } => Value::Bool(
                service
                    .delete_context(actor, namespace, key.as_deref())
                    .map_err(context_error(step))?,
            ),
            ContextOperation::SaveToStorage { namespace } => Value::Bool(
                service
                    .save_to_storage(actor, namespace.as_deref())
                    .map_err(context_error(step))?,
            ),
            ContextOperation::LoadFromStorage { namespace } => Value::Bool(
                service
                    .load_from_storage(actor, namespace.as_deref())
                    .map_err(context_error(step))?,
            ),
            ContextOperation::DeleteFromStorage { namespace, key } => Value::Bool(
                service
                    .delete_from_storage(actor, namespace, key.as_deref())
                    .map_err(context_error(step))?,
            ),
        };

        if let Some(key) = &operation_step.output_key {
            self.context.insert(key.clone(), result);
        }
        Ok(())
    }
}

impl std::fmt::Debug for StatefulExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulExecutor")
            .field("pipelines", &self.ast.pipelines.len())
            .field("actor", &self.actor)
            .field("current_pipeline", &self.current_pipeline)
            .field("loop_depth", &self.loop_stack.len())
            .field("jumps", &self.jumps)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::context::persistence::MemoryBackend;
    use crate::pipeline::parser::PipelineParser;
    use crate::pipeline::plugin::{Plugin, PluginRegistry};
    use pipewright_types::execution::StepStatus;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    /// Records every call and returns `{ "calls": n }` plus the config.
    struct Recorder {
        calls: Arc<Mutex<Vec<Value>>>,
    }

    impl Plugin for Recorder {
        fn plugin_type(&self) -> &str {
            "Test"
        }

        fn name(&self) -> &str {
            "Recorder"
        }

        fn execute_pipeline_step(
            &self,
            step_config: &Map<String, Value>,
            context: &Map<String, Value>,
        ) -> Result<Map<String, Value>, PluginError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(context.get(ITEM_KEY).cloned().unwrap_or(Value::Null));
            let mut out = Map::new();
            out.insert("calls".to_string(), json!(calls.len()));
            out.insert("config".to_string(), step_config["config"].clone());
            Ok(out)
        }
    }

    struct Failing;

    impl Plugin for Failing {
        fn plugin_type(&self) -> &str {
            "Test"
        }

        fn name(&self) -> &str {
            "Failing"
        }

        fn execute_pipeline_step(
            &self,
            _step_config: &Map<String, Value>,
            _context: &Map<String, Value>,
        ) -> Result<Map<String, Value>, PluginError> {
            Err(PluginError::Failed("upstream unavailable".to_string()))
        }
    }

    struct Harness {
        executor: StatefulExecutor,
        service: Arc<ContextService>,
        calls: Arc<Mutex<Vec<Value>>>,
    }

    impl Harness {
        fn stored(&self, namespace: &str, key: &str) -> Option<Value> {
            self.service
                .get_context(&Actor::system(), namespace, key)
                .unwrap()
        }
    }

    fn harness_with(yaml: &str, config: ExecutorConfig, context: Value) -> Harness {
        let ast = PipelineParser::new().unwrap().load(yaml).unwrap();
        let service = Arc::new(ContextService::new().with_persistence(Box::new(MemoryBackend::new())));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Recorder { calls: calls.clone() }));
        registry.register(Arc::new(Failing));
        let executor = StatefulExecutor::new(ast, service.clone(), Arc::new(registry))
            .with_config(config)
            .with_context(context.as_object().cloned().unwrap_or_default());
        Harness {
            executor,
            service,
            calls,
        }
    }

    fn harness(yaml: &str) -> Harness {
        harness_with(yaml, ExecutorConfig::default(), json!({}))
    }

    // -----------------------------------------------------------------------
    // Context steps
    // -----------------------------------------------------------------------

    #[test]
    fn test_context_steps() {
        let mut h = harness_with(
            r#"
pipelines:
  - name: main
    steps:
      - { name: set, type: set_context, path: jobs.status, value: { state: "${ 'que' + 'ued' }" } }
      - { name: load, type: load_context, path: jobs.status, destination: status }
      - { name: fallback, type: load_context, path: jobs.missing, default: 7 }
      - { name: log1, type: append_context, path: jobs.log, value: "${ context.status.state }" }
      - { name: log2, type: append_context, path: jobs.log, value: second }
      - { name: save, type: save_context, source: context.seed.value, path: jobs.seed }
"#,
            ExecutorConfig::default(),
            json!({ "seed": { "value": 42 } }),
        );
        let context = h.executor.execute_pipeline("main").unwrap();
        assert_eq!(context["status"], json!({ "state": "queued" }));
        assert_eq!(context["missing"], json!(7));
        assert_eq!(h.stored("jobs", "log"), Some(json!(["queued", "second"])));
        assert_eq!(h.stored("jobs", "seed"), Some(json!(42)));
    }

    #[test]
    fn test_load_missing_without_default_fails() {
        let mut h = harness(
            r#"
pipelines:
  - name: main
    steps:
      - { name: load, type: load_context, path: jobs.nothing }
"#,
        );
        let err = h.executor.execute_pipeline("main").unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Context { source: ContextError::NotFound { .. }, .. }
        ));
    }

    #[test]
    fn test_context_operations() {
        let mut h = harness(
            r#"
pipelines:
  - name: main
    steps:
      - { name: set, type: set_context, path: jobs.status, value: queued }
      - { name: snap, type: context_operation, operation: snapshot, namespace: jobs, output_key: snap_id }
      - { name: change, type: set_context, path: jobs.status, value: running }
      - { name: merge, type: context_operation, operation: merge, namespace: jobs, values: { status: done }, strategy: keep, output_key: rejected }
      - { name: restore, type: context_operation, operation: restore, snapshot_id: "${ context.snap_id }", output_key: restored }
      - { name: persist, type: context_operation, operation: save_to_storage, namespace: jobs, output_key: saved }
"#,
        );
        let context = h.executor.execute_pipeline("main").unwrap();
        assert_eq!(context["snap_id"], json!(1));
        assert_eq!(context["rejected"], json!({ "status": "done" }));
        assert_eq!(context["restored"], json!(true));
        assert_eq!(context["saved"], json!(true));
        assert_eq!(h.stored("jobs", "status"), Some(json!("queued")));
    }

    // -----------------------------------------------------------------------
    // Plugins
    // -----------------------------------------------------------------------

    #[test]
    fn test_plugin_output_merged_or_keyed() {
        let mut h = harness(
            r#"
pipelines:
  - name: main
    steps:
      - name: first
        plugin: Test.Recorder
        config: { greeting: "${ 'hi' }" }
      - name: second
        plugin: Recorder
        output_key: result
"#,
        );
        let context = h.executor.execute_pipeline("main").unwrap();
        assert_eq!(context["calls"], json!(1));
        assert_eq!(context["config"], json!({ "greeting": "hi" }));
        assert_eq!(context["result"]["calls"], json!(2));
    }

    #[test]
    fn test_plugin_not_found() {
        let mut h = harness(
            r#"
pipelines:
  - name: main
    steps:
      - { name: call, plugin: Missing.Thing }
"#,
        );
        let err = h.executor.execute_pipeline("main").unwrap_err();
        assert!(matches!(err, ExecutionError::PluginNotFound(ref r) if r == "Missing.Thing"));
    }

    #[test]
    fn test_failure_halts_and_marks_failed() {
        let mut h = harness(
            r#"
pipelines:
  - name: main
    steps:
      - { name: boom, plugin: Test.Failing }
      - { name: never, type: set_context, path: ns.k, value: 1 }
"#,
        );
        let err = h.executor.execute_pipeline("main").unwrap_err();
        assert!(matches!(err, ExecutionError::Plugin { .. }));
        assert_eq!(h.stored("ns", "k"), None);

        let state = h.executor.execution_state().unwrap();
        assert_eq!(state.status, StepStatus::Failed);
        assert_eq!(state.children[0].status, StepStatus::Failed);
        assert!(state.children[0].error.as_deref().unwrap().contains("upstream unavailable"));
        assert_eq!(state.children[1].status, StepStatus::Pending);
    }

    // -----------------------------------------------------------------------
    // Conditionals and jumps
    // -----------------------------------------------------------------------

    #[test]
    fn test_conditional_runs_nested_only_when_true() {
        let mut h = harness_with(
            r#"
pipelines:
  - name: main
    steps:
      - name: positive
        type: conditional
        condition: context.n > 1
        steps:
          - { name: mark_positive, type: set_context, path: ns.positive, value: 1 }
      - name: negative
        type: conditional
        condition: context.n > 10
        steps:
          - { name: mark_negative, type: set_context, path: ns.negative, value: 1 }
"#,
            ExecutorConfig::default(),
            json!({ "n": 5 }),
        );
        h.executor.execute_pipeline("main").unwrap();
        assert_eq!(h.stored("ns", "positive"), Some(json!(1)));
        assert_eq!(h.stored("ns", "negative"), None);
        let state = h.executor.execution_state().unwrap();
        assert_eq!(state.children[1].status, StepStatus::Completed);
        assert_eq!(state.children[1].children[0].status, StepStatus::Pending);
    }

    const COUNTER: &str = r#"
pipelines:
  - name: main
    steps:
      - { name: init, type: set_context, path: ns.count, value: 0 }
      - { name: load, type: load_context, path: ns.count, destination: count }
      - { name: inc, type: set_context, path: ns.count, value: "${ context.count + 1 }" }
      - { name: back, type: jump, target: load, condition: context.count < 2 }
"#;

    #[test]
    fn test_conditional_jump_loops_until_false() {
        let mut h = harness(COUNTER);
        let context = h.executor.execute_pipeline("main").unwrap();
        assert_eq!(h.stored("ns", "count"), Some(json!(3)));
        assert_eq!(context["count"], json!(2));
    }

    #[test]
    fn test_jump_limit() {
        let config = ExecutorConfig {
            max_jumps: 1,
            ..ExecutorConfig::default()
        };
        let mut h = harness_with(COUNTER, config, json!({}));
        let err = h.executor.execute_pipeline("main").unwrap_err();
        assert!(matches!(err, ExecutionError::JumpLimitExceeded { limit: 1, .. }));
    }

    #[test]
    fn test_unbounded_jump_limit() {
        let config = ExecutorConfig {
            max_jumps: u32::MAX,
            ..ExecutorConfig::default()
        };
        let mut h = harness_with(COUNTER, config, json!({}));
        h.executor.execute_pipeline("main").unwrap();
        assert_eq!(h.stored("ns", "count"), Some(json!(3)));
    }

    #[test]
    fn test_reject_cycles() {
        let config = ExecutorConfig {
            reject_cycles: true,
            ..ExecutorConfig::default()
        };
        let mut h = harness_with(COUNTER, config, json!({}));
        let err = h.executor.execute_pipeline("main").unwrap_err();
        match err {
            ExecutionError::CycleRejected { pipeline, cycle } => {
                assert_eq!(pipeline, "main");
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.stored("ns", "count"), None);
    }

    // -----------------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------------

    #[test]
    fn test_iterate_runs_once_per_element() {
        let mut h = harness_with(
            r#"
pipelines:
  - name: main
    steps:
      - name: each
        plugin: Test.Recorder
        iterate: context.items
        steps:
          - { name: record, type: append_context, path: ns.seen, value: "${ context.item * 10 }" }
"#,
            ExecutorConfig::default(),
            json!({ "items": [1, 2, 3] }),
        );
        let context = h.executor.execute_pipeline("main").unwrap();
        assert_eq!(*h.calls.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(h.stored("ns", "seen"), Some(json!([10, 20, 30])));
        assert!(context.get(ITEM_KEY).is_none());
        assert_eq!(context["calls"], json!(3));

        let state = h.executor.execution_state().unwrap();
        let iterations = state.children[0].iterations.as_ref().unwrap();
        assert_eq!(iterations.count, 3);
        assert_eq!(iterations.labels, vec!["1", "2", "3"]);
        assert!(iterations.statuses.iter().all(|s| *s == StepStatus::Completed));
        assert_eq!(h.executor.loop_depth(), 0);
    }

    #[test]
    fn test_iterate_empty_list() {
        let mut h = harness_with(
            r#"
pipelines:
  - name: main
    steps:
      - name: each
        iterate: context.items
        steps:
          - { name: record, type: append_context, path: ns.seen, value: 1 }
"#,
            ExecutorConfig::default(),
            json!({ "items": [] }),
        );
        h.executor.execute_pipeline("main").unwrap();
        assert_eq!(h.stored("ns", "seen"), None);
        let state = h.executor.execution_state().unwrap();
        assert_eq!(state.children[0].status, StepStatus::Completed);
        assert_eq!(state.children[0].iterations.as_ref().unwrap().count, 0);
    }

    #[test]
    fn test_iterate_requires_list() {
        let mut h = harness_with(
            r#"
pipelines:
  - name: main
    steps:
      - { name: each, iterate: context.items }
"#,
            ExecutorConfig::default(),
            json!({ "items": "abc" }),
        );
        let err = h.executor.execute_pipeline("main").unwrap_err();
        assert!(matches!(err, ExecutionError::NotIterable { found: "a string", .. }));
    }

    fn loop_control_yaml(kind: &str) -> String {
        format!(
            r#"
pipelines:
  - name: main
    steps:
      - name: each
        iterate: context.items
        steps:
          - name: check
            type: conditional
            condition: context.item == 3
            steps:
              - {{ name: control, type: {kind} }}
          - {{ name: record, type: append_context, path: ns.seen, value: "${{ context.item }}" }}
      - {{ name: after, type: set_context, path: ns.after, value: true }}
"#
        )
    }

    #[test]
    fn test_break_leaves_innermost_loop() {
        let mut h = harness_with(
            &loop_control_yaml("break"),
            ExecutorConfig::default(),
            json!({ "items": [1, 2, 3, 4] }),
        );
        h.executor.execute_pipeline("main").unwrap();
        assert_eq!(h.stored("ns", "seen"), Some(json!([1, 2])));
        assert_eq!(h.stored("ns", "after"), Some(json!(true)));
    }

    #[test]
    fn test_continue_skips_rest_of_iteration() {
        let mut h = harness_with(
            &loop_control_yaml("continue"),
            ExecutorConfig::default(),
            json!({ "items": [1, 2, 3, 4] }),
        );
        h.executor.execute_pipeline("main").unwrap();
        assert_eq!(h.stored("ns", "seen"), Some(json!([1, 2, 4])));
    }

    #[test]
    fn test_nested_loops_resume_outer_body() {
        let mut h = harness_with(
            r#"
pipelines:
  - name: main
    steps:
      - name: outer
        iterate: context.groups
        steps:
          - { name: keep_group, type: save_context, source: item, path: ns.current }
          - { name: remember, type: load_context, path: ns.current, destination: group }
          - name: inner
            iterate: context.members
            steps:
              - name: stop
                type: conditional
                condition: context.item == 2
                steps:
                  - { name: out, type: break }
              - { name: pair, type: append_context, path: ns.pairs, value: "${ context.group + '-' + context.item }" }
          - { name: outer_done, type: append_context, path: ns.groups, value: "${ context.item }" }
"#,
            ExecutorConfig::default(),
            json!({ "groups": ["a", "b"], "members": [1, 2, 3] }),
        );
        h.executor.execute_pipeline("main").unwrap();
        assert_eq!(h.stored("ns", "pairs"), Some(json!(["a-1", "b-1"])));
        assert_eq!(h.stored("ns", "groups"), Some(json!(["a", "b"])));
    }

    #[test]
    fn test_break_outside_loop_fails() {
        let mut h = harness(
            r#"
pipelines:
  - name: main
    steps:
      - { name: stray, type: break }
"#,
        );
        let err = h.executor.execute_pipeline("main").unwrap_err();
        assert!(matches!(err, ExecutionError::LoopControlOutsideLoop { kind: "break", .. }));
    }

    #[test]
    fn test_expression_error_surfaces() {
        let mut h = harness(
            r#"
pipelines:
  - name: main
    steps:
      - { name: div, type: set_context, path: ns.k, value: "${ 1 / 0 }" }
"#,
        );
        let err = h.executor.execute_pipeline("main").unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Expression { source: ExpressionError::DivisionByZero, .. }
        ));
    }

    #[test]
    fn test_iteration_label_truncated() {
        assert_eq!(iteration_label(&json!("short")), "short");
        assert_eq!(iteration_label(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(iteration_label(&json!("x".repeat(100))).len(), MAX_LABEL_CHARS);
    }

    // -----------------------------------------------------------------------
    // Pipelines
    // -----------------------------------------------------------------------

    #[test]
    fn test_execute_all_skips_disabled() {
        let mut h = harness(
            r#"
pipelines:
  - name: first
    steps:
      - { name: a, type: set_context, path: ns.first, value: 1 }
  - name: off
    enabled: false
    steps:
      - { name: b, type: set_context, path: ns.off, value: 1 }
  - name: last
    steps:
      - { name: c, type: set_context, path: ns.last, value: 1 }
"#,
        );
        h.executor.execute_all().unwrap();
        assert_eq!(h.stored("ns", "first"), Some(json!(1)));
        assert_eq!(h.stored("ns", "off"), None);
        assert_eq!(h.stored("ns", "last"), Some(json!(1)));
        assert_eq!(h.executor.execution_states().len(), 2);
        assert_eq!(h.executor.execution_state().unwrap().name, "last");
    }

    #[test]
    fn test_unknown_pipeline() {
        let mut h = harness("pipelines: []");
        assert!(matches!(
            h.executor.execute_pipeline("ghost"),
            Err(ExecutionError::PipelineNotFound(_))
        ));
    }

    #[test]
    fn test_state_tree_serializes() {
        let mut h = harness(
            r#"
pipelines:
  - name: main
    steps:
      - { name: a, type: set_context, path: ns.a, value: 1 }
"#,
        );
        h.executor.execute_pipeline("main").unwrap();
        let value = serde_json::to_value(h.executor.execution_state().unwrap()).unwrap();
        assert_eq!(value["name"], "main");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["children"][0]["status"], "completed");
        assert!(value["children"][0]["start_time"].is_string());
    }
}
