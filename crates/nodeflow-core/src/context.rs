use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::{topics, EventBus};
use crate::path::{resolve, VariableRef};
use crate::template;
use crate::traits::{EvalScope, ExpressionEvaluator};
use crate::types::{GraphNode, Position};

/// Per-run table of node id to output value.
///
/// Created by the engine at the start of a run and handed to every node's
/// context; dropped when the run ends.
#[derive(Debug, Clone, Default)]
pub struct OutputMap {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl OutputMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    pub fn set(&self, node_id: impl Into<String>, value: Value) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.into(), value);
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(node_id)
    }

    /// Resolve a reference against the stored outputs without cloning whole
    /// outputs.
    pub fn resolve(&self, reference: &VariableRef) -> Option<Value> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&reference.source_id)
            .and_then(|output| resolve(output, &reference.segments))
            .map(|v| v.into_owned())
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identifiers shared by every node of one run.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub workflow_id: String,
    pub execution_id: String,
}

/// Severity of a plugin-emitted log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// Everything a plugin may use while executing one node.
///
/// Built by the engine for a single node execution and not retained by the
/// plugin afterwards.
#[derive(Clone)]
pub struct ExecutionContext {
    pub node_id: String,
    pub node_type: String,
    pub node_label: String,
    pub position: Position,
    /// Zero-based index of this node in the run's execution order.
    pub step: usize,
    pub run: RunInfo,
    pub input: Value,
    outputs: OutputMap,
    evaluator: Arc<dyn ExpressionEvaluator>,
    event_bus: Arc<EventBus>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("node_id", &self.node_id)
            .field("node_type", &self.node_type)
            .field("step", &self.step)
            .field("run", &self.run)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new(
        node: &GraphNode,
        run: RunInfo,
        input: Value,
        outputs: OutputMap,
        evaluator: Arc<dyn ExpressionEvaluator>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            node_label: node.label().to_string(),
            position: node.position,
            step: 0,
            run,
            input,
            outputs,
            evaluator,
            event_bus,
        }
    }

    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    /// Replace `{sourceId.path}` references with values from this run.
    ///
    /// `{input.path}` reads the current node's input unless a node named
    /// `input` has produced output. Unresolvable references stay verbatim.
    pub fn substitute(&self, text: &str) -> String {
        template::substitute(text, |reference| {
            self.outputs.resolve(reference).or_else(|| {
                (reference.source_id == "input")
                    .then(|| resolve(&self.input, &reference.segments).map(|v| v.into_owned()))
                    .flatten()
            })
        })
    }

    /// Substitute every string inside a JSON value.
    pub fn substitute_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.substitute_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Evaluate an expression with `input` (the given value) and `nodes`
    /// (every output of this run so far) in scope.
    pub fn evaluate(&self, expression: &str, input: &Value) -> Result<Value> {
        self.evaluate_with(expression, self.scope(input))
    }

    /// Evaluate with a caller-built scope.
    pub fn evaluate_with(&self, expression: &str, scope: EvalScope) -> Result<Value> {
        self.evaluator.evaluate(expression, &scope)
    }

    /// Default scope: `input` and `nodes`.
    pub fn scope(&self, input: &Value) -> EvalScope {
        let nodes: serde_json::Map<String, Value> = self.outputs.snapshot().into_iter().collect();
        EvalScope::new()
            .with("input", input.clone())
            .with("nodes", Value::Object(nodes))
    }

    pub fn output(&self, node_id: &str) -> Option<Value> {
        self.outputs.get(node_id)
    }

    pub fn set_output(&self, node_id: impl Into<String>, value: Value) {
        self.outputs.set(node_id, value);
    }

    pub fn outputs(&self) -> HashMap<String, Value> {
        self.outputs.snapshot()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Publish an event on behalf of this node.
    pub fn emit(&self, topic: &str, payload: Value) {
        self.event_bus.emit(topic, payload);
    }

    /// Log a plugin message to tracing and the event bus.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(node_id = %self.node_id, "{}", message),
            LogLevel::Info => info!(node_id = %self.node_id, "{}", message),
            LogLevel::Warn => warn!(node_id = %self.node_id, "{}", message),
        }
        self.event_bus.emit(
            topics::NODE_LOG,
            json!({
                "node_id": self.node_id,
                "execution_id": self.run.execution_id,
                "level": format!("{:?}", level).to_lowercase(),
                "message": message,
            }),
        );
    }
}
