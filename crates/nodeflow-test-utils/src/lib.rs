//! Shared fixtures for nodeflow tests: mock plugins, a graph builder, a log
//! collector, a canned LLM client and a context factory.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use nodeflow_core::{
    EvalScope, EventBus, ExecutionContext, ExecutionLogEntry, ExpressionEvaluator, FlowError,
    Graph, GraphEdge, GraphNode, LlmClient, LlmRequest, LlmResponse, LogStatus, NodeCategory,
    NodeMetadata, NodePlugin, OutputMap, OutputSchemaEntry, PortSpec, Result, RunInfo,
};
use serde_json::{json, Value};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Plugins ─────────────────────────────────────────────────────

/// Plugin that records its inputs and returns a fixed output, or echoes the
/// input when no output is set.
#[derive(Clone)]
pub struct MockPlugin {
    node_type: String,
    output: Option<Value>,
    schema: Vec<OutputSchemaEntry>,
    ports: PortSpec,
    data_errors: Vec<String>,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl MockPlugin {
    pub fn new(node_type: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            output: None,
            schema: Vec::new(),
            ports: PortSpec::default(),
            data_errors: Vec::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn returning(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_schema(mut self, schema: Vec<OutputSchemaEntry>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_ports(mut self, inputs: usize, outputs: usize) -> Self {
        self.ports = PortSpec { inputs, outputs };
        self
    }

    /// Report these problems from `validate_data`.
    pub fn rejecting_data(mut self, errors: &[&str]) -> Self {
        self.data_errors = errors.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Inputs seen so far, shared across clones.
    pub fn calls(&self) -> Vec<Value> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl NodePlugin for MockPlugin {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            node_type: self.node_type.clone(),
            name: format!("Mock {}", self.node_type),
            description: "Test double".into(),
            version: "0.0.1".into(),
            category: NodeCategory::Action,
        }
    }

    fn create_default_data(&self) -> Value {
        json!({})
    }

    fn execute(&self, input: Value, _data: Value, _ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            lock(&self.calls).push(input.clone());
            Ok(self.output.clone().unwrap_or(input))
        })
    }

    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        self.schema.clone()
    }

    fn validate_data(&self, _data: &Value) -> Vec<String> {
        self.data_errors.clone()
    }

    fn ports(&self) -> PortSpec {
        self.ports
    }
}

/// Plugin whose execution always fails with the given message.
pub struct FailingPlugin {
    node_type: String,
    message: String,
}

impl FailingPlugin {
    pub fn new(node_type: &str, message: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            message: message.to_string(),
        }
    }
}

impl NodePlugin for FailingPlugin {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            node_type: self.node_type.clone(),
            name: "Failing".into(),
            description: "Always fails".into(),
            version: "0.0.1".into(),
            category: NodeCategory::Action,
        }
    }

    fn create_default_data(&self) -> Value {
        json!({})
    }

    fn execute(&self, _input: Value, _data: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            Err(FlowError::PluginExecution {
                node_id: ctx.node_id,
                message: self.message.clone(),
            })
        })
    }
}

// ── LLM ─────────────────────────────────────────────────────────

/// LLM client that answers every request with a canned completion.
#[derive(Clone, Default)]
pub struct MockLlmClient {
    reply: String,
    requests: Arc<Mutex<Vec<LlmRequest>>>,
}

impl MockLlmClient {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        lock(&self.requests).clone()
    }
}

impl LlmClient for MockLlmClient {
    fn complete(&self, request: LlmRequest) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            let model = request.model.clone().unwrap_or_else(|| "mock-model".into());
            let input_tokens = request.prompt.split_whitespace().count() as u64;
            lock(&self.requests).push(request);
            Ok(LlmResponse {
                text: self.reply.clone(),
                model,
                input_tokens,
                output_tokens: self.reply.split_whitespace().count() as u64,
            })
        })
    }
}

// ── Evaluator ───────────────────────────────────────────────────

/// Evaluator that answers with a scope variable by exact name, or parses
/// the expression as a JSON literal.
pub struct LiteralEvaluator;

impl ExpressionEvaluator for LiteralEvaluator {
    fn evaluate(&self, expression: &str, scope: &EvalScope) -> Result<Value> {
        if let Some(value) = scope.get(expression.trim()) {
            return Ok(value.clone());
        }
        serde_json::from_str(expression)
            .map_err(|_| FlowError::Expression(format!("cannot evaluate `{}`", expression)))
    }
}

// ── Graphs ──────────────────────────────────────────────────────

/// Fluent graph construction for tests.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, id: &str, node_type: &str) -> Self {
        self.nodes.push(GraphNode::new(id, node_type, json!({})));
        self
    }

    pub fn node_with(mut self, id: &str, node_type: &str, data: Value) -> Self {
        self.nodes.push(GraphNode::new(id, node_type, data));
        self
    }

    pub fn edge(mut self, source: &str, target: &str) -> Self {
        self.edges.push(GraphEdge::new(source, target));
        self
    }

    /// Edge leaving `source` through the named output port.
    pub fn port(mut self, source: &str, handle: &str, target: &str) -> Self {
        self.edges.push(GraphEdge::from_port(source, handle, target));
        self
    }

    /// Chain of edges through `ids` in order.
    pub fn chain(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self.edges.push(GraphEdge::new(pair[0], pair[1]));
        }
        self
    }

    pub fn build(self) -> Graph {
        Graph::new(self.nodes, self.edges)
    }
}

// ── Logs ────────────────────────────────────────────────────────

/// Collects execution log entries delivered to a run callback.
#[derive(Clone, Default)]
pub struct LogCollector {
    entries: Arc<Mutex<Vec<ExecutionLogEntry>>>,
}

impl LogCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl FnMut(&ExecutionLogEntry) + Send + 'static {
        let entries = self.entries.clone();
        move |entry| lock(&entries).push(entry.clone())
    }

    pub fn entries(&self) -> Vec<ExecutionLogEntry> {
        lock(&self.entries).clone()
    }

    /// `(node_id, status)` pairs in delivery order.
    pub fn trail(&self) -> Vec<(String, LogStatus)> {
        lock(&self.entries)
            .iter()
            .map(|e| (e.node_id.clone(), e.status))
            .collect()
    }

    pub fn with_status(&self, status: LogStatus) -> Vec<ExecutionLogEntry> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }
}

// ── Contexts ────────────────────────────────────────────────────

/// Context for running a plugin directly, outside an engine run.
pub fn test_context(
    node: &GraphNode,
    input: Value,
    evaluator: Arc<dyn ExpressionEvaluator>,
) -> ExecutionContext {
    test_context_with_outputs(node, input, evaluator, OutputMap::new())
}

pub fn test_context_with_outputs(
    node: &GraphNode,
    input: Value,
    evaluator: Arc<dyn ExpressionEvaluator>,
    outputs: OutputMap,
) -> ExecutionContext {
    ExecutionContext::new(
        node,
        RunInfo {
            workflow_id: "test-flow".into(),
            execution_id: "test-run".into(),
        },
        input,
        outputs,
        evaluator,
        Arc::new(EventBus::default()),
    )
}
