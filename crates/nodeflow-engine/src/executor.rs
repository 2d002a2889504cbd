use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nodeflow_core::event::topics;
use nodeflow_core::types::node_types;
use nodeflow_core::{
    ErrorKind, EventBus, ExecutionContext, ExecutionLogEntry, ExpressionEvaluator, FlowError,
    Graph, GraphNode, LogStatus, NodePlugin, OutputMap, Result, RunInfo,
};
use nodeflow_nodes::NodeRegistry;
use nodeflow_variables::VariableRegistry;

use crate::branching::{next_route, Route};
use crate::run_log::ExecutionLog;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Reached a node without outputs (an end node).
    Completed,
    /// Stopped early without an error: the last node had nowhere to go.
    Incomplete,
    /// A fatal error ended the run.
    Failed,
}

/// The fatal error that ended a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    /// Offending node, or `None` for graph-level problems.
    pub node_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of executing an entire flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowRunResult {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    /// Node ids in execution order.
    pub path: Vec<String>,
    pub outputs: BTreeMap<String, Value>,
    pub log: Vec<ExecutionLogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub elapsed_ms: u64,
}

impl FlowRunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Output of the last node that produced one.
    pub fn final_output(&self) -> Option<&Value> {
        self.path.iter().rev().find_map(|id| self.outputs.get(id))
    }
}

/// A fatal error and the node it is logged against.
struct Failure {
    node: Option<(String, String)>,
    error: FlowError,
}

impl Failure {
    fn system(error: FlowError) -> Self {
        Self { node: None, error }
    }

    fn at(node: &GraphNode, error: FlowError) -> Self {
        Self {
            node: Some((node.id.clone(), node.label().to_string())),
            error,
        }
    }
}

/// Per-run state: identifiers, output table, log and the caller's callback.
struct RunState<F> {
    info: RunInfo,
    outputs: OutputMap,
    log: ExecutionLog,
    path: Vec<String>,
    on_log: F,
    event_bus: Arc<EventBus>,
}

impl<F> RunState<F>
where
    F: FnMut(&ExecutionLogEntry) + Send,
{
    fn record(&mut self, entry: ExecutionLogEntry) {
        (self.on_log)(&entry);
        self.emit(
            topics::FLOW_LOG_ENTRY,
            json!({"node_id": entry.node_id, "entry": entry}),
        );
        self.log.push(entry);
    }

    /// Publish with the run's identifiers attached.
    fn emit(&self, topic: &str, mut payload: Value) {
        if let Value::Object(map) = &mut payload {
            map.insert("execution_id".into(), json!(self.info.execution_id));
            map.insert("workflow_id".into(), json!(self.info.workflow_id));
        }
        self.event_bus.emit(topic, payload);
    }
}

/// Walks a flow graph from its trigger node.
///
/// Each node runs to completion before the next is chosen; there is no
/// parallelism within a run. Every output is stored in the run's output
/// table and registered as runtime variables.
pub struct FlowExecutor {
    registry: Arc<NodeRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    event_bus: Arc<EventBus>,
    workflow_id: String,
}

impl FlowExecutor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            evaluator,
            event_bus,
            workflow_id: "default".into(),
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = workflow_id.into();
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn variables(&self) -> &Arc<VariableRegistry> {
        self.registry.variables()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Execute `graph` with `trigger_input` as the trigger node's input.
    ///
    /// `on_log` receives every log entry in order as it is produced. Fatal
    /// errors do not surface as `Err`: they end the run with status
    /// `Failed` and exactly one `error` log entry.
    pub async fn execute_flow<F>(&self, graph: &Graph, trigger_input: Value, on_log: F) -> FlowRunResult
    where
        F: FnMut(&ExecutionLogEntry) + Send,
    {
        let started = Instant::now();
        let mut run = RunState {
            info: RunInfo {
                workflow_id: self.workflow_id.clone(),
                execution_id: Uuid::new_v4().to_string(),
            },
            outputs: OutputMap::new(),
            log: ExecutionLog::new(),
            path: Vec::new(),
            on_log,
            event_bus: self.event_bus.clone(),
        };

        info!(
            execution_id = %run.info.execution_id,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "Flow execution started"
        );
        let pruned = self.variables().prune(graph);
        if pruned > 0 {
            debug!(pruned, "Dropped runtime variables of removed nodes");
        }
        run.emit(topics::FLOW_STARTED, json!({"nodes": graph.nodes.len()}));

        let outcome = self.walk(graph, trigger_input, &mut run).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (status, failure) = match outcome {
            Ok(status) => {
                info!(
                    execution_id = %run.info.execution_id,
                    steps = run.path.len(),
                    elapsed_ms,
                    ?status,
                    "Flow execution finished"
                );
                run.emit(
                    topics::FLOW_COMPLETED,
                    json!({"status": status, "steps": run.path.len(), "elapsed_ms": elapsed_ms}),
                );
                (status, None)
            }
            Err(Failure { node, error: e }) => {
                let kind = e.kind();
                let message = e.to_string();
                let node_id = node.as_ref().map(|(id, _)| id.clone());
                error!(
                    execution_id = %run.info.execution_id,
                    node_id = node_id.as_deref().unwrap_or("-"),
                    ?kind,
                    error = %message,
                    "Flow execution failed"
                );

                let entry = match &node {
                    Some((id, label)) => ExecutionLogEntry::new(id, label, LogStatus::Error, &message),
                    None => ExecutionLogEntry::system(LogStatus::Error, &message),
                };
                run.record(entry);
                if let Some(id) = &node_id {
                    run.emit(
                        topics::NODE_FAILED,
                        json!({"node_id": id, "kind": kind, "error": message}),
                    );
                }
                run.emit(
                    topics::FLOW_FAILED,
                    json!({"node_id": node_id, "kind": kind, "error": message, "elapsed_ms": elapsed_ms}),
                );
                (
                    RunStatus::Failed,
                    Some(RunFailure {
                        node_id,
                        kind,
                        message,
                    }),
                )
            }
        };

        FlowRunResult {
            execution_id: run.info.execution_id,
            workflow_id: run.info.workflow_id,
            status,
            outputs: run.outputs.snapshot().into_iter().collect(),
            path: run.path,
            log: run.log.into_entries(),
            failure,
            elapsed_ms,
        }
    }

    async fn walk<F>(
        &self,
        graph: &Graph,
        trigger_input: Value,
        run: &mut RunState<F>,
    ) -> std::result::Result<RunStatus, Failure>
    where
        F: FnMut(&ExecutionLogEntry) + Send,
    {
        let mut current = find_trigger(graph).map_err(Failure::system)?;
        let mut input = trigger_input;
        let mut visited: HashSet<&str> = HashSet::new();
        let mut step = 0;

        loop {
            if !visited.insert(current.id.as_str()) {
                return Err(Failure::at(
                    current,
                    FlowError::Cycle {
                        node_id: current.id.clone(),
                    },
                ));
            }

            let plugin = self
                .registry
                .get(&current.node_type)
                .ok_or_else(|| Failure::system(FlowError::PluginNotFound(current.node_type.clone())))?;

            run.path.push(current.id.clone());
            let output = self
                .run_node(current, plugin.as_ref(), input, step, run)
                .await
                .map_err(|e| Failure::at(current, e))?;

            match next_route(graph, current, &output).map_err(|e| Failure::at(current, e))? {
                Route::Next(edge) => {
                    let next = graph.node(&edge.target).ok_or_else(|| {
                        Failure::system(FlowError::MissingTarget {
                            edge_id: edge.id.clone(),
                            target: edge.target.clone(),
                        })
                    })?;
                    debug!(from = %current.id, to = %next.id, port = ?edge.source_handle, "Following edge");
                    current = next;
                    input = output;
                    step += 1;
                }
                Route::Stop if plugin.ports().outputs == 0 => return Ok(RunStatus::Completed),
                Route::Stop => {
                    warn!(node_id = %current.id, "Flow ended without reaching an end node");
                    run.record(ExecutionLogEntry::system(
                        LogStatus::Skipped,
                        format!("Flow stopped at '{}' without reaching an end node", current.label()),
                    ));
                    return Ok(RunStatus::Incomplete);
                }
                Route::Unconnected { port } => {
                    warn!(node_id = %current.id, port = %port, "Selected port has no edge");
                    run.record(ExecutionLogEntry::new(
                        &current.id,
                        current.label(),
                        LogStatus::Skipped,
                        format!("No edge is connected to the '{}' port", port),
                    ));
                    return Ok(RunStatus::Incomplete);
                }
            }
        }
    }

    async fn run_node<F>(
        &self,
        node: &GraphNode,
        plugin: &dyn NodePlugin,
        input: Value,
        step: usize,
        run: &mut RunState<F>,
    ) -> Result<Value>
    where
        F: FnMut(&ExecutionLogEntry) + Send,
    {
        info!(node_id = %node.id, node_type = %node.node_type, step, "Executing node");
        run.record(
            ExecutionLogEntry::new(
                &node.id,
                node.label(),
                LogStatus::Processing,
                format!("Processing {}", node.label()),
            )
            .with_input(input.clone()),
        );
        run.emit(
            topics::NODE_STARTED,
            json!({"node_id": node.id, "node_type": node.node_type, "step": step}),
        );

        let errors = plugin.validate_data(&node.data);
        if !errors.is_empty() {
            return Err(FlowError::InvalidNodeData {
                node_id: node.id.clone(),
                errors,
            });
        }

        let ctx = ExecutionContext::new(
            node,
            run.info.clone(),
            input.clone(),
            run.outputs.clone(),
            self.evaluator.clone(),
            self.event_bus.clone(),
        )
        .with_step(step);

        let started = Instant::now();
        let output = plugin.execute(input, node.data.clone(), ctx).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        run.outputs.set(node.id.clone(), output.clone());
        let variables = self.variables().register_runtime_variables(&node.id, &output);
        debug!(node_id = %node.id, elapsed_ms, variables, "Node completed");

        run.record(
            ExecutionLogEntry::new(
                &node.id,
                node.label(),
                LogStatus::Success,
                format!("Completed in {}ms", elapsed_ms),
            )
            .with_output(output.clone()),
        );
        run.emit(
            topics::NODE_COMPLETED,
            json!({"node_id": node.id, "elapsed_ms": elapsed_ms, "output": output}),
        );
        Ok(output)
    }
}

/// The single trigger node of `graph`.
fn find_trigger(graph: &Graph) -> Result<&GraphNode> {
    let mut triggers = graph.nodes_of_type(node_types::TRIGGER);
    match (triggers.next(), triggers.count()) {
        (None, _) => Err(FlowError::MissingTrigger),
        (Some(trigger), 0) => Ok(trigger),
        (Some(_), others) => Err(FlowError::MultipleTriggers(others + 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_test_utils::{GraphBuilder, LiteralEvaluator, MockPlugin};

    #[test]
    fn trigger_must_be_unique() {
        let none = GraphBuilder::new().node("a", "end").build();
        assert!(matches!(find_trigger(&none), Err(FlowError::MissingTrigger)));

        let two = GraphBuilder::new().node("a", "trigger").node("b", "trigger").build();
        assert!(matches!(find_trigger(&two), Err(FlowError::MultipleTriggers(2))));

        let one = GraphBuilder::new().node("a", "trigger").node("b", "end").build();
        assert_eq!(find_trigger(&one).unwrap().id, "a");
    }

    #[test]
    fn final_output_is_last_executed() {
        let result = FlowRunResult {
            execution_id: "r".into(),
            workflow_id: "w".into(),
            status: RunStatus::Completed,
            path: vec!["a".into(), "b".into()],
            outputs: [("a".to_string(), json!(1)), ("b".to_string(), json!(2))].into(),
            log: Vec::new(),
            failure: None,
            elapsed_ms: 0,
        };
        assert_eq!(result.final_output(), Some(&json!(2)));
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn execution_ids_differ_per_run() {
        let mut registry = NodeRegistry::new(Arc::new(VariableRegistry::default()));
        registry.register(MockPlugin::new("trigger")).unwrap();
        let executor = FlowExecutor::new(Arc::new(registry), Arc::new(LiteralEvaluator), Arc::new(EventBus::default()))
            .with_workflow_id("orders");
        let graph = GraphBuilder::new().node("t", "trigger").build();

        let first = executor.execute_flow(&graph, json!({}), |_| {}).await;
        let second = executor.execute_flow(&graph, json!({}), |_| {}).await;
        assert_ne!(first.execution_id, second.execution_id);
        assert_eq!(first.workflow_id, "orders");
        // mock trigger has an output port, so the run stops short
        assert_eq!(first.status, RunStatus::Incomplete);
    }
}
