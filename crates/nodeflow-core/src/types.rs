use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type tags of the built-in node kinds.
pub mod node_types {
    pub const TRIGGER: &str = "trigger";
    pub const CONDITION: &str = "condition";
    pub const SWITCH: &str = "switch";
    pub const LOOP: &str = "loop";
    pub const DELAY: &str = "delay";
    pub const TRANSFORM: &str = "transform";
    pub const HTTP: &str = "http";
    pub const LLM: &str = "llm";
    pub const END: &str = "end";
}

/// Node id used for log entries that are not attributable to a single node.
pub const SYSTEM_NODE_ID: &str = "system";

/// Canvas position of a node. Presentation-only; the engine never reads it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node in a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub position: Position,
    /// Type-specific configuration, opaque to the engine.
    #[serde(default = "empty_data")]
    pub data: Value,
}

fn empty_data() -> Value {
    Value::Object(Default::default())
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            position: Position::default(),
            data,
        }
    }

    /// Display label: `data.label` when set, the node id otherwise.
    pub fn label(&self) -> &str {
        self.data
            .get("label")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.id)
    }
}

/// A directed connection from a node's output port to another node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl GraphEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            source_handle: None,
            target,
            target_handle: None,
        }
    }

    /// Edge leaving a named output port (`true`, `false`, `case-0`, `done`, ...).
    pub fn from_port(
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let handle = handle.into();
        let mut edge = Self::new(source, target);
        edge.id = format!("{}:{}->{}", edge.source, handle, edge.target);
        edge.source_handle = Some(handle);
        edge
    }
}

/// A serialized flow: `{nodes, edges, viewport?}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Value>,
}

impl Graph {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self {
            nodes,
            edges,
            viewport: None,
        }
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All nodes of the given type.
    pub fn nodes_of_type<'a, 'b>(
        &'a self,
        node_type: &'b str,
    ) -> impl Iterator<Item = &'a GraphNode> + 'b
    where
        'a: 'b,
    {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }

    /// Edges leaving `node_id`, in declaration order.
    ///
    /// The edges borrow from the graph only, so they outlive `node_id`.
    pub fn outgoing<'a, 'b>(&'a self, node_id: &'b str) -> impl Iterator<Item = &'a GraphEdge> + 'b
    where
        'a: 'b,
    {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Edges entering `node_id`, in declaration order.
    pub fn incoming<'a, 'b>(&'a self, node_id: &'b str) -> impl Iterator<Item = &'a GraphEdge> + 'b
    where
        'a: 'b,
    {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Map of node id to node type.
    pub fn node_types(&self) -> HashMap<&str, &str> {
        self.nodes
            .iter()
            .map(|n| (n.id.as_str(), n.node_type.as_str()))
            .collect()
    }

    /// Collect every structural problem instead of stopping at the first.
    pub fn validate(&self, entry_type: &str) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();

        for node in &self.nodes {
            if node.id.is_empty() {
                problems.push("Node with empty id".to_string());
            }
            if !seen.insert(node.id.as_str()) {
                problems.push(format!("Duplicate node id: {}", node.id));
            }
        }

        for edge in &self.edges {
            if !seen.contains(edge.source.as_str()) {
                problems.push(format!(
                    "Edge {} references missing source node: {}",
                    edge.id, edge.source
                ));
            }
            if !seen.contains(edge.target.as_str()) {
                problems.push(format!(
                    "Edge {} references missing target node: {}",
                    edge.id, edge.target
                ));
            }
        }

        match self.nodes_of_type(entry_type).count() {
            0 => problems.push(format!("No {} node found", entry_type)),
            1 => {}
            n => problems.push(format!("Expected one {} node, found {}", entry_type, n)),
        }

        problems
    }
}

/// Primitive or composite type tag of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
    Any,
}

impl VariableType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
            Self::Any => "any",
        }
    }
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One statically declared output of a node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchemaEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: VariableType,
    pub description: String,
    #[serde(default)]
    pub example: Value,
}

impl OutputSchemaEntry {
    pub fn new(
        name: impl Into<String>,
        value_type: VariableType,
        description: impl Into<String>,
        example: Value,
    ) -> Self {
        Self {
            name: name.into(),
            value_type,
            description: description.into(),
            example,
        }
    }
}

/// Palette grouping of a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Trigger,
    Logic,
    Action,
    Data,
    Ai,
    Output,
}

/// Descriptive metadata a plugin publishes about its node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub category: NodeCategory,
}

/// Required input/output port counts of a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub inputs: usize,
    pub outputs: usize,
}

impl Default for PortSpec {
    fn default() -> Self {
        Self {
            inputs: 1,
            outputs: 1,
        }
    }
}

/// Status of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Processing,
    Success,
    Error,
    Skipped,
}

/// One line of a run's execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub node_id: String,
    pub node_label: String,
    pub status: LogStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl ExecutionLogEntry {
    pub fn new(
        node_id: impl Into<String>,
        node_label: impl Into<String>,
        status: LogStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_label: node_label.into(),
            status,
            message: message.into(),
            timestamp: Utc::now(),
            input: None,
            output: None,
        }
    }

    /// Entry for a condition that is not attributable to one node.
    pub fn system(status: LogStatus, message: impl Into<String>) -> Self {
        Self::new(SYSTEM_NODE_ID, "System", status, message)
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Request forwarded to a language-model backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Completion returned by a language-model backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn graph_deserializes_wire_format() {
        let raw = json!({
            "nodes": [
                {"id": "t", "type": "trigger", "position": {"x": 0.0, "y": 10.0}, "data": {"label": "Start"}},
                {"id": "c", "type": "condition", "position": {"x": 0.0, "y": 0.0}, "data": {}}
            ],
            "edges": [
                {"id": "e1", "source": "t", "target": "c"},
                {"id": "e2", "source": "c", "sourceHandle": "true", "target": "t"}
            ],
            "viewport": {"x": 0, "y": 0, "zoom": 1}
        });
        let graph: Graph = serde_json::from_value(raw).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[0].label(), "Start");
        assert_eq!(graph.nodes[1].label(), "c");
        assert_eq!(graph.edges[1].source_handle.as_deref(), Some("true"));
        assert!(graph.viewport.is_some());
    }

    #[test]
    fn missing_data_is_an_empty_object() {
        let raw = json!({
            "nodes": [{"id": "t", "type": "trigger"}],
            "edges": []
        });
        let graph: Graph = serde_json::from_value(raw).unwrap();
        assert_eq!(graph.nodes[0].data, json!({}));
        assert_eq!(graph.nodes[0].label(), "t");
    }

    #[test]
    fn edges_borrow_from_the_graph_only() {
        let graph = Graph::new(
            vec![GraphNode::new("a", "trigger", json!({})), GraphNode::new("b", "end", json!({}))],
            vec![GraphEdge::new("a", "b")],
        );
        let edges: Vec<&GraphEdge> = {
            let id = String::from("a");
            graph.outgoing(&id).collect()
        };
        assert_eq!(edges[0].target, "b");
        let incoming: Vec<&GraphEdge> = {
            let id = String::from("b");
            graph.incoming(&id).collect()
        };
        assert_eq!(incoming[0].source, "a");
    }

    #[test]
    fn validate_reports_all_problems() {
        let graph = Graph::new(
            vec![
                GraphNode::new("a", "condition", json!({})),
                GraphNode::new("a", "end", json!({})),
            ],
            vec![GraphEdge::new("a", "ghost")],
        );
        let problems = graph.validate(node_types::TRIGGER);
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains("Duplicate node id: a")));
        assert!(problems.iter().any(|p| p.contains("missing target node: ghost")));
        assert!(problems.iter().any(|p| p.contains("No trigger node")));
    }

    #[test]
    fn validate_accepts_well_formed_graph() {
        let graph = Graph::new(
            vec![
                GraphNode::new("t", "trigger", json!({})),
                GraphNode::new("e", "end", json!({})),
            ],
            vec![GraphEdge::new("t", "e")],
        );
        assert!(graph.validate(node_types::TRIGGER).is_empty());
    }

    #[test]
    fn port_edge_ids_include_handle() {
        let edge = GraphEdge::from_port("cond", "false", "end");
        assert_eq!(edge.id, "cond:false->end");
        assert_eq!(edge.source_handle.as_deref(), Some("false"));
    }

    #[test]
    fn log_entry_serializes_lowercase_status() {
        let entry = ExecutionLogEntry::system(LogStatus::Error, "boom");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["node_id"], SYSTEM_NODE_ID);
        assert!(json.get("input").is_none());
    }

    #[test]
    fn variable_type_of_values() {
        assert_eq!(VariableType::of(&json!(1.5)), VariableType::Number);
        assert_eq!(VariableType::of(&json!([1])), VariableType::Array);
        assert_eq!(VariableType::of(&json!({"a": 1})).to_string(), "object");
    }
}
