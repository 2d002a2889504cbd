use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Structural errors
    #[error("No trigger node found in flow")]
    MissingTrigger,

    #[error("Flow has {0} trigger nodes, expected exactly one")]
    MultipleTriggers(usize),

    #[error("Edge {edge_id} points to missing node: {target}")]
    MissingTarget { edge_id: String, target: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("No plugin registered for node type: {0}")]
    PluginNotFound(String),

    #[error("Node type already registered: {0}")]
    DuplicateType(String),

    // Run control errors
    #[error("Infinite loop detected: node {node_id} was already executed in this run")]
    Cycle { node_id: String },

    #[error("Node {node_id} failed: {message}")]
    PluginExecution { node_id: String, message: String },

    #[error("Invalid configuration for node {node_id}: {}", errors.join("; "))]
    InvalidNodeData { node_id: String, errors: Vec<String> },

    #[error("Branching error at node {node_id}: {message}")]
    Branching { node_id: String, message: String },

    // Plugin-internal errors
    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Timed out after {timeout_ms}ms: {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Event bus is closed")]
    EventBusClosed,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used for log messages and run outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Structural,
    Cycle,
    PluginExecution,
    Branching,
    Configuration,
    Io,
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingTrigger
            | Self::MultipleTriggers(_)
            | Self::MissingTarget { .. }
            | Self::NodeNotFound(_)
            | Self::PluginNotFound(_)
            | Self::DuplicateType(_) => ErrorKind::Structural,
            Self::Cycle { .. } => ErrorKind::Cycle,
            Self::Branching { .. } => ErrorKind::Branching,
            Self::PluginExecution { .. }
            | Self::InvalidNodeData { .. }
            | Self::Expression(_)
            | Self::Timeout { .. }
            | Self::Http(_)
            | Self::Llm(_) => ErrorKind::PluginExecution,
            Self::Config(_) | Self::ConfigNotFound(_) | Self::EventBusClosed => {
                ErrorKind::Configuration
            }
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
