pub mod condition;
pub mod delay;
pub mod end;
pub mod http;
pub mod llm;
pub mod loop_node;
pub mod switch;
pub mod transform;
pub mod trigger;

use nodeflow_core::{FlowError, NodeCategory, NodeMetadata, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use condition::ConditionPlugin;
pub use delay::DelayPlugin;
pub use end::EndPlugin;
pub use http::HttpPlugin;
pub use llm::LlmPlugin;
pub use loop_node::LoopPlugin;
pub use switch::SwitchPlugin;
pub use transform::TransformPlugin;
pub use trigger::TriggerPlugin;

/// Version stamped on every built-in node type.
const BUILTIN_VERSION: &str = "1.0.0";

fn metadata(node_type: &str, name: &str, description: &str, category: NodeCategory) -> NodeMetadata {
    NodeMetadata {
        node_type: node_type.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        version: BUILTIN_VERSION.to_string(),
        category,
    }
}

/// `null` data means "all defaults".
fn or_empty(data: Value) -> Value {
    match data {
        Value::Null => Value::Object(Default::default()),
        other => other,
    }
}

/// Deserialize a node's `data` object, reporting failures against the node.
fn parse_data<T: DeserializeOwned>(node_id: &str, data: Value) -> Result<T> {
    serde_json::from_value(or_empty(data)).map_err(|e| FlowError::InvalidNodeData {
        node_id: node_id.to_string(),
        errors: vec![e.to_string()],
    })
}

/// Run `check` on the parsed data, or report why it does not parse.
fn validate_with<T, F>(data: &Value, check: F) -> Vec<String>
where
    T: DeserializeOwned,
    F: FnOnce(T) -> Vec<String>,
{
    match serde_json::from_value::<T>(or_empty(data.clone())) {
        Ok(parsed) => check(parsed),
        Err(e) => vec![e.to_string()],
    }
}

fn plugin_error(node_id: &str, message: impl Into<String>) -> FlowError {
    FlowError::PluginExecution {
        node_id: node_id.to_string(),
        message: message.into(),
    }
}
