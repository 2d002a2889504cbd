use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use nodeflow_core::event::topics;
use nodeflow_core::types::node_types;
use nodeflow_core::{
    ExecutionContext, NodeCategory, NodeMetadata, NodePlugin, OutputSchemaEntry, PortSpec, Result,
    VariableType,
};

use super::{metadata, parse_data};

/// Terminal node. Renders a final message and marks the run complete.
pub struct EndPlugin;

#[derive(Deserialize)]
struct EndData {
    #[serde(default = "default_message")]
    message: String,
}

fn default_message() -> String {
    "Flow completed".into()
}

impl NodePlugin for EndPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata(node_types::END, "End", "Finishes the flow", NodeCategory::Output)
    }

    fn create_default_data(&self) -> Value {
        json!({"label": "End", "message": "Flow completed"})
    }

    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        vec![
            OutputSchemaEntry::new("message", VariableType::String, "Final message", json!("Flow completed")),
            OutputSchemaEntry::new("completed", VariableType::Boolean, "Always true", json!(true)),
            OutputSchemaEntry::new("input", VariableType::Any, "Input the flow ended with", json!({})),
        ]
    }

    fn ports(&self) -> PortSpec {
        PortSpec { inputs: 1, outputs: 0 }
    }

    fn execute(&self, input: Value, data: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let d: EndData = parse_data(&ctx.node_id, data)?;
            let message = ctx.substitute(&d.message);
            ctx.emit(
                topics::FLOW_END_REACHED,
                json!({
                    "node_id": ctx.node_id,
                    "execution_id": ctx.run.execution_id,
                    "message": message,
                }),
            );
            Ok(json!({"message": message, "completed": true, "input": input}))
        })
    }
}
