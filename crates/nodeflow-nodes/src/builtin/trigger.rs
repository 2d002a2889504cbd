use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use nodeflow_core::types::node_types;
use nodeflow_core::{
    ExecutionContext, NodeCategory, NodeMetadata, NodePlugin, OutputSchemaEntry, PortSpec, Result,
    VariableType,
};

use super::{metadata, parse_data, validate_with};

/// Entry point of a run. Passes the trigger payload through with a
/// `_trigger` stamp.
pub struct TriggerPlugin;

#[derive(Deserialize)]
struct TriggerData {
    #[serde(default = "default_trigger_type")]
    trigger_type: String,
}

fn default_trigger_type() -> String {
    "manual".into()
}

impl NodePlugin for TriggerPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata(
            node_types::TRIGGER,
            "Trigger",
            "Starts the flow with the incoming payload",
            NodeCategory::Trigger,
        )
    }

    fn create_default_data(&self) -> Value {
        json!({"label": "Start", "trigger_type": "manual"})
    }

    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        vec![
            OutputSchemaEntry::new("_trigger", VariableType::Object, "Trigger metadata", json!({})),
            OutputSchemaEntry::new("_trigger.type", VariableType::String, "How the run was started", json!("manual")),
            OutputSchemaEntry::new(
                "_trigger.triggered_at",
                VariableType::String,
                "RFC 3339 start time",
                json!("2024-01-01T00:00:00Z"),
            ),
            OutputSchemaEntry::new("_trigger.execution_id", VariableType::String, "Run id", json!("run-1")),
        ]
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        validate_with(data, |d: TriggerData| {
            if d.trigger_type.trim().is_empty() {
                vec!["trigger_type must not be empty".into()]
            } else {
                Vec::new()
            }
        })
    }

    fn ports(&self) -> PortSpec {
        PortSpec { inputs: 0, outputs: 1 }
    }

    fn execute(&self, input: Value, data: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let d: TriggerData = parse_data(&ctx.node_id, data)?;
            let stamp = json!({
                "type": d.trigger_type,
                "triggered_at": Utc::now().to_rfc3339(),
                "execution_id": ctx.run.execution_id,
            });

            Ok(match input {
                Value::Object(mut map) => {
                    map.insert("_trigger".into(), stamp);
                    Value::Object(map)
                }
                other => json!({"payload": other, "_trigger": stamp}),
            })
        })
    }
}
