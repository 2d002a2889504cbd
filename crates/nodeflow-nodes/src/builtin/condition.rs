use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use nodeflow_core::traits::is_truthy;
use nodeflow_core::types::node_types;
use nodeflow_core::{
    ExecutionContext, NodeCategory, NodeMetadata, NodePlugin, OutputSchemaEntry, PortSpec, Result,
    VariableType,
};

use super::{metadata, parse_data, validate_with};

/// Evaluates a boolean expression and routes through the `true` or `false`
/// port. Evaluation errors fail the node.
pub struct ConditionPlugin;

#[derive(Deserialize)]
struct ConditionData {
    #[serde(default)]
    expression: String,
}

impl NodePlugin for ConditionPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata(
            node_types::CONDITION,
            "Condition",
            "Routes to the true or false branch based on an expression",
            NodeCategory::Logic,
        )
    }

    fn create_default_data(&self) -> Value {
        json!({"label": "Condition", "expression": "input.value > 0"})
    }

    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        vec![
            OutputSchemaEntry::new("result", VariableType::Boolean, "Branch taken", json!(true)),
            OutputSchemaEntry::new("value", VariableType::Any, "Raw expression result", json!(1)),
            OutputSchemaEntry::new("input", VariableType::Any, "Input passed through", json!({})),
        ]
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        validate_with(data, |d: ConditionData| {
            if d.expression.trim().is_empty() {
                vec!["expression is required".into()]
            } else {
                Vec::new()
            }
        })
    }

    fn ports(&self) -> PortSpec {
        PortSpec { inputs: 1, outputs: 2 }
    }

    fn execute(&self, input: Value, data: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let d: ConditionData = parse_data(&ctx.node_id, data)?;
            let value = ctx.evaluate(&d.expression, &input)?;
            let result = is_truthy(&value);
            Ok(json!({"result": result, "value": value, "input": input}))
        })
    }
}
