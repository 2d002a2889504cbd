use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use nodeflow_core::config::LoopConfig;
use nodeflow_core::context::LogLevel;
use nodeflow_core::types::node_types;
use nodeflow_core::{
    ExecutionContext, FlowError, NodeCategory, NodeMetadata, NodePlugin, OutputSchemaEntry,
    PortSpec, Result, VariableType,
};

use super::{metadata, parse_data, validate_with};

pub const CONTINUE_ROUTE: &str = "continue";
pub const DONE_ROUTE: &str = "done";

/// Expands an array into one entry per item, with index and progress
/// metadata. The whole batch is returned as a single output; the node never
/// re-enters the graph itself.
pub struct LoopPlugin {
    config: LoopConfig,
}

impl LoopPlugin {
    pub fn new(config: LoopConfig) -> Self {
        Self { config }
    }

    fn cap(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.default_iterations)
            .min(self.config.max_iterations)
    }
}

#[derive(Deserialize)]
struct LoopData {
    #[serde(default = "default_expression")]
    expression: String,
    #[serde(default)]
    max_iterations: Option<usize>,
}

fn default_expression() -> String {
    "input".into()
}

impl NodePlugin for LoopPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata(
            node_types::LOOP,
            "Loop",
            "Emits one entry per item of an array",
            NodeCategory::Logic,
        )
    }

    fn create_default_data(&self) -> Value {
        json!({
            "label": "Loop",
            "expression": "input.items",
            "max_iterations": self.config.default_iterations
        })
    }

    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        vec![
            OutputSchemaEntry::new("items", VariableType::Array, "One entry per processed item", json!([])),
            OutputSchemaEntry::new("total_items", VariableType::Number, "Length of the source array", json!(3)),
            OutputSchemaEntry::new("processed", VariableType::Number, "Items emitted", json!(3)),
            OutputSchemaEntry::new("truncated", VariableType::Boolean, "Whether the cap was hit", json!(false)),
        ]
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        validate_with(data, |d: LoopData| {
            let mut errors = Vec::new();
            if d.expression.trim().is_empty() {
                errors.push("expression is required".to_string());
            }
            if d.max_iterations == Some(0) {
                errors.push("max_iterations must be at least 1".to_string());
            }
            errors
        })
    }

    fn ports(&self) -> PortSpec {
        PortSpec { inputs: 1, outputs: 2 }
    }

    fn execute(&self, input: Value, data: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let d: LoopData = parse_data(&ctx.node_id, data)?;
            let source = match ctx.evaluate(&d.expression, &input)? {
                Value::Array(items) => items,
                other => {
                    return Err(FlowError::Expression(format!(
                        "loop expression must produce an array, got {}",
                        VariableType::of(&other)
                    )))
                }
            };

            let total_items = source.len();
            let cap = self.cap(d.max_iterations);
            let processed = total_items.min(cap);
            if processed < total_items {
                ctx.log(
                    LogLevel::Warn,
                    format!("Loop capped at {} of {} items", processed, total_items),
                );
            }

            let items: Vec<Value> = source
                .into_iter()
                .take(processed)
                .enumerate()
                .map(|(index, item)| {
                    json!({
                        "item": item,
                        "index": index,
                        "total": processed,
                        "progress": (index + 1) as f64 / processed as f64,
                        "is_first": index == 0,
                        "is_last": index + 1 == processed,
                    })
                })
                .collect();

            Ok(json!({
                "items": items,
                "total_items": total_items,
                "processed": processed,
                "truncated": processed < total_items,
            }))
        })
    }
}
