use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use nodeflow_core::template::stringify;
use nodeflow_core::traits::is_truthy;
use nodeflow_core::types::node_types;
use nodeflow_core::{
    ExecutionContext, FlowError, NodeCategory, NodeMetadata, NodePlugin, OutputSchemaEntry,
    Result, VariableType,
};

use super::{metadata, parse_data, validate_with};

/// Reshapes the input with one of a fixed set of operations.
pub struct TransformPlugin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Operation {
    /// Evaluate an expression against the input.
    Extract,
    /// Render a `{source.path}` template.
    Format,
    /// Parse JSON text produced by the expression.
    Parse,
    /// Keep array items for which the expression holds (`item`, `index` in scope).
    Filter,
    /// Run a multi-statement script.
    Custom,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Format => "format",
            Self::Parse => "parse",
            Self::Filter => "filter",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Deserialize)]
struct TransformData {
    #[serde(default = "default_operation")]
    operation: Operation,
    #[serde(default)]
    expression: String,
    #[serde(default)]
    template: String,
    /// Array to filter; defaults to the input.
    #[serde(default)]
    source: Option<String>,
    #[serde(default = "default_output_format")]
    output_format: OutputFormat,
}

fn default_operation() -> Operation {
    Operation::Extract
}
fn default_output_format() -> OutputFormat {
    OutputFormat::Json
}

/// Flat text form: `key: value` lines for objects, one line per item for
/// arrays.
fn to_text(value: &Value) -> String {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, stringify(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join("\n"),
        other => stringify(other),
    }
}

impl NodePlugin for TransformPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata(
            node_types::TRANSFORM,
            "Transform",
            "Extracts, formats, parses or filters data",
            NodeCategory::Data,
        )
    }

    fn create_default_data(&self) -> Value {
        json!({
            "label": "Transform",
            "operation": "extract",
            "expression": "input",
            "output_format": "json"
        })
    }

    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        vec![
            OutputSchemaEntry::new("result", VariableType::Any, "Transformed value", json!({})),
            OutputSchemaEntry::new("operation", VariableType::String, "Operation applied", json!("extract")),
        ]
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        validate_with(data, |d: TransformData| match d.operation {
            Operation::Format if d.template.is_empty() => vec!["template is required for format".into()],
            Operation::Extract | Operation::Filter | Operation::Custom if d.expression.trim().is_empty() => {
                vec![format!("expression is required for {}", d.operation.as_str())]
            }
            _ => Vec::new(),
        })
    }

    fn execute(&self, input: Value, data: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let d: TransformData = parse_data(&ctx.node_id, data)?;

            let result = match d.operation {
                Operation::Extract | Operation::Custom => ctx.evaluate(&d.expression, &input)?,
                Operation::Format => Value::String(ctx.substitute(&d.template)),
                Operation::Parse => {
                    let text = if d.expression.trim().is_empty() {
                        input.clone()
                    } else {
                        ctx.evaluate(&d.expression, &input)?
                    };
                    match text {
                        Value::String(s) => serde_json::from_str(&s)?,
                        // already structured
                        other => other,
                    }
                }
                Operation::Filter => {
                    let source = match &d.source {
                        Some(expr) if !expr.trim().is_empty() => ctx.evaluate(expr, &input)?,
                        _ => input.clone(),
                    };
                    let items = match source {
                        Value::Array(items) => items,
                        other => {
                            return Err(FlowError::Expression(format!(
                                "filter source must be an array, got {}",
                                VariableType::of(&other)
                            )))
                        }
                    };
                    let mut kept = Vec::new();
                    for (index, item) in items.into_iter().enumerate() {
                        let scope = ctx
                            .scope(&input)
                            .with("item", item.clone())
                            .with("index", json!(index));
                        if is_truthy(&ctx.evaluate_with(&d.expression, scope)?) {
                            kept.push(item);
                        }
                    }
                    Value::Array(kept)
                }
            };

            let result = match d.output_format {
                OutputFormat::Json => result,
                OutputFormat::Text => Value::String(to_text(&result)),
            };

            Ok(json!({"result": result, "operation": d.operation.as_str()}))
        })
    }
}
