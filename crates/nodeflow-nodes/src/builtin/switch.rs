use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use nodeflow_core::types::node_types;
use nodeflow_core::{
    ExecutionContext, FlowError, NodeCategory, NodeMetadata, NodePlugin, OutputSchemaEntry,
    PortSpec, Result, VariableType,
};

use super::{metadata, parse_data, validate_with};

/// Route name used when no case matches.
pub const DEFAULT_ROUTE: &str = "default";

/// Route name of the case at `index`.
pub fn case_route(index: usize) -> String {
    format!("case-{}", index)
}

/// Evaluates an expression and picks the first case whose value equals the
/// result, falling back to the default route when one is declared.
pub struct SwitchPlugin;

#[derive(Deserialize)]
struct SwitchData {
    #[serde(default)]
    expression: String,
    #[serde(default)]
    cases: Vec<SwitchCase>,
    #[serde(default)]
    has_default: bool,
}

#[derive(Deserialize)]
struct SwitchCase {
    value: Value,
    #[serde(default)]
    label: Option<String>,
}

/// Equality with numbers compared by value, so `2` matches `2.0`.
fn values_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

impl NodePlugin for SwitchPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata(
            node_types::SWITCH,
            "Switch",
            "Routes to the first case matching an expression",
            NodeCategory::Logic,
        )
    }

    fn create_default_data(&self) -> Value {
        json!({
            "label": "Switch",
            "expression": "input.status",
            "cases": [{"value": "ok", "label": "ok"}],
            "has_default": true
        })
    }

    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        vec![
            OutputSchemaEntry::new("value", VariableType::Any, "Expression result", json!("ok")),
            OutputSchemaEntry::new("matched_case", VariableType::Number, "Index of the matching case", json!(0)),
            OutputSchemaEntry::new("route", VariableType::String, "Port taken", json!("case-0")),
        ]
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        validate_with(data, |d: SwitchData| {
            let mut errors = Vec::new();
            if d.expression.trim().is_empty() {
                errors.push("expression is required".into());
            }
            if d.cases.is_empty() && !d.has_default {
                errors.push("switch needs at least one case or a default route".into());
            }
            errors
        })
    }

    fn ports(&self) -> PortSpec {
        PortSpec { inputs: 1, outputs: 2 }
    }

    fn execute(&self, input: Value, data: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let d: SwitchData = parse_data(&ctx.node_id, data)?;
            let value = ctx.evaluate(&d.expression, &input)?;

            if let Some((index, case)) = d
                .cases
                .iter()
                .enumerate()
                .find(|(_, case)| values_match(&case.value, &value))
            {
                return Ok(json!({
                    "value": value,
                    "matched_case": index,
                    "route": case_route(index),
                    "label": case.label,
                }));
            }

            if d.has_default {
                return Ok(json!({
                    "value": value,
                    "matched_case": null,
                    "route": DEFAULT_ROUTE,
                }));
            }

            Err(FlowError::Branching {
                node_id: ctx.node_id.clone(),
                message: format!("no case matched {} and no default route is declared", value),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::RhaiEvaluator;
    use nodeflow_core::GraphNode;
    use nodeflow_test_utils::test_context;
    use std::sync::Arc;

    async fn run(data: Value, input: Value) -> Result<Value> {
        let node = GraphNode::new("s", "switch", json!({}));
        let ctx = test_context(&node, input.clone(), Arc::new(RhaiEvaluator::default()));
        SwitchPlugin.execute(input, data, ctx).await
    }

    fn data(has_default: bool) -> Value {
        json!({
            "expression": "input.code",
            "cases": [{"value": 200, "label": "ok"}, {"value": 404}],
            "has_default": has_default
        })
    }

    #[tokio::test]
    async fn first_matching_case_wins() {
        let out = run(data(false), json!({"code": 404})).await.unwrap();
        assert_eq!(out["route"], "case-1");
        assert_eq!(out["matched_case"], 1);

        let out = run(data(false), json!({"code": 200})).await.unwrap();
        assert_eq!(out["route"], "case-0");
        assert_eq!(out["label"], "ok");
    }

    #[tokio::test]
    async fn falls_back_to_default() {
        let out = run(data(true), json!({"code": 500})).await.unwrap();
        assert_eq!(out["route"], "default");
        assert!(out["matched_case"].is_null());
    }

    #[tokio::test]
    async fn no_match_without_default_fails() {
        let err = run(data(false), json!({"code": 500})).await.unwrap_err();
        assert!(matches!(err, FlowError::Branching { ref node_id, .. } if node_id == "s"));
    }

    #[test]
    fn numbers_match_by_value() {
        assert!(values_match(&json!(2), &json!(2.0)));
        assert!(!values_match(&json!("2"), &json!(2)));
    }

    #[test]
    fn needs_cases_or_default() {
        let errors = SwitchPlugin.validate_data(&json!({"expression": "x", "cases": []}));
        assert_eq!(errors.len(), 1);
        assert!(SwitchPlugin.validate_data(&SwitchPlugin.create_default_data()).is_empty());
    }
}
