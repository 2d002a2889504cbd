use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::*;

/// Executable behavior bound to one node type.
pub trait NodePlugin: Send + Sync + 'static {
    /// Type tag, display name, version and palette category.
    fn metadata(&self) -> NodeMetadata;

    /// Configuration a freshly dropped node starts with.
    fn create_default_data(&self) -> Value;

    /// Run the node against its resolved input and configuration.
    fn execute(&self, input: Value, data: Value, ctx: ExecutionContext)
        -> BoxFuture<'_, Result<Value>>;

    /// Statically declared outputs, independent of any run.
    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        Vec::new()
    }

    /// Configuration problems, one message each. Empty means valid.
    fn validate_data(&self, _data: &Value) -> Vec<String> {
        Vec::new()
    }

    /// Required input/output port counts.
    fn ports(&self) -> PortSpec {
        PortSpec::default()
    }
}

/// Variables visible to an expression, by name.
#[derive(Debug, Clone, Default)]
pub struct EvalScope {
    vars: BTreeMap<String, Value>,
}

impl EvalScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }
}

/// Expression evaluator injected into every execution context.
pub trait ExpressionEvaluator: Send + Sync + 'static {
    /// Evaluate `expression` with the given variables in scope.
    fn evaluate(&self, expression: &str, scope: &EvalScope) -> Result<Value>;
}

/// Completion backend, reached only through the `llm` node.
pub trait LlmClient: Send + Sync + 'static {
    fn complete(&self, request: LlmRequest) -> BoxFuture<'_, Result<LlmResponse>>;
}

/// Truthiness used for routing: null, false, zero, NaN and "" are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(2)));
        assert!(is_truthy(&json!("no")));
        assert!(is_truthy(&json!([])));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(null)));
    }

    #[test]
    fn scope_builder() {
        let scope = EvalScope::new().with("input", json!({"a": 1})).with("n", json!(2));
        assert_eq!(scope.get("n"), Some(&json!(2)));
        assert_eq!(scope.iter().count(), 2);
        assert!(scope.get("missing").is_none());
    }
}
