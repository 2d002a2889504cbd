//! Rhai-backed expression evaluator.
//!
//! Expressions see every `EvalScope` entry as a variable (`input`, `nodes`,
//! and whatever a plugin adds, e.g. `item` while filtering). JSON values cross
//! the boundary through rhai's serde support: objects become object maps,
//! arrays become arrays and a missing property reads as `()` (null).
//!
//! Extra functions:
//! - `now_ms()` - current Unix time in milliseconds
//! - `is_null(x)` - whether a value is `()`
//! - `to_json(x)` - compact JSON text of a value

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use nodeflow_core::config::ExpressionConfig;
use nodeflow_core::{EvalScope, ExpressionEvaluator, FlowError, Result};
use regex::Regex;
use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::Value;
use tracing::debug;

/// Compiled expressions kept before the cache is reset.
const MAX_CACHED: usize = 256;

/// Keywords rejected before compilation.
const FORBIDDEN: &[&str] = &["eval", "import", "export", "Fn"];

fn forbidden_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(r"\b({})\b", FORBIDDEN.join("|"))).expect("forbidden pattern is valid")
    })
}

pub struct RhaiEvaluator {
    engine: Engine,
    cache: RwLock<HashMap<String, Arc<AST>>>,
}

impl RhaiEvaluator {
    pub fn new(config: &ExpressionConfig) -> Self {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, config);
        Self {
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Safety limits and helper functions.
    fn configure_engine(engine: &mut Engine, config: &ExpressionConfig) {
        engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);
        engine.set_max_call_levels(32);
        engine.set_max_operations(config.max_operations);
        engine.set_max_string_size(config.max_string_size);
        engine.set_max_array_size(config.max_array_size);
        engine.set_max_map_size(config.max_array_size);

        for symbol in FORBIDDEN {
            engine.disable_symbol(*symbol);
        }

        engine.on_print(|text| debug!(target: "nodeflow::expression", "{}", text));
        engine.on_debug(|text, _, _| debug!(target: "nodeflow::expression", "{}", text));

        engine.register_fn("now_ms", || -> i64 { chrono::Utc::now().timestamp_millis() });
        engine.register_fn("is_null", |value: Dynamic| -> bool { value.is_unit() });
        engine.register_fn("to_json", |value: Dynamic| -> String {
            rhai::serde::from_dynamic::<Value>(&value)
                .map(|v| v.to_string())
                .unwrap_or_default()
        });
    }

    fn compile(&self, expression: &str) -> Result<Arc<AST>> {
        if let Some(ast) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(expression)
        {
            return Ok(ast.clone());
        }

        let ast = Arc::new(
            self.engine
                .compile(expression)
                .map_err(|e| FlowError::Expression(format!("{} in `{}`", e, expression)))?,
        );

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= MAX_CACHED {
            cache.clear();
        }
        cache.insert(expression.to_string(), ast.clone());
        Ok(ast)
    }
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        Self::new(&ExpressionConfig::default())
    }
}

/// Reject empty expressions and forbidden keywords.
pub fn check_expression(expression: &str) -> Result<()> {
    if expression.trim().is_empty() {
        return Err(FlowError::Expression("expression is empty".into()));
    }
    if let Some(found) = forbidden_pattern().find(expression) {
        return Err(FlowError::Expression(format!(
            "`{}` is not allowed in expressions",
            found.as_str()
        )));
    }
    Ok(())
}

impl ExpressionEvaluator for RhaiEvaluator {
    fn evaluate(&self, expression: &str, scope: &EvalScope) -> Result<Value> {
        check_expression(expression)?;
        let ast = self.compile(expression.trim())?;

        let mut rhai_scope = Scope::new();
        for (name, value) in scope.iter() {
            let dynamic = rhai::serde::to_dynamic(value)
                .map_err(|e| FlowError::Expression(format!("cannot bind `{}`: {}", name, e)))?;
            rhai_scope.push_dynamic(name.as_str(), dynamic);
        }

        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut rhai_scope, &ast)
            .map_err(|e| FlowError::Expression(format!("{} in `{}`", e, expression.trim())))?;

        rhai::serde::from_dynamic(&result).map_err(|e| {
            FlowError::Expression(format!(
                "result of `{}` is not a JSON value: {}",
                expression.trim(),
                e
            ))
        })
    }
}
