use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use nodeflow_core::config::DelayConfig;
use nodeflow_core::context::LogLevel;
use nodeflow_core::traits::is_truthy;
use nodeflow_core::types::node_types;
use nodeflow_core::{
    ExecutionContext, FlowError, NodeCategory, NodeMetadata, NodePlugin, OutputSchemaEntry,
    Result, VariableType,
};

use super::{metadata, parse_data, validate_with};

/// Pauses the run: for a fixed time, for an expression-computed time, or
/// until a condition holds.
pub struct DelayPlugin {
    config: DelayConfig,
}

impl DelayPlugin {
    pub fn new(config: DelayConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DelayMode {
    Fixed,
    Expression,
    Until,
}

impl DelayMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Expression => "expression",
            Self::Until => "until",
        }
    }
}

#[derive(Deserialize)]
struct DelayData {
    #[serde(default = "default_mode")]
    mode: DelayMode,
    #[serde(default = "default_duration_ms")]
    duration_ms: u64,
    #[serde(default)]
    expression: String,
    /// Ceiling for computed durations, itself capped by configuration.
    #[serde(default)]
    max_ms: Option<u64>,
    #[serde(default)]
    condition: String,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_mode() -> DelayMode {
    DelayMode::Fixed
}
fn default_duration_ms() -> u64 {
    1_000
}
fn default_timeout_ms() -> u64 {
    60_000
}

impl NodePlugin for DelayPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata(
            node_types::DELAY,
            "Delay",
            "Waits for a duration or until a condition holds",
            NodeCategory::Logic,
        )
    }

    fn create_default_data(&self) -> Value {
        json!({"label": "Delay", "mode": "fixed", "duration_ms": 1000})
    }

    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        vec![
            OutputSchemaEntry::new("waited_ms", VariableType::Number, "Time spent waiting", json!(1000)),
            OutputSchemaEntry::new("mode", VariableType::String, "Delay mode used", json!("fixed")),
            OutputSchemaEntry::new("input", VariableType::Any, "Input passed through", json!({})),
        ]
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        validate_with(data, |d: DelayData| {
            let mut errors = Vec::new();
            match d.mode {
                DelayMode::Fixed if d.duration_ms > self.config.max_delay_ms => errors.push(format!(
                    "duration_ms {} exceeds the limit of {}",
                    d.duration_ms, self.config.max_delay_ms
                )),
                DelayMode::Expression if d.expression.trim().is_empty() => {
                    errors.push("expression is required in expression mode".into())
                }
                DelayMode::Until if d.condition.trim().is_empty() => {
                    errors.push("condition is required in until mode".into())
                }
                _ => {}
            }
            if d.poll_interval_ms == Some(0) {
                errors.push("poll_interval_ms must be at least 1".into());
            }
            errors
        })
    }

    fn execute(&self, input: Value, data: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let d: DelayData = parse_data(&ctx.node_id, data)?;
            let ceiling = d
                .max_ms
                .unwrap_or(self.config.max_delay_ms)
                .min(self.config.max_delay_ms);

            let waited_ms = match d.mode {
                DelayMode::Fixed => {
                    let ms = d.duration_ms.min(ceiling);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    ms
                }
                DelayMode::Expression => {
                    let value = ctx.evaluate(&d.expression, &input)?;
                    let ms = value
                        .as_f64()
                        .filter(|ms| ms.is_finite() && *ms >= 0.0)
                        .ok_or_else(|| {
                            FlowError::Expression(format!(
                                "delay expression must produce a non-negative number, got {}",
                                value
                            ))
                        })?;
                    let ms = (ms as u64).min(ceiling);
                    ctx.log(LogLevel::Debug, format!("Waiting {}ms", ms));
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    ms
                }
                DelayMode::Until => self.poll(&ctx, &d, &input).await?,
            };

            Ok(json!({"waited_ms": waited_ms, "mode": d.mode.as_str(), "input": input}))
        })
    }
}

impl DelayPlugin {
    /// Re-evaluate the condition until it holds or the timeout elapses.
    async fn poll(&self, ctx: &ExecutionContext, d: &DelayData, input: &Value) -> Result<u64> {
        let timeout_ms = d.timeout_ms.min(self.config.max_poll_timeout_ms);
        let interval_ms = d
            .poll_interval_ms
            .unwrap_or(self.config.default_poll_interval_ms)
            .max(1);
        let started = Instant::now();

        loop {
            if is_truthy(&ctx.evaluate(&d.condition, input)?) {
                return Ok(started.elapsed().as_millis() as u64);
            }

            let elapsed = started.elapsed().as_millis() as u64;
            if elapsed >= timeout_ms {
                return Err(FlowError::Timeout {
                    what: format!("waiting for `{}`", d.condition),
                    timeout_ms,
                });
            }
            let remaining = timeout_ms - elapsed;
            tokio::time::sleep(Duration::from_millis(interval_ms.min(remaining))).await;
        }
    }
}
