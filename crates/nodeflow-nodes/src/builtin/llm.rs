use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use nodeflow_core::context::LogLevel;
use nodeflow_core::types::node_types;
use nodeflow_core::{
    ExecutionContext, LlmClient, LlmRequest, NodeCategory, NodeMetadata, NodePlugin,
    OutputSchemaEntry, Result, VariableType,
};

use super::{metadata, parse_data, plugin_error, validate_with};

/// Sends a rendered prompt to the injected completion backend.
pub struct LlmPlugin {
    client: Arc<dyn LlmClient>,
}

impl LlmPlugin {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct LlmData {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

impl NodePlugin for LlmPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata(
            node_types::LLM,
            "LLM",
            "Asks a language model to complete a prompt",
            NodeCategory::Ai,
        )
    }

    fn create_default_data(&self) -> Value {
        json!({
            "label": "LLM",
            "prompt": "Summarize: {input.text}",
            "temperature": 0.7,
            "max_tokens": 1024
        })
    }

    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        vec![
            OutputSchemaEntry::new("response", VariableType::String, "Completion text", json!("Hello!")),
            OutputSchemaEntry::new("model", VariableType::String, "Model that answered", json!("gpt-4o-mini")),
            OutputSchemaEntry::new("usage", VariableType::Object, "Token counts", json!({})),
            OutputSchemaEntry::new("usage.input_tokens", VariableType::Number, "Prompt tokens", json!(12)),
            OutputSchemaEntry::new("usage.output_tokens", VariableType::Number, "Completion tokens", json!(40)),
        ]
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        validate_with(data, |d: LlmData| {
            let mut errors = Vec::new();
            if d.prompt.trim().is_empty() {
                errors.push("prompt is required".to_string());
            }
            if let Some(t) = d.temperature {
                if !(0.0..=2.0).contains(&t) {
                    errors.push(format!("temperature must be between 0 and 2, got {}", t));
                }
            }
            if d.max_tokens == Some(0) {
                errors.push("max_tokens must be at least 1".to_string());
            }
            errors
        })
    }

    fn execute(&self, _input: Value, data: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let d: LlmData = parse_data(&ctx.node_id, data)?;
            let request = LlmRequest {
                model: d.model.filter(|m| !m.trim().is_empty()),
                system_prompt: d
                    .system_prompt
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| ctx.substitute(&s)),
                prompt: ctx.substitute(&d.prompt),
                temperature: d.temperature,
                max_tokens: d.max_tokens,
            };
            ctx.log(
                LogLevel::Debug,
                format!("Prompt of {} chars", request.prompt.len()),
            );

            let response = self
                .client
                .complete(request)
                .await
                .map_err(|e| plugin_error(&ctx.node_id, format!("completion failed: {}", e)))?;

            Ok(json!({
                "response": response.text,
                "model": response.model,
                "usage": {
                    "input_tokens": response.input_tokens,
                    "output_tokens": response.output_tokens,
                },
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::{FlowError, GraphNode, LlmResponse, OutputMap};
    use nodeflow_test_utils::{test_context_with_outputs, LiteralEvaluator, MockLlmClient};

    struct DownClient;

    impl LlmClient for DownClient {
        fn complete(&self, _request: LlmRequest) -> BoxFuture<'_, Result<LlmResponse>> {
            Box::pin(async { Err(FlowError::Llm("connection refused".into())) })
        }
    }

    fn ctx(input: Value) -> ExecutionContext {
        let outputs = OutputMap::new();
        outputs.set("fetch", json!({"title": "Rust 2024"}));
        let node = GraphNode::new("ask", "llm", json!({}));
        test_context_with_outputs(&node, input, Arc::new(LiteralEvaluator), outputs)
    }

    #[tokio::test]
    async fn renders_prompt_and_reports_usage() {
        let client = Arc::new(MockLlmClient::new("A short summary"));
        let plugin = LlmPlugin::new(client.clone());
        let input = json!({"lang": "fr"});

        let out = plugin
            .execute(
                input.clone(),
                json!({
                    "prompt": "Summarize {fetch.title}",
                    "system_prompt": "Answer in {input.lang}",
                    "model": "small",
                    "temperature": 0.2
                }),
                ctx(input),
            )
            .await
            .unwrap();

        assert_eq!(
            out,
            json!({
                "response": "A short summary",
                "model": "small",
                "usage": {"input_tokens": 3, "output_tokens": 3}
            })
        );
        let sent = &client.requests()[0];
        assert_eq!(sent.prompt, "Summarize Rust 2024");
        assert_eq!(sent.system_prompt.as_deref(), Some("Answer in fr"));
        assert_eq!(sent.temperature, Some(0.2));
    }

    #[tokio::test]
    async fn blank_model_falls_back_to_backend_default() {
        let client = Arc::new(MockLlmClient::new("ok"));
        let plugin = LlmPlugin::new(client.clone());
        let out = plugin
            .execute(json!({}), json!({"prompt": "hi", "model": " "}), ctx(json!({})))
            .await
            .unwrap();
        assert_eq!(out["model"], "mock-model");
        assert!(client.requests()[0].model.is_none());
    }

    #[tokio::test]
    async fn backend_failure_is_a_plugin_error() {
        let plugin = LlmPlugin::new(Arc::new(DownClient));
        let err = plugin
            .execute(json!({}), json!({"prompt": "hi"}), ctx(json!({})))
            .await
            .unwrap_err();
        match err {
            FlowError::PluginExecution { node_id, message } => {
                assert_eq!(node_id, "ask");
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validation() {
        let plugin = LlmPlugin::new(Arc::new(MockLlmClient::new("")));
        assert!(plugin.validate_data(&plugin.create_default_data()).is_empty());
        let errors = plugin.validate_data(&json!({"temperature": 3.5, "max_tokens": 0}));
        assert_eq!(errors.len(), 3);
    }
}
