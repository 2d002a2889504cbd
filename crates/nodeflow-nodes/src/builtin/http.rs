use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use nodeflow_core::config::HttpConfig;
use nodeflow_core::context::LogLevel;
use nodeflow_core::types::node_types;
use nodeflow_core::{
    ExecutionContext, FlowError, NodeCategory, NodeMetadata, NodePlugin, OutputSchemaEntry,
    Result, VariableType,
};

use super::{metadata, parse_data, validate_with};

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Issues an HTTP request with `{source.path}` references rendered into the
/// URL, header values and body.
///
/// Transport failures do not fail the node: they come back as
/// `success: false` with an `error` message so the flow can branch on them.
pub struct HttpPlugin {
    config: HttpConfig,
    client: reqwest::Client,
}

impl HttpPlugin {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FlowError::Http(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn timeout(&self, requested: Option<u64>) -> Duration {
        Duration::from_secs(
            requested
                .unwrap_or(self.config.default_timeout_secs)
                .min(self.config.max_timeout_secs),
        )
    }

    /// Send and read at most `max_body_bytes` of the response.
    async fn send(&self, request: reqwest::RequestBuilder) -> reqwest::Result<Value> {
        let mut resp = request.send().await?;
        let status = resp.status();

        let mut headers = Map::new();
        for (name, value) in resp.headers() {
            headers.insert(
                name.as_str().to_string(),
                Value::String(value.to_str().unwrap_or("?").to_string()),
            );
        }
        let is_json = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));

        let mut bytes = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = resp.chunk().await? {
            let room = self.config.max_body_bytes - bytes.len();
            if chunk.len() > room {
                bytes.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        let text = String::from_utf8_lossy(&bytes).into_owned();
        let body = if is_json && !truncated {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        let mut out = json!({
            "success": status.is_success(),
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
            "truncated": truncated,
        });
        if !status.is_success() {
            out["error"] = json!(format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end());
        }
        Ok(out)
    }
}

#[derive(Deserialize)]
struct HttpData {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

fn default_method() -> String {
    "GET".into()
}

impl NodePlugin for HttpPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata(
            node_types::HTTP,
            "HTTP Request",
            "Calls an HTTP endpoint and returns status, headers and body",
            NodeCategory::Action,
        )
    }

    fn create_default_data(&self) -> Value {
        json!({
            "label": "HTTP Request",
            "method": "GET",
            "url": "https://api.example.com/items",
            "headers": {},
            "timeout_secs": self.config.default_timeout_secs
        })
    }

    fn output_schema(&self) -> Vec<OutputSchemaEntry> {
        vec![
            OutputSchemaEntry::new("success", VariableType::Boolean, "Whether a 2xx response arrived", json!(true)),
            OutputSchemaEntry::new("status", VariableType::Number, "HTTP status code", json!(200)),
            OutputSchemaEntry::new("headers", VariableType::Object, "Response headers", json!({})),
            OutputSchemaEntry::new("body", VariableType::Any, "Response body, parsed when JSON", json!({})),
            OutputSchemaEntry::new("error", VariableType::String, "Failure description", json!("HTTP 404 Not Found")),
            OutputSchemaEntry::new("elapsed_ms", VariableType::Number, "Round-trip time", json!(120)),
        ]
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        validate_with(data, |d: HttpData| {
            let mut errors = Vec::new();
            if d.url.trim().is_empty() {
                errors.push("url is required".to_string());
            }
            if !METHODS.contains(&d.method.to_uppercase().as_str()) {
                errors.push(format!("unsupported method: {}", d.method));
            }
            errors
        })
    }

    fn execute(&self, _input: Value, data: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let d: HttpData = parse_data(&ctx.node_id, data)?;
            let method = d
                .method
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| FlowError::InvalidNodeData {
                    node_id: ctx.node_id.clone(),
                    errors: vec![format!("invalid method: {}", e)],
                })?;
            let url = ctx.substitute(&d.url);
            ctx.log(LogLevel::Debug, format!("{} {}", method, url));

            let mut request = self
                .client
                .request(method, &url)
                .timeout(self.timeout(d.timeout_secs));

            let mut has_content_type = false;
            for (name, value) in &d.headers {
                has_content_type |= name.eq_ignore_ascii_case(CONTENT_TYPE.as_str());
                request = request.header(name.as_str(), ctx.substitute(value));
            }

            match d.body {
                None | Some(Value::Null) => {}
                Some(Value::String(text)) => request = request.body(ctx.substitute(&text)),
                Some(structured) => {
                    if !has_content_type {
                        request = request.header(CONTENT_TYPE, "application/json");
                    }
                    request = request.body(ctx.substitute_value(&structured).to_string());
                }
            }

            let started = Instant::now();
            let mut out = match self.send(request).await {
                Ok(out) => out,
                Err(e) => {
                    ctx.log(LogLevel::Warn, format!("Request to {} failed: {}", url, e));
                    json!({
                        "success": false,
                        "status": null,
                        "headers": {},
                        "body": null,
                        "error": e.to_string(),
                    })
                }
            };
            out["elapsed_ms"] = json!(started.elapsed().as_millis() as u64);
            Ok(out)
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one canned response and hand back the raw request.
    async fn serve_once(response: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
        });

        (addr, rx)
    }

    fn plugin() -> HttpPlugin {
        HttpPlugin::new(HttpConfig::default()).unwrap()
    }

    async fn run(data: Value, input: Value) -> Value {
        let node = GraphNode::new("h", "http", json!({}));
        let ctx = test_context(&node, input.clone(), Arc::new(RhaiEvaluator::default()));
        plugin().execute(input, data, ctx).await.unwrap()
    }

    #[tokio::test]
    async fn json_response_is_parsed() {
        let (addr, request) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 17\r\nConnection: close\r\n\r\n{\"items\": [1, 2]}",
        )
        .await;

        let out = run(
            json!({"method": "post", "url": "http://{input.host}/orders/{input.id}", "headers": {"X-Trace": "{input.id}"}, "body": {"qty": "{input.qty}"}}),
            json!({"host": addr, "id": 7, "qty": 3}),
        )
        .await;

        assert_eq!(out["success"], true);
        assert_eq!(out["status"], 200);
        assert_eq!(out["body"], json!({"items": [1, 2]}));
        assert_eq!(out["headers"]["content-type"], "application/json");
        assert!(out["elapsed_ms"].is_u64());

        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST /orders/7 HTTP/1.1"));
        assert!(raw.to_lowercase().contains("x-trace: 7"));
        assert!(raw.to_lowercase().contains("content-type: application/json"));
        assert!(raw.ends_with(r#"{"qty":"3"}"#));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (addr, _request) = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope",
        )
        .await;

        let out = run(json!({"url": format!("http://{}/missing", addr)}), json!({})).await;
        assert_eq!(out["success"], false);
        assert_eq!(out["status"], 404);
        assert_eq!(out["body"], "nope");
        assert_eq!(out["error"], "HTTP 404 Not Found");
    }

    #[tokio::test]
    async fn transport_failure_is_swallowed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let out = run(json!({"url": format!("http://{}/", addr)}), json!({})).await;
        assert_eq!(out["success"], false);
        assert!(out["status"].is_null());
        assert!(out["error"].as_str().is_some_and(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn large_bodies_are_truncated() {
        let (addr, _request) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 10\r\nConnection: close\r\n\r\n0123456789",
        )
        .await;
        let plugin = HttpPlugin::new(HttpConfig {
            max_body_bytes: 4,
            ..Default::default()
        })
        .unwrap();
        let node = GraphNode::new("h", "http", json!({}));
        let ctx = test_context(&node, json!({}), Arc::new(RhaiEvaluator::default()));

        let out = plugin
            .execute(json!({}), json!({"url": format!("http://{}/", addr)}), ctx)
            .await
            .unwrap();
        assert_eq!(out["body"], "0123");
        assert_eq!(out["truncated"], true);
    }

    #[test]
    fn timeout_is_capped() {
        let plugin = plugin();
        assert_eq!(plugin.timeout(None), Duration::from_secs(30));
        assert_eq!(plugin.timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(plugin.timeout(Some(10_000)), Duration::from_secs(300));
    }

    #[test]
    fn validation() {
        let plugin = plugin();
        assert!(plugin.validate_data(&plugin.create_default_data()).is_empty());
        let errors = plugin.validate_data(&json!({"method": "FETCH"}));
        assert_eq!(errors, vec!["url is required", "unsupported method: FETCH"]);
    }
}
