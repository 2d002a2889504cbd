use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level nodeflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub expression: ExpressionConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub delay: DelayConfig,
    #[serde(default)]
    pub loop_node: LoopConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Safety bounds for runtime variable extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Items visited per array; `length` is always recorded.
    #[serde(default = "default_max_array_items")]
    pub max_array_items: usize,
    /// Properties visited per object.
    #[serde(default = "default_max_object_keys")]
    pub max_object_keys: usize,
    /// Serialized size in bytes above which a composite value is skipped.
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,
    #[serde(default = "default_max_total_variables")]
    pub max_total_variables: usize,
    /// Characters kept in string previews before the ellipsis.
    #[serde(default = "default_max_preview_length")]
    pub max_preview_length: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_array_items: default_max_array_items(),
            max_object_keys: default_max_object_keys(),
            max_value_size: default_max_value_size(),
            max_total_variables: default_max_total_variables(),
            max_preview_length: default_max_preview_length(),
        }
    }
}

fn default_max_depth() -> usize { 6 }
fn default_max_array_items() -> usize { 10 }
fn default_max_object_keys() -> usize { 50 }
fn default_max_value_size() -> usize { 1024 * 1024 }
fn default_max_total_variables() -> usize { 500 }
fn default_max_preview_length() -> usize { 50 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Buffer of the broadcast fan-out used by `EventBus::subscribe`.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

fn default_bus_capacity() -> usize { 256 }

/// Limits applied to the embedded expression engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionConfig {
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "default_max_expr_depth")]
    pub max_expr_depth: usize,
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "default_max_array_size")]
    pub max_array_size: usize,
}

impl Default for ExpressionConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_expr_depth: default_max_expr_depth(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_array_size(),
        }
    }
}

fn default_max_operations() -> u64 { 100_000 }
fn default_max_expr_depth() -> usize { 64 }
fn default_max_string_size() -> usize { 1024 * 1024 }
fn default_max_array_size() -> usize { 10_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub default_timeout_secs: u64,
    /// Ceiling for per-node `timeout_secs`.
    #[serde(default = "default_http_max_timeout")]
    pub max_timeout_secs: u64,
    /// Response bodies are truncated past this many bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_http_timeout(),
            max_timeout_secs: default_http_max_timeout(),
            max_body_bytes: default_max_body_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_http_timeout() -> u64 { 30 }
fn default_http_max_timeout() -> u64 { 300 }
fn default_max_body_bytes() -> usize { 1024 * 1024 }
fn default_user_agent() -> String { format!("nodeflow/{}", env!("CARGO_PKG_VERSION")) }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Ceiling for fixed and expression-computed delays.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,
    /// Ceiling for `until` polling timeouts.
    #[serde(default = "default_max_poll_timeout_ms")]
    pub max_poll_timeout_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: default_max_delay_ms(),
            default_poll_interval_ms: default_poll_interval_ms(),
            max_poll_timeout_ms: default_max_poll_timeout_ms(),
        }
    }
}

fn default_max_delay_ms() -> u64 { 300_000 }
fn default_poll_interval_ms() -> u64 { 1_000 }
fn default_max_poll_timeout_ms() -> u64 { 600_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Hard cap on items a loop node will emit.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Cap used when a node does not set `max_iterations`.
    #[serde(default = "default_iterations")]
    pub default_iterations: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            default_iterations: default_iterations(),
        }
    }
}

fn default_max_iterations() -> usize { 1_000 }
fn default_iterations() -> usize { 100 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// tracing-subscriber filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "nodeflow=info,warn".to_string() }

impl AppConfig {
    /// Load from a TOML file, expanding `${ENV_VAR}` references first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.extractor.max_total_variables == 0 {
            return Err(FlowError::Config(
                "extractor.max_total_variables must be at least 1".into(),
            ));
        }
        if self.loop_node.default_iterations > self.loop_node.max_iterations {
            return Err(FlowError::Config(format!(
                "loop_node.default_iterations ({}) exceeds max_iterations ({})",
                self.loop_node.default_iterations, self.loop_node.max_iterations
            )));
        }
        if self.http.default_timeout_secs > self.http.max_timeout_secs {
            return Err(FlowError::Config(format!(
                "http.default_timeout_secs ({}) exceeds max_timeout_secs ({})",
                self.http.default_timeout_secs, self.http.max_timeout_secs
            )));
        }
        Ok(())
    }
}

/// Replace `${NAME}` with the environment value; unset names are kept as-is.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_NODEFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_NODEFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
    }

    #[test]
    fn test_expand_env_vars_missing_kept() {
        let result = expand_env_vars("key = \"${NODEFLOW_SURELY_UNSET_VAR}\"");
        assert_eq!(result, "key = \"${NODEFLOW_SURELY_UNSET_VAR}\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.extractor, ExtractorConfig::default());
        assert_eq!(config.extractor.max_depth, 6);
        assert_eq!(config.extractor.max_array_items, 10);
        assert_eq!(config.extractor.max_object_keys, 50);
        assert_eq!(config.extractor.max_value_size, 1_048_576);
        assert_eq!(config.extractor.max_total_variables, 500);
        assert_eq!(config.event_bus.capacity, 256);
        assert_eq!(config.loop_node.max_iterations, 1_000);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = AppConfig::from_toml("[extractor]\nmax_depth = 2\n").unwrap();
        assert_eq!(config.extractor.max_depth, 2);
        assert_eq!(config.extractor.max_array_items, 10);
    }

    #[test]
    fn test_rejects_inconsistent_limits() {
        let err = AppConfig::from_toml("[loop_node]\nmax_iterations = 5\ndefault_iterations = 10\n")
            .unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, FlowError::ConfigNotFound(_)));
        assert!(AppConfig::load_or_default(Path::new("/definitely/not/here.toml")).is_ok());
    }
}
