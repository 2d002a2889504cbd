use std::io::Write;

use nodeflow_core::config::AppConfig;
use nodeflow_core::FlowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[extractor]
max_depth = 4
max_array_items = 3
max_object_keys = 20
max_value_size = 4096
max_total_variables = 100
max_preview_length = 30

[event_bus]
capacity = 64

[expression]
max_operations = 5000
max_expr_depth = 16

[http]
default_timeout_secs = 10
max_timeout_secs = 60
max_body_bytes = 65536
user_agent = "nodeflow-ci"

[delay]
max_delay_ms = 5000
default_poll_interval_ms = 250
max_poll_timeout_ms = 10000

[loop_node]
max_iterations = 50
default_iterations = 10

[log]
filter = "nodeflow=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.extractor.max_depth, 4);
    assert_eq!(config.extractor.max_array_items, 3);
    assert_eq!(config.extractor.max_preview_length, 30);
    assert_eq!(config.event_bus.capacity, 64);
    assert_eq!(config.expression.max_operations, 5000);
    assert_eq!(config.expression.max_expr_depth, 16);
    assert_eq!(config.http.max_body_bytes, 65536);
    assert_eq!(config.http.user_agent, "nodeflow-ci");
    assert_eq!(config.delay.default_poll_interval_ms, 250);
    assert_eq!(config.loop_node.max_iterations, 50);
    assert_eq!(config.log.filter, "nodeflow=debug");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("NODEFLOW_TEST_USER_AGENT", "expanded-agent");

    let toml_content = r#"
[http]
user_agent = "${NODEFLOW_TEST_USER_AGENT}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.http.user_agent, "expanded-agent");

    std::env::remove_var("NODEFLOW_TEST_USER_AGENT");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[event_bus]
capacity = 32
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.event_bus.capacity, 32);
    assert_eq!(config.extractor.max_depth, 6);
    assert_eq!(config.http.default_timeout_secs, 30);
    assert_eq!(config.http.max_timeout_secs, 300);
    assert_eq!(config.delay.max_delay_ms, 300_000);
    assert_eq!(config.loop_node.default_iterations, 100);
    assert_eq!(config.log.filter, "nodeflow=info,warn");
}

#[test]
fn test_invalid_limits_are_rejected() {
    let toml_content = r#"
[http]
default_timeout_secs = 600
max_timeout_secs = 60
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
    assert!(err.to_string().contains("default_timeout_secs"));
}

#[test]
fn test_malformed_toml_is_a_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[extractor\nmax_depth = ").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = AppConfig::default();
    let text = toml::to_string_pretty(&config).expect("serialize");
    let reloaded = AppConfig::from_toml(&text).expect("reload");
    assert_eq!(reloaded.extractor, config.extractor);
    assert_eq!(reloaded.http.user_agent, config.http.user_agent);
}

#[test]
fn test_missing_explicit_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("nodeflow.toml");

    let err = AppConfig::load(&path).unwrap_err();
    assert!(matches!(err, FlowError::ConfigNotFound(_)));

    let config = AppConfig::load_or_default(&path).expect("defaults");
    assert_eq!(config.event_bus.capacity, 256);
}
