use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use nodeflow_core::event::topics;
use nodeflow_core::{
    AppConfig, EventBus, FlowError, LlmClient, NodeCategory, NodePlugin, PortSpec, Result,
};
use nodeflow_variables::VariableRegistry;

use crate::builtin;

struct Registration {
    plugin: Arc<dyn NodePlugin>,
    enabled: bool,
    registered_at: DateTime<Utc>,
}

/// Summary of one registration, as listed by `NodeRegistry::list`.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub category: NodeCategory,
    pub ports: PortSpec,
    pub outputs: usize,
    pub enabled: bool,
    pub registered_at: DateTime<Utc>,
}

/// Registry of node plugins, keyed by node type.
///
/// Registering a plugin also publishes its output schema to the variable
/// registry so downstream nodes can discover its outputs before any run.
pub struct NodeRegistry {
    plugins: HashMap<String, Registration>,
    variables: Arc<VariableRegistry>,
    event_bus: Option<Arc<EventBus>>,
}

impl NodeRegistry {
    pub fn new(variables: Arc<VariableRegistry>) -> Self {
        Self {
            plugins: HashMap::new(),
            variables,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Register a plugin. Fails if its node type is already taken.
    pub fn register(&mut self, plugin: impl NodePlugin) -> Result<()> {
        self.register_shared(Arc::new(plugin))
    }

    /// Register a plugin that is already behind an `Arc`.
    pub fn register_shared(&mut self, plugin: Arc<dyn NodePlugin>) -> Result<()> {
        let meta = plugin.metadata();
        if self.plugins.contains_key(&meta.node_type) {
            return Err(FlowError::DuplicateType(meta.node_type));
        }

        let schema = plugin.output_schema();
        if !schema.is_empty() {
            self.variables.register_schema(&meta.node_type, schema);
        }

        debug!(node_type = %meta.node_type, version = %meta.version, "Registered node plugin");
        self.emit(
            topics::PLUGIN_REGISTERED,
            json!({"type": meta.node_type, "version": meta.version}),
        );
        self.plugins.insert(
            meta.node_type,
            Registration {
                plugin,
                enabled: true,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Remove a plugin and its published schema.
    pub fn unregister(&mut self, node_type: &str) -> bool {
        if self.plugins.remove(node_type).is_none() {
            return false;
        }
        self.variables.remove_schema(node_type);
        self.emit(topics::PLUGIN_UNREGISTERED, json!({"type": node_type}));
        true
    }

    /// The plugin for `node_type`, if registered and enabled.
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodePlugin>> {
        self.plugins
            .get(node_type)
            .filter(|r| r.enabled)
            .map(|r| r.plugin.clone())
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.plugins.contains_key(node_type)
    }

    /// Enable or disable a registration. Returns false for unknown types.
    pub fn set_enabled(&mut self, node_type: &str, enabled: bool) -> bool {
        match self.plugins.get_mut(node_type) {
            Some(registration) => {
                registration.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, node_type: &str) -> bool {
        self.plugins.get(node_type).is_some_and(|r| r.enabled)
    }

    /// All registrations, sorted by node type.
    pub fn list(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self
            .plugins
            .values()
            .map(|r| {
                let meta = r.plugin.metadata();
                PluginInfo {
                    node_type: meta.node_type,
                    name: meta.name,
                    description: meta.description,
                    version: meta.version,
                    category: meta.category,
                    ports: r.plugin.ports(),
                    outputs: r.plugin.output_schema().len(),
                    enabled: r.enabled,
                    registered_at: r.registered_at,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        infos
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Check every registration for incomplete metadata, default data that
    /// does not pass its own validation, and malformed output schemas.
    ///
    /// Only types with problems appear in the result.
    pub fn validate_all(&self) -> BTreeMap<String, Vec<String>> {
        let mut report = BTreeMap::new();
        for (node_type, registration) in &self.plugins {
            let errors = check_plugin(node_type, registration.plugin.as_ref());
            if !errors.is_empty() {
                report.insert(node_type.clone(), errors);
            }
        }
        report
    }

    pub fn variables(&self) -> &Arc<VariableRegistry> {
        &self.variables
    }

    /// A registry with every built-in node type. The `llm` type is only
    /// available when a completion backend is supplied.
    pub fn with_builtins(
        config: &AppConfig,
        variables: Arc<VariableRegistry>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self> {
        let mut registry = Self::new(variables);

        // ── Flow control ────────────────────────────────────────
        registry.register(builtin::TriggerPlugin)?;
        registry.register(builtin::ConditionPlugin)?;
        registry.register(builtin::SwitchPlugin)?;
        registry.register(builtin::LoopPlugin::new(config.loop_node.clone()))?;
        registry.register(builtin::DelayPlugin::new(config.delay.clone()))?;
        registry.register(builtin::EndPlugin)?;

        // ── Data & actions ──────────────────────────────────────
        registry.register(builtin::TransformPlugin)?;
        registry.register(builtin::HttpPlugin::new(config.http.clone())?)?;
        if let Some(client) = llm {
            registry.register(builtin::LlmPlugin::new(client))?;
        }

        info!(count = registry.len(), "Built-in node plugins registered");
        Ok(registry)
    }

    fn emit(&self, topic: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.event_bus {
            bus.emit(topic, payload);
        }
    }
}

fn check_plugin(node_type: &str, plugin: &dyn NodePlugin) -> Vec<String> {
    let mut errors = Vec::new();
    let meta = plugin.metadata();

    if meta.node_type != node_type {
        errors.push(format!(
            "metadata type '{}' differs from registered type",
            meta.node_type
        ));
    }
    if meta.name.trim().is_empty() {
        errors.push("metadata name is empty".into());
    }
    if meta.version.trim().is_empty() {
        errors.push("metadata version is empty".into());
    }

    let defaults = plugin.create_default_data();
    if !defaults.is_object() {
        errors.push("default data is not an object".into());
    } else {
        for problem in plugin.validate_data(&defaults) {
            errors.push(format!("default data is invalid: {}", problem));
        }
    }

    let mut seen = HashSet::new();
    for entry in plugin.output_schema() {
        if entry.name.trim().is_empty() {
            errors.push("output schema entry has an empty name".into());
        } else if !seen.insert(entry.name.clone()) {
            errors.push(format!("output schema lists '{}' twice", entry.name));
        }
    }
    errors
}
