use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use nodeflow_core::config::ExtractorConfig;
use nodeflow_core::event::topics;
use nodeflow_core::path::{canonical_path, join_address, parse_path};
use nodeflow_core::{EventBus, Graph, OutputSchemaEntry, VariableType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::extractor::{last_segment, NestedVariableExtractor, RuntimeVariable};
use crate::value::Inspect;

/// Where an available variable comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableOrigin {
    /// Declared by the node type's output schema.
    Static,
    /// Observed in a node's actual output.
    Runtime,
}

/// A variable offered to a node for use in its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableVariable {
    pub source_id: String,
    pub source_label: String,
    pub source_type: String,
    pub path: String,
    pub full_path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    pub description: String,
    pub origin: VariableOrigin,
    /// Nesting level, runtime variables only.
    pub depth: Option<usize>,
    /// Schema example or runtime preview.
    pub preview: Value,
}

impl AvailableVariable {
    fn matches(&self, term: &str) -> bool {
        let term = term.to_lowercase();
        [&self.name, &self.source_label, &self.description, &self.full_path]
            .iter()
            .any(|field| field.to_lowercase().contains(&term))
    }
}

/// Static first, runtime by depth, then by address.
fn presentation_order(a: &AvailableVariable, b: &AvailableVariable) -> Ordering {
    let rank = |v: &AvailableVariable| match v.origin {
        VariableOrigin::Static => (0, 0),
        VariableOrigin::Runtime => (1, v.depth.unwrap_or(0)),
    };
    rank(a).cmp(&rank(b)).then_with(|| a.full_path.cmp(&b.full_path))
}

/// Static output schemas per node type and runtime variables per node id.
///
/// Shared between the node registry (which forwards schemas) and the engine
/// (which records outputs). Readers see either the old or the new runtime
/// list of a node, never a partial one.
pub struct VariableRegistry {
    extractor: NestedVariableExtractor,
    schemas: RwLock<HashMap<String, Vec<OutputSchemaEntry>>>,
    runtime: RwLock<HashMap<String, Arc<Vec<RuntimeVariable>>>>,
    event_bus: Option<Arc<EventBus>>,
}

impl Default for VariableRegistry {
    fn default() -> Self {
        Self::new(ExtractorConfig::default())
    }
}

impl std::fmt::Debug for VariableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableRegistry")
            .field("schemas", &self.schemas.read().unwrap_or_else(PoisonError::into_inner).len())
            .field("runtime", &self.runtime.read().unwrap_or_else(PoisonError::into_inner).len())
            .finish()
    }
}

impl VariableRegistry {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            extractor: NestedVariableExtractor::new(config),
            schemas: RwLock::new(HashMap::new()),
            runtime: RwLock::new(HashMap::new()),
            event_bus: None,
        }
    }

    /// Publish registration and invalidation events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn extractor(&self) -> &NestedVariableExtractor {
        &self.extractor
    }

    pub fn register_schema(&self, node_type: &str, entries: Vec<OutputSchemaEntry>) {
        self.schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_type.to_string(), entries);
    }

    pub fn remove_schema(&self, node_type: &str) -> bool {
        self.schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_type)
            .is_some()
    }

    pub fn schema(&self, node_type: &str) -> Vec<OutputSchemaEntry> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the runtime variables of `node_id` with those extracted from
    /// `output`. A primitive or null output clears them. Returns the count.
    pub fn register_runtime_variables<V: Inspect>(&self, node_id: &str, output: &V) -> usize {
        if !output.kind().is_composite() {
            self.invalidate_runtime_variables(node_id);
            return 0;
        }

        let variables = self.extractor.extract(output, node_id);
        let count = variables.len();
        self.runtime
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.to_string(), Arc::new(variables));

        debug!(node_id, count, "Registered runtime variables");
        if let Some(bus) = &self.event_bus {
            bus.emit(
                topics::VARIABLES_REGISTERED,
                json!({"node_id": node_id, "count": count}),
            );
        }
        count
    }

    pub fn get_runtime_variables(&self, node_id: &str) -> Vec<RuntimeVariable> {
        self.runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .map(|vars| vars.as_ref().clone())
            .unwrap_or_default()
    }

    pub fn invalidate_runtime_variables(&self, node_id: &str) -> bool {
        let removed = self
            .runtime
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id)
            .is_some();
        if removed {
            debug!(node_id, "Invalidated runtime variables");
            if let Some(bus) = &self.event_bus {
                bus.emit(topics::VARIABLES_INVALIDATED, json!({"node_id": node_id}));
            }
        }
        removed
    }

    pub fn clear_runtime_variables(&self) {
        self.runtime
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Drop runtime variables of nodes no longer in `graph`. Returns how many
    /// nodes were pruned.
    pub fn prune(&self, graph: &Graph) -> usize {
        let live: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        let stale: Vec<String> = self
            .runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        for id in &stale {
            self.invalidate_runtime_variables(id);
        }
        stale.len()
    }

    /// Every node that can reach `target` along edges, nearest first.
    /// `target` itself is excluded even when it sits on a cycle.
    pub fn upstream_nodes(&self, target: &str, graph: &Graph) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::from([target]);
        let mut queue: VecDeque<&str> = VecDeque::from([target]);
        let mut order = Vec::new();

        while let Some(current) = queue.pop_front() {
            for edge in graph.incoming(current) {
                if visited.insert(edge.source.as_str()) {
                    order.push(edge.source.clone());
                    queue.push_back(edge.source.as_str());
                }
            }
        }
        order
    }

    /// Static and runtime variables of every upstream node of `target`.
    ///
    /// Entries are unique by full address; a static declaration wins over a
    /// runtime observation of the same address.
    pub fn get_available_variables_for_node(
        &self,
        target: &str,
        graph: &Graph,
    ) -> Vec<AvailableVariable> {
        let schemas = self.schemas.read().unwrap_or_else(PoisonError::into_inner);
        let runtime = self.runtime.read().unwrap_or_else(PoisonError::into_inner);

        let mut seen = HashSet::new();
        let mut available = Vec::new();
        let mut observed = Vec::new();

        for source_id in self.upstream_nodes(target, graph) {
            let Some(node) = graph.node(&source_id) else {
                continue;
            };
            let label = node.label().to_string();

            for entry in schemas.get(&node.node_type).into_iter().flatten() {
                let path = parse_path(&entry.name)
                    .map(|segments| canonical_path(&segments))
                    .unwrap_or_else(|| entry.name.clone());
                let full_path = join_address(&source_id, &path);
                if !seen.insert(full_path.clone()) {
                    continue;
                }
                available.push(AvailableVariable {
                    source_id: source_id.clone(),
                    source_label: label.clone(),
                    source_type: node.node_type.clone(),
                    name: last_segment(&path).to_string(),
                    path,
                    full_path,
                    var_type: entry.value_type,
                    description: entry.description.clone(),
                    origin: VariableOrigin::Static,
                    depth: None,
                    preview: entry.example.clone(),
                });
            }

            for var in runtime.get(&source_id).into_iter().flat_map(|v| v.iter()) {
                observed.push(AvailableVariable {
                    source_id: source_id.clone(),
                    source_label: label.clone(),
                    source_type: node.node_type.clone(),
                    name: var.name().to_string(),
                    path: var.path.clone(),
                    full_path: var.full_path.clone(),
                    var_type: var.var_type,
                    description: format!("Runtime {} from {}", var.var_type, label),
                    origin: VariableOrigin::Runtime,
                    depth: Some(var.depth),
                    preview: var.preview.clone(),
                });
            }
        }

        for var in observed {
            if seen.insert(var.full_path.clone()) {
                available.push(var);
            }
        }

        available.sort_by(presentation_order);
        available
    }

    /// Available variables whose name, source label, description or address
    /// contains `term`, case-insensitively. An empty term matches everything.
    pub fn get_suggestions(&self, target: &str, graph: &Graph, term: &str) -> Vec<AvailableVariable> {
        let available = self.get_available_variables_for_node(target, graph);
        if term.trim().is_empty() {
            return available;
        }
        available.into_iter().filter(|v| v.matches(term.trim())).collect()
    }
}
