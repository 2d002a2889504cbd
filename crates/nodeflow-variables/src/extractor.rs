//! Flattens a node output into addressable runtime variables.
//!
//! Extraction is bounded on every axis: recursion depth, items per array,
//! keys per object, serialized size of a composite, and the total number of
//! variables produced. Containers already on the current path are skipped,
//! so self-referential values terminate.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use nodeflow_core::config::ExtractorConfig;
use nodeflow_core::path::{join_address, join_index, join_key};
use nodeflow_core::VariableType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::value::{ChildKey, Inspect, ValueKind};

/// Keys shown in an object preview before the ellipsis.
const PREVIEW_KEYS: usize = 3;

/// A variable discovered in a node's actual output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeVariable {
    /// Path relative to the source output, e.g. `user.tags[0]`.
    pub path: String,
    /// `sourceId.path`.
    pub full_path: String,
    pub source_id: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    pub preview: Value,
    pub value: Value,
    /// Nesting level; top-level properties are 0.
    pub depth: usize,
    pub extracted_at: DateTime<Utc>,
}

impl RuntimeVariable {
    /// Last key of the path (`name` for `user.name`, `[0]` for `tags[0]`).
    pub fn name(&self) -> &str {
        last_segment(&self.path)
    }
}

pub(crate) fn last_segment(path: &str) -> &str {
    let cut = path
        .char_indices()
        .rev()
        .find(|(_, c)| *c == '.' || *c == '[')
        .map(|(i, c)| if c == '.' { i + 1 } else { i });
    match cut {
        Some(i) => &path[i..],
        None => path,
    }
}

/// Why an extraction stopped short of the full value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    pub depth: bool,
    pub array_items: bool,
    pub object_keys: bool,
    pub oversized: bool,
    pub total: bool,
    pub cycles: bool,
}

impl Truncation {
    pub fn any(&self) -> bool {
        self.depth || self.array_items || self.object_keys || self.oversized || self.total || self.cycles
    }
}

/// Result of one extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub variables: Vec<RuntimeVariable>,
    pub truncation: Truncation,
}

#[derive(Debug, Clone, Default)]
pub struct NestedVariableExtractor {
    options: ExtractorConfig,
}

impl NestedVariableExtractor {
    pub fn new(options: ExtractorConfig) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExtractorConfig {
        &self.options
    }

    /// Flatten `value` into variables addressed under `source_id`.
    pub fn extract<V: Inspect>(&self, value: &V, source_id: &str) -> Vec<RuntimeVariable> {
        self.extract_with_report(value, source_id, "").variables
    }

    /// Flatten `value`, prefixing every path with `prefix`, and report which
    /// bounds were hit.
    pub fn extract_with_report<V: Inspect>(
        &self,
        value: &V,
        source_id: &str,
        prefix: &str,
    ) -> Extraction {
        let mut walk = Walk {
            options: &self.options,
            source_id,
            extracted_at: Utc::now(),
            visiting: HashSet::new(),
            variables: Vec::new(),
            truncation: Truncation::default(),
        };

        if value.kind().is_composite() {
            if let Some(id) = value.identity() {
                walk.visiting.insert(id);
            }
            walk.children(value, prefix, 0);
        }

        if walk.truncation.any() {
            debug!(
                source_id,
                count = walk.variables.len(),
                truncation = ?walk.truncation,
                "Runtime variable extraction truncated"
            );
        }

        Extraction {
            variables: walk.variables,
            truncation: walk.truncation,
        }
    }

    /// Display form of a value: strings cut at the preview length, arrays as
    /// `Array(n)`, objects as their first few keys.
    pub fn preview<V: Inspect>(&self, value: &V) -> Value {
        preview(value, self.options.max_preview_length)
    }
}

pub fn preview<V: Inspect>(value: &V, max_len: usize) -> Value {
    match value.kind() {
        ValueKind::String => match value.to_json() {
            Value::String(s) if s.chars().count() > max_len => {
                let cut: String = s.chars().take(max_len).collect();
                Value::String(format!("{}...", cut))
            }
            other => other,
        },
        ValueKind::Array => Value::String(format!("Array({})", value.child_count())),
        ValueKind::Object => {
            let keys = value.keys(PREVIEW_KEYS);
            let more = if value.child_count() > PREVIEW_KEYS { ", ..." } else { "" };
            Value::String(format!("{{{}{}}}", keys.join(", "), more))
        }
        ValueKind::Function => Value::String("[Function]".into()),
        ValueKind::Opaque => Value::String("[Opaque]".into()),
        _ => value.to_json(),
    }
}

fn variable_type(kind: ValueKind) -> VariableType {
    match kind {
        ValueKind::Null => VariableType::Null,
        ValueKind::Bool => VariableType::Boolean,
        ValueKind::Number => VariableType::Number,
        ValueKind::String => VariableType::String,
        ValueKind::Array => VariableType::Array,
        ValueKind::Object => VariableType::Object,
        ValueKind::Function | ValueKind::Opaque => VariableType::Any,
    }
}

struct Walk<'a> {
    options: &'a ExtractorConfig,
    source_id: &'a str,
    extracted_at: DateTime<Utc>,
    /// Containers on the current path.
    visiting: HashSet<usize>,
    variables: Vec<RuntimeVariable>,
    truncation: Truncation,
}

impl Walk<'_> {
    fn full(&mut self) -> bool {
        if self.variables.len() >= self.options.max_total_variables {
            self.truncation.total = true;
            true
        } else {
            false
        }
    }

    fn record(&mut self, path: String, var_type: VariableType, preview: Value, value: Value, depth: usize) {
        self.variables.push(RuntimeVariable {
            full_path: join_address(self.source_id, &path),
            path,
            source_id: self.source_id.to_string(),
            var_type,
            preview,
            value,
            depth,
            extracted_at: self.extracted_at,
        });
    }

    /// Record the children of a container whose own path is `path`.
    fn children<V: Inspect>(&mut self, value: &V, path: &str, depth: usize) {
        if depth > self.options.max_depth {
            self.truncation.depth = true;
            return;
        }

        let count = value.child_count();
        let limit = match value.kind() {
            ValueKind::Array => {
                if self.full() {
                    return;
                }
                self.record(
                    join_key(path, "length"),
                    VariableType::Number,
                    Value::from(count),
                    Value::from(count),
                    depth,
                );
                if count > self.options.max_array_items {
                    self.truncation.array_items = true;
                }
                self.options.max_array_items
            }
            ValueKind::Object => {
                if count > self.options.max_object_keys {
                    self.truncation.object_keys = true;
                }
                self.options.max_object_keys
            }
            _ => return,
        };

        value.visit_children(limit, &mut |key, child| {
            let child_path = match key {
                ChildKey::Key(k) => join_key(path, k),
                ChildKey::Index(i) => join_index(path, i),
            };
            self.child(child, child_path, depth)
        });
    }

    /// Record one child; false once no more variables may be produced.
    fn child<V: Inspect>(&mut self, child: &V, path: String, depth: usize) -> bool {
        if self.full() {
            return false;
        }

        let kind = child.kind();
        if kind.is_primitive() {
            let preview = preview(child, self.options.max_preview_length);
            self.record(path, variable_type(kind), preview, child.to_json(), depth);
        } else if kind.is_composite() {
            let id = child.identity();
            if id.is_some_and(|id| self.visiting.contains(&id)) {
                self.truncation.cycles = true;
                return true;
            }
            if child.exceeds_size(self.options.max_value_size) {
                self.truncation.oversized = true;
                return true;
            }

            let preview = preview(child, self.options.max_preview_length);
            self.record(path.clone(), variable_type(kind), preview, child.to_json(), depth);

            if let Some(id) = id {
                self.visiting.insert(id);
            }
            self.children(child, &path, depth + 1);
            if let Some(id) = id {
                self.visiting.remove(&id);
            }
        }
        // null, function and opaque values produce no variable

        !self.full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SharedValue;
    use serde_json::json;

    fn paths(vars: &[RuntimeVariable]) -> Vec<&str> {
        vars.iter().map(|v| v.path.as_str()).collect()
    }

    fn find<'a>(vars: &'a [RuntimeVariable], path: &str) -> &'a RuntimeVariable {
        vars.iter()
            .find(|v| v.path == path)
            .unwrap_or_else(|| panic!("missing {}", path))
    }

    #[test]
    fn flattens_nested_objects_and_arrays() {
        let extractor = NestedVariableExtractor::default();
        let vars = extractor.extract(&json!({"user": {"name": "Ann", "tags": ["a", "b"]}}), "A");

        assert_eq!(
            paths(&vars),
            vec!["user", "user.name", "user.tags", "user.tags.length", "user.tags[0]", "user.tags[1]"]
        );
        let name = find(&vars, "user.name");
        assert_eq!(name.full_path, "A.user.name");
        assert_eq!(name.var_type, VariableType::String);
        assert_eq!(name.depth, 1);
        assert_eq!(find(&vars, "user").depth, 0);
        assert_eq!(find(&vars, "user.tags.length").value, json!(2));
        assert_eq!(find(&vars, "user.tags[1]").depth, 2);
    }

    #[test]
    fn default_cap_keeps_short_arrays_whole() {
        let value = json!({"user": {"name": "Ann", "tags": ["a", "b", "c", "d"]}});
        let vars = NestedVariableExtractor::default().extract(&value, "A");

        assert_eq!(
            paths(&vars),
            vec![
                "user",
                "user.name",
                "user.tags",
                "user.tags.length",
                "user.tags[0]",
                "user.tags[1]",
                "user.tags[2]",
                "user.tags[3]",
            ]
        );
        assert_eq!(find(&vars, "user.name").value, json!("Ann"));
        assert_eq!(find(&vars, "user.tags.length").value, json!(4));

        let capped = NestedVariableExtractor::new(ExtractorConfig {
            max_array_items: 3,
            ..Default::default()
        })
        .extract(&value, "A");
        assert!(capped.iter().any(|v| v.path == "user.tags[2]"));
        assert!(!capped.iter().any(|v| v.path == "user.tags[3]"));
        assert_eq!(find(&capped, "user.tags.length").value, json!(4));
    }

    #[test]
    fn array_items_are_capped_but_length_is_kept() {
        let extractor = NestedVariableExtractor::new(ExtractorConfig {
            max_array_items: 3,
            ..Default::default()
        });
        let items: Vec<i32> = (0..20).collect();
        let report = extractor.extract_with_report(&json!({"tags": items}), "A", "");
        let vars = &report.variables;

        assert_eq!(find(vars, "tags.length").value, json!(20));
        assert!(vars.iter().any(|v| v.path == "tags[2]"));
        assert!(!vars.iter().any(|v| v.path == "tags[3]"));
        assert!(report.truncation.array_items);
    }

    #[test]
    fn depth_is_bounded() {
        let extractor = NestedVariableExtractor::new(ExtractorConfig {
            max_depth: 1,
            ..Default::default()
        });
        let vars = extractor.extract(&json!({"a": {"b": {"c": {"d": 1}}}}), "N");
        assert_eq!(paths(&vars), vec!["a", "a.b"]);
        assert!(vars.iter().all(|v| v.depth <= 1));
    }

    #[test]
    fn total_count_is_bounded() {
        let extractor = NestedVariableExtractor::new(ExtractorConfig {
            max_total_variables: 4,
            ..Default::default()
        });
        let value = json!({"a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 6});
        let report = extractor.extract_with_report(&value, "N", "");
        assert_eq!(report.variables.len(), 4);
        assert!(report.truncation.total);
    }

    #[test]
    fn object_keys_are_capped() {
        let extractor = NestedVariableExtractor::new(ExtractorConfig {
            max_object_keys: 2,
            ..Default::default()
        });
        let vars = extractor.extract(&json!({"a": 1, "b": 2, "c": 3}), "N");
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn oversized_composites_are_skipped() {
        let extractor = NestedVariableExtractor::new(ExtractorConfig {
            max_value_size: 64,
            ..Default::default()
        });
        let value = json!({"small": {"x": 1}, "big": {"text": "y".repeat(200)}});
        let report = extractor.extract_with_report(&value, "N", "");
        assert_eq!(paths(&report.variables), vec!["small", "small.x"]);
        assert!(report.truncation.oversized);
    }

    #[test]
    fn nulls_produce_no_variable() {
        let vars = NestedVariableExtractor::default().extract(&json!({"a": null, "b": 0}), "N");
        assert_eq!(paths(&vars), vec!["b"]);
    }

    #[test]
    fn non_identifier_keys_are_quoted() {
        let vars = NestedVariableExtractor::default()
            .extract(&json!({"headers": {"content-type": "text/plain"}}), "http-1");
        let header = find(&vars, r#"headers["content-type"]"#);
        assert_eq!(header.full_path, r#"http-1.headers["content-type"]"#);
        assert_eq!(header.name(), r#"["content-type"]"#);
    }

    #[test]
    fn root_arrays_use_index_paths() {
        let vars = NestedVariableExtractor::default().extract(&json!([{"id": 7}]), "list");
        assert_eq!(paths(&vars), vec!["length", "[0]", "[0].id"]);
        assert_eq!(find(&vars, "[0].id").full_path, "list[0].id");
    }

    #[test]
    fn prefix_is_applied() {
        let report = NestedVariableExtractor::default().extract_with_report(&json!({"x": 1}), "N", "body");
        assert_eq!(report.variables[0].path, "body.x");
        assert_eq!(report.variables[0].full_path, "N.body.x");
    }

    #[test]
    fn primitives_at_root_produce_nothing() {
        assert!(NestedVariableExtractor::default().extract(&json!("text"), "N").is_empty());
    }

    #[test]
    fn previews() {
        let vars = NestedVariableExtractor::default().extract(
            &json!({
                "long": "z".repeat(80),
                "list": [1, 2, 3],
                "obj": {"a": 1, "b": 2, "c": 3, "d": 4},
                "small": {"a": 1},
                "flag": true
            }),
            "N",
        );
        assert_eq!(find(&vars, "long").preview, json!(format!("{}...", "z".repeat(50))));
        assert_eq!(find(&vars, "long").value, json!("z".repeat(80)));
        assert_eq!(find(&vars, "list").preview, json!("Array(3)"));
        assert_eq!(find(&vars, "obj").preview, json!("{a, b, c, ...}"));
        assert_eq!(find(&vars, "small").preview, json!("{a}"));
        assert_eq!(find(&vars, "flag").preview, json!(true));
    }

    #[test]
    fn self_referential_values_terminate() {
        let root = SharedValue::object();
        root.insert("name", SharedValue::string("root"));
        root.insert("self", root.clone());
        let child = SharedValue::object();
        child.insert("parent", root.clone());
        child.insert("id", SharedValue::Number(1.0));
        root.insert("child", child);

        let report = NestedVariableExtractor::default().extract_with_report(&root, "N", "");
        assert_eq!(paths(&report.variables), vec!["name", "child", "child.id"]);
        assert!(report.truncation.cycles);
        assert_eq!(
            find(&report.variables, "child").value,
            json!({"parent": {"name": "root", "self": "[Circular]", "child": "[Circular]"}, "id": 1.0})
        );
    }

    #[test]
    fn cyclic_values_respect_the_total_cap() {
        let root = SharedValue::object();
        for i in 0..10 {
            root.insert(format!("f{}", i), SharedValue::Number(i as f64));
        }
        root.insert("self", root.clone());
        let ring = SharedValue::array();
        ring.push(root.clone());
        ring.push(ring.clone());
        root.insert("ring", ring);

        let extractor = NestedVariableExtractor::new(ExtractorConfig {
            max_total_variables: 5,
            ..Default::default()
        });
        let report = extractor.extract_with_report(&root, "N", "");
        assert_eq!(report.variables.len(), 5);
        assert!(report.truncation.total);

        let uncapped = NestedVariableExtractor::default().extract_with_report(&root, "N", "");
        assert!(uncapped.variables.len() <= ExtractorConfig::default().max_total_variables);
        assert!(uncapped.truncation.cycles);
        assert!(!uncapped.variables.iter().any(|v| v.path.starts_with("self")));
    }

    #[test]
    fn handles_are_skipped() {
        let root = SharedValue::object();
        root.insert("run", SharedValue::Function("run".into()));
        root.insert("conn", SharedValue::Opaque("Socket".into()));
        root.insert("ok", SharedValue::Bool(true));
        let vars = NestedVariableExtractor::default().extract(&root, "N");
        assert_eq!(paths(&vars), vec!["ok"]);
    }

    #[test]
    fn last_segment_of_paths() {
        assert_eq!(last_segment("user.name"), "name");
        assert_eq!(last_segment("tags[0]"), "[0]");
        assert_eq!(last_segment("top"), "top");
    }
}
