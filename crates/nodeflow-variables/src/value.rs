//! Read-only view over values the extractor can flatten.
//!
//! `serde_json::Value` is an owned tree and cannot contain cycles.
//! `SharedValue` models outputs built from reference-counted containers,
//! which may refer back to themselves and may hold function or opaque
//! handles that have no serialized form.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Number, Value};

/// What kind of value a node is, as far as extraction cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Function,
    Opaque,
}

impl ValueKind {
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Array | Self::Object)
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, Self::Bool | Self::Number | Self::String)
    }
}

/// Key of a child inside a container.
#[derive(Debug, Clone, Copy)]
pub enum ChildKey<'a> {
    Key(&'a str),
    Index(usize),
}

pub trait Inspect {
    fn kind(&self) -> ValueKind;

    /// Stable address of a container, for cycle detection. `None` for leaves.
    fn identity(&self) -> Option<usize>;

    /// Number of array items or object properties.
    fn child_count(&self) -> usize;

    /// Visit up to `limit` children in order. Stops early when `visit`
    /// returns false.
    fn visit_children(&self, limit: usize, visit: &mut dyn FnMut(ChildKey<'_>, &Self) -> bool);

    /// Up to `limit` property names of an object.
    fn keys(&self, limit: usize) -> Vec<String>;

    /// JSON form. Function and opaque values become null; a container met
    /// again inside itself becomes the string `"[Circular]"`.
    fn to_json(&self) -> Value;

    /// Whether the JSON form is larger than `limit` bytes.
    fn exceeds_size(&self, limit: usize) -> bool {
        json_exceeds(&self.to_json(), limit)
    }
}

/// Byte counter that fails once past its limit, so serialization of a huge
/// value stops early.
struct SizeLimit {
    written: usize,
    limit: usize,
}

impl io::Write for SizeLimit {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len();
        if self.written > self.limit {
            Err(io::Error::new(io::ErrorKind::Other, "size limit exceeded"))
        } else {
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn json_exceeds(value: &Value, limit: usize) -> bool {
    let mut counter = SizeLimit { written: 0, limit };
    serde_json::to_writer(&mut counter, value).is_err()
}

impl Inspect for Value {
    fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    fn identity(&self) -> Option<usize> {
        match self {
            Value::Array(_) | Value::Object(_) => Some(self as *const Value as usize),
            _ => None,
        }
    }

    fn child_count(&self) -> usize {
        match self {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            _ => 0,
        }
    }

    fn visit_children(&self, limit: usize, visit: &mut dyn FnMut(ChildKey<'_>, &Self) -> bool) {
        match self {
            Value::Array(items) => {
                for (i, item) in items.iter().take(limit).enumerate() {
                    if !visit(ChildKey::Index(i), item) {
                        break;
                    }
                }
            }
            Value::Object(map) => {
                for (key, item) in map.iter().take(limit) {
                    if !visit(ChildKey::Key(key), item) {
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    fn keys(&self, limit: usize) -> Vec<String> {
        match self {
            Value::Object(map) => map.keys().take(limit).cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn to_json(&self) -> Value {
        self.clone()
    }

    fn exceeds_size(&self, limit: usize) -> bool {
        json_exceeds(self, limit)
    }
}

type SharedItems = Arc<RwLock<Vec<SharedValue>>>;
type SharedFields = Arc<RwLock<Vec<(String, SharedValue)>>>;

/// A value whose containers are shared and mutable, so it can be
/// self-referential.
#[derive(Clone)]
pub enum SharedValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(SharedItems),
    Object(SharedFields),
    /// A callable handle, identified by name.
    Function(String),
    /// A handle with no serialized form, identified by type name.
    Opaque(String),
}

impl SharedValue {
    pub fn object() -> Self {
        Self::Object(Arc::new(RwLock::new(Vec::new())))
    }

    pub fn array() -> Self {
        Self::Array(Arc::new(RwLock::new(Vec::new())))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Set a property, replacing an existing one. False if not an object.
    pub fn insert(&self, key: impl Into<String>, value: SharedValue) -> bool {
        let Self::Object(fields) = self else {
            return false;
        };
        let key = key.into();
        let mut fields = fields.write().unwrap_or_else(PoisonError::into_inner);
        match fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => fields.push((key, value)),
        }
        true
    }

    /// Append an item. False if not an array.
    pub fn push(&self, value: SharedValue) -> bool {
        let Self::Array(items) = self else {
            return false;
        };
        items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
        true
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => {
                let array = Self::array();
                for item in items {
                    array.push(Self::from_json(item));
                }
                array
            }
            Value::Object(map) => {
                let object = Self::object();
                for (key, item) in map {
                    object.insert(key.clone(), Self::from_json(item));
                }
                object
            }
        }
    }

    /// Children cloned out of the lock so no guard is held while recursing.
    fn children(&self, limit: usize) -> Vec<(Option<String>, SharedValue)> {
        match self {
            Self::Array(items) => items
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .take(limit)
                .map(|v| (None, v.clone()))
                .collect(),
            Self::Object(fields) => fields
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .take(limit)
                .map(|(k, v)| (Some(k.clone()), v.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn to_json_guarded(&self, visiting: &mut HashSet<usize>) -> Value {
        match self {
            Self::Null | Self::Function(_) | Self::Opaque(_) => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
            Self::String(s) => Value::String(s.clone()),
            Self::Array(_) | Self::Object(_) => {
                let Some(id) = self.identity() else {
                    return Value::Null;
                };
                if !visiting.insert(id) {
                    return Value::String("[Circular]".to_string());
                }
                let children = self.children(usize::MAX);
                let json = if matches!(self, Self::Array(_)) {
                    Value::Array(
                        children
                            .iter()
                            .map(|(_, v)| v.to_json_guarded(visiting))
                            .collect(),
                    )
                } else {
                    let mut map = Map::new();
                    for (key, v) in &children {
                        if let Some(key) = key {
                            map.insert(key.clone(), v.to_json_guarded(visiting));
                        }
                    }
                    Value::Object(map)
                };
                visiting.remove(&id);
                json
            }
        }
    }
}

impl std::fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({})", b),
            Self::Number(n) => write!(f, "Number({})", n),
            Self::String(s) => write!(f, "String({:?})", s),
            Self::Array(_) => write!(f, "Array(len={})", self.child_count()),
            Self::Object(_) => write!(f, "Object(len={})", self.child_count()),
            Self::Function(name) => write!(f, "Function({})", name),
            Self::Opaque(name) => write!(f, "Opaque({})", name),
        }
    }
}

impl Inspect for SharedValue {
    fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::String(_) => ValueKind::String,
            Self::Array(_) => ValueKind::Array,
            Self::Object(_) => ValueKind::Object,
            Self::Function(_) => ValueKind::Function,
            Self::Opaque(_) => ValueKind::Opaque,
        }
    }

    fn identity(&self) -> Option<usize> {
        match self {
            Self::Array(items) => Some(Arc::as_ptr(items) as *const () as usize),
            Self::Object(fields) => Some(Arc::as_ptr(fields) as *const () as usize),
            _ => None,
        }
    }

    fn child_count(&self) -> usize {
        match self {
            Self::Array(items) => items.read().unwrap_or_else(PoisonError::into_inner).len(),
            Self::Object(fields) => fields.read().unwrap_or_else(PoisonError::into_inner).len(),
            _ => 0,
        }
    }

    fn visit_children(&self, limit: usize, visit: &mut dyn FnMut(ChildKey<'_>, &Self) -> bool) {
        for (i, (key, child)) in self.children(limit).iter().enumerate() {
            let key = match key {
                Some(k) => ChildKey::Key(k),
                None => ChildKey::Index(i),
            };
            if !visit(key, child) {
                break;
            }
        }
    }

    fn keys(&self, limit: usize) -> Vec<String> {
        self.children(limit)
            .into_iter()
            .filter_map(|(key, _)| key)
            .collect()
    }

    fn to_json(&self) -> Value {
        self.to_json_guarded(&mut HashSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn size_limit_stops_early() {
        let value = json!({"text": "x".repeat(100)});
        assert!(json_exceeds(&value, 50));
        assert!(!json_exceeds(&value, 500));
    }

    #[test]
    fn shared_value_round_trips_plain_json() {
        let original = json!({"a": [1, 2, {"b": "c"}], "d": null, "e": true});
        let shared = SharedValue::from_json(&original);
        assert_eq!(shared.to_json(), json!({"a": [1.0, 2.0, {"b": "c"}], "d": null, "e": true}));
        assert_eq!(shared.child_count(), 3);
        assert_eq!(shared.keys(2), vec!["a", "d"]);
    }

    #[test]
    fn self_reference_serializes_as_circular_marker() {
        let node = SharedValue::object();
        node.insert("name", SharedValue::string("loop"));
        node.insert("me", node.clone());

        assert_eq!(node.to_json(), json!({"name": "loop", "me": "[Circular]"}));
        assert!(!node.exceeds_size(1024));
    }

    #[test]
    fn handles_serialize_as_null() {
        let node = SharedValue::object();
        node.insert("callback", SharedValue::Function("onDone".into()));
        node.insert("socket", SharedValue::Opaque("TcpStream".into()));
        assert_eq!(node.to_json(), json!({"callback": null, "socket": null}));
        assert_eq!(node.kind(), ValueKind::Object);
    }

    #[test]
    fn identity_is_shared_across_clones() {
        let a = SharedValue::array();
        let b = a.clone();
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), SharedValue::array().identity());
    }

    #[test]
    fn insert_replaces_existing_key() {
        let node = SharedValue::object();
        node.insert("k", SharedValue::Number(1.0));
        node.insert("k", SharedValue::Number(2.0));
        assert_eq!(node.to_json(), json!({"k": 2.0}));
        assert!(!SharedValue::Null.insert("k", SharedValue::Null));
    }
}
