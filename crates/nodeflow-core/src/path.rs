//! Variable addresses: `sourceId.path` with dotted keys, indexed brackets
//! (`items[0]`) and quoted keys (`data["content-type"]`).

use std::borrow::Cow;

use serde_json::Value;

/// One step of a path inside a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed `{sourceId.path}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRef {
    pub source_id: String,
    /// Path relative to the source output, as written.
    pub path: String,
    pub segments: Vec<PathSegment>,
}

impl VariableRef {
    /// Full address, `sourceId.path`.
    pub fn address(&self) -> String {
        join_address(&self.source_id, &self.path)
    }
}

/// Whether `key` can be written as a bare dotted segment.
pub fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn is_source_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-'
}

/// Append an object key to a path.
pub fn join_key(parent: &str, key: &str) -> String {
    if is_identifier(key) {
        if parent.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", parent, key)
        }
    } else {
        let escaped = key.replace('\\', "\\\\").replace('"', "\\\"");
        format!("{}[\"{}\"]", parent, escaped)
    }
}

/// Append an array index to a path.
pub fn join_index(parent: &str, index: usize) -> String {
    format!("{}[{}]", parent, index)
}

/// Canonical text form of parsed segments (`a.b[0]["x y"]`).
pub fn canonical_path(segments: &[PathSegment]) -> String {
    segments.iter().fold(String::new(), |path, segment| match segment {
        PathSegment::Key(key) => join_key(&path, key),
        PathSegment::Index(index) => join_index(&path, *index),
    })
}

/// `sourceId` + `path` as a full address.
pub fn join_address(source_id: &str, path: &str) -> String {
    if path.is_empty() {
        source_id.to_string()
    } else if path.starts_with('[') {
        format!("{}{}", source_id, path)
    } else {
        format!("{}.{}", source_id, path)
    }
}

/// Parse a relative path (`a.b[0]["x y"]`). Returns `None` on malformed input.
pub fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let chars: Vec<char> = path.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if segments.is_empty() {
                    return None;
                }
                i += 1;
                let start = i;
                while i < chars.len() && is_key_char(chars[i]) {
                    i += 1;
                }
                if start == i {
                    return None;
                }
                segments.push(PathSegment::Key(chars[start..i].iter().collect()));
            }
            '[' => {
                i += 1;
                let quote = *chars.get(i)?;
                if quote == '"' || quote == '\'' {
                    i += 1;
                    let mut key = String::new();
                    loop {
                        let c = *chars.get(i)?;
                        i += 1;
                        if c == '\\' {
                            key.push(*chars.get(i)?);
                            i += 1;
                        } else if c == quote {
                            break;
                        } else {
                            key.push(c);
                        }
                    }
                    if chars.get(i) != Some(&']') {
                        return None;
                    }
                    i += 1;
                    segments.push(PathSegment::Key(key));
                } else {
                    let start = i;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                    if start == i || chars.get(i) != Some(&']') {
                        return None;
                    }
                    let index: String = chars[start..i].iter().collect();
                    i += 1;
                    segments.push(PathSegment::Index(index.parse().ok()?));
                }
            }
            c if segments.is_empty() && is_key_char(c) => {
                let start = i;
                while i < chars.len() && is_key_char(chars[i]) {
                    i += 1;
                }
                segments.push(PathSegment::Key(chars[start..i].iter().collect()));
            }
            _ => return None,
        }
    }

    Some(segments)
}

/// Parse a full address (`sourceId.path`). The path must be non-empty.
pub fn parse_reference(address: &str) -> Option<VariableRef> {
    let split = address.find(|c: char| !is_source_char(c))?;
    let (source_id, rest) = address.split_at(split);
    if source_id.is_empty() {
        return None;
    }
    let path = rest.strip_prefix('.').unwrap_or(rest);
    if path.is_empty() || (rest.starts_with('.') && path.starts_with('[')) {
        return None;
    }
    let segments = parse_path(path)?;
    Some(VariableRef {
        source_id: source_id.to_string(),
        path: path.to_string(),
        segments,
    })
}

/// Walk `segments` into `value`. `length` on arrays and strings is computed.
pub fn resolve<'a>(value: &'a Value, segments: &[PathSegment]) -> Option<Cow<'a, Value>> {
    let mut current = value;
    for (i, segment) in segments.iter().enumerate() {
        let next = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key),
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index),
            (PathSegment::Key(key), Value::Array(items)) if key == "length" => {
                return tail_is_empty(segments, i).then(|| Cow::Owned(Value::from(items.len())));
            }
            (PathSegment::Key(key), Value::String(s)) if key == "length" => {
                return tail_is_empty(segments, i)
                    .then(|| Cow::Owned(Value::from(s.chars().count())));
            }
            (PathSegment::Key(key), Value::Array(items)) => {
                key.parse::<usize>().ok().and_then(|idx| items.get(idx))
            }
            _ => None,
        };
        current = next?;
    }
    Some(Cow::Borrowed(current))
}

fn tail_is_empty(segments: &[PathSegment], i: usize) -> bool {
    i + 1 == segments.len()
}
