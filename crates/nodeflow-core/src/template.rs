use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::path::{parse_reference, VariableRef};

/// Matches `{sourceId.path}` references with dotted keys, numeric indices
/// and quoted keys.
pub fn reference_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"\{([A-Za-z0-9_-]+(?:\.[A-Za-z0-9_$-]+|\[\d+\]|\["(?:[^"\\]|\\.)*"\]|\['(?:[^'\\]|\\.)*'\])+)\}"#,
        )
        .expect("reference pattern is valid")
    })
}

/// Every parsable reference in `text`, in order of appearance.
pub fn find_references(text: &str) -> Vec<VariableRef> {
    reference_regex()
        .captures_iter(text)
        .filter_map(|caps| parse_reference(&caps[1]))
        .collect()
}

/// Text form of a resolved value: strings raw, everything else as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace each `{...}` reference with its resolved value. References that
/// `resolve` cannot satisfy are left in place verbatim.
pub fn substitute<F>(text: &str, resolve: F) -> String
where
    F: Fn(&VariableRef) -> Option<Value>,
{
    reference_regex()
        .replace_all(text, |caps: &Captures| {
            parse_reference(&caps[1])
                .and_then(|reference| resolve(&reference))
                .map(|value| stringify(&value))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::resolve;
    use serde_json::json;
    use std::collections::HashMap;

    fn outputs() -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("A".to_string(), json!({"out": 5, "meta": {"ok": true}}));
        map.insert(
            "http-1".to_string(),
            json!({"headers": {"content-type": "text/plain"}, "items": ["x", "y"]}),
        );
        map
    }

    fn render(text: &str) -> String {
        let outputs = outputs();
        substitute(text, |r| {
            outputs
                .get(&r.source_id)
                .and_then(|v| resolve(v, &r.segments))
                .map(|v| v.into_owned())
        })
    }

    #[test]
    fn substitutes_known_references() {
        assert_eq!(render("{A.out} items"), "5 items");
        assert_eq!(render("ok={A.meta.ok}"), "ok=true");
        assert_eq!(render("{A.meta}"), r#"{"ok":true}"#);
        assert_eq!(render(r#"{http-1.headers["content-type"]}"#), "text/plain");
        assert_eq!(render("{http-1.items[1]}/{http-1.items.length}"), "y/2");
    }

    #[test]
    fn unknown_references_are_left_verbatim() {
        assert_eq!(render("{Z.missing}"), "{Z.missing}");
        assert_eq!(render("{A.nope} and {A.out}"), "{A.nope} and 5");
    }

    #[test]
    fn non_reference_braces_are_ignored() {
        assert_eq!(render(r#"{"json": 1}"#), r#"{"json": 1}"#);
        assert_eq!(render("{lonely}"), "{lonely}");
        assert_eq!(render("{ A.out }"), "{ A.out }");
    }

    #[test]
    fn find_references_in_order() {
        let refs = find_references("{b.x} then {a['k y']} then {c[0].z}");
        let addresses: Vec<String> = refs.iter().map(|r| r.address()).collect();
        assert_eq!(addresses, vec!["b.x", "a['k y']", "c[0].z"]);
    }
}
