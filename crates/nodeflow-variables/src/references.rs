//! `{sourceId.path}` references inside node configuration text.

use std::collections::HashSet;

use nodeflow_core::path::{canonical_path, join_address, VariableRef};
use nodeflow_core::template::find_references;
use nodeflow_core::VariableType;
use serde::Serialize;

use crate::registry::AvailableVariable;

/// Outcome of checking one reference against the available variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceCheck {
    /// Full address as written, without braces.
    pub reference: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Every reference in `text`, in order of appearance.
pub fn parse_references(text: &str) -> Vec<VariableRef> {
    find_references(text)
}

fn canonical_address(reference: &VariableRef) -> String {
    join_address(&reference.source_id, &canonical_path(&reference.segments))
}

/// Check each reference in `text` against `available`.
///
/// A reference is valid when its address is available, or when it points
/// inside an available object or array whose children were not extracted.
pub fn validate_references(text: &str, available: &[AvailableVariable]) -> Vec<ReferenceCheck> {
    let sources: HashSet<&str> = available.iter().map(|v| v.source_id.as_str()).collect();
    let addresses: HashSet<&str> = available.iter().map(|v| v.full_path.as_str()).collect();
    let containers: Vec<&str> = available
        .iter()
        .filter(|v| matches!(v.var_type, VariableType::Object | VariableType::Array | VariableType::Any))
        .map(|v| v.full_path.as_str())
        .collect();

    parse_references(text)
        .into_iter()
        .map(|reference| {
            let written = reference.address();
            let address = canonical_address(&reference);

            let reason = if !sources.contains(reference.source_id.as_str()) {
                Some(format!(
                    "Unknown source node '{}': it is not upstream of this node",
                    reference.source_id
                ))
            } else if addresses.contains(address.as_str())
                || containers.iter().any(|c| is_inside(&address, c))
            {
                None
            } else {
                Some(format!(
                    "'{}' has not been produced by '{}'",
                    written, reference.source_id
                ))
            };

            ReferenceCheck {
                reference: written,
                valid: reason.is_none(),
                reason,
            }
        })
        .collect()
}

fn is_inside(address: &str, container: &str) -> bool {
    address.len() > container.len()
        && address.starts_with(container)
        && matches!(address.as_bytes()[container.len()], b'.' | b'[')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::VariableOrigin;
    use serde_json::Value;

    fn var(full_path: &str, var_type: VariableType) -> AvailableVariable {
        let (source_id, path) = full_path.split_once('.').unwrap();
        AvailableVariable {
            source_id: source_id.into(),
            source_label: source_id.into(),
            source_type: "t".into(),
            path: path.into(),
            full_path: full_path.into(),
            name: path.into(),
            var_type,
            description: String::new(),
            origin: VariableOrigin::Runtime,
            depth: Some(0),
            preview: Value::Null,
        }
    }

    #[test]
    fn parses_references_in_order() {
        let refs = parse_references("Hello {user.name}, total {order.items[0]['price']}");
        let addresses: Vec<String> = refs.iter().map(|r| r.address()).collect();
        assert_eq!(addresses, vec!["user.name", "order.items[0]['price']"]);
    }

    #[test]
    fn classifies_valid_and_invalid() {
        let available = vec![
            var("A.out", VariableType::Number),
            var("A.body", VariableType::Object),
        ];
        let checks = validate_references(
            "{A.out} {A['out']} {A.body.deep.x} {A.nope} {Z.x}",
            &available,
        );

        assert!(checks[0].valid);
        assert!(checks[1].valid);
        assert!(checks[2].valid);
        assert!(!checks[3].valid);
        assert!(checks[3].reason.as_deref().unwrap().contains("has not been produced"));
        assert!(!checks[4].valid);
        assert!(checks[4].reason.as_deref().unwrap().contains("Unknown source node 'Z'"));
    }

    #[test]
    fn prefix_must_end_at_a_segment_boundary() {
        let available = vec![var("A.body", VariableType::Object)];
        let checks = validate_references("{A.bodyguard}", &available);
        assert!(!checks[0].valid);
    }
}
