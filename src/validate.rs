use serde_json::Value;

use nodeflow_core::types::node_types;
use nodeflow_core::Graph;
use nodeflow_nodes::NodeRegistry;
use nodeflow_variables::validate_references;

/// Alias for the node's own input; resolved at run time, never upstream.
const INPUT_ALIAS: &str = "input";

#[derive(Debug)]
struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn pass(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(label: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Print a report of every check and return the number of failures.
pub fn run_validate(graph: &Graph, registry: &NodeRegistry) -> usize {
    let checks = graph_checks(graph, registry);

    let mut ok_count = 0;
    let mut fail_count = 0;
    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

fn graph_checks(graph: &Graph, registry: &NodeRegistry) -> Vec<CheckResult> {
    let mut checks = Vec::new();
    checks.extend(check_structure(graph));
    checks.extend(check_node_types(graph, registry));
    checks.extend(check_node_data(graph, registry));
    checks.extend(check_ports(graph, registry));
    checks.extend(check_references(graph, registry));
    checks
}

fn check_structure(graph: &Graph) -> Vec<CheckResult> {
    let problems = graph.validate(node_types::TRIGGER);
    if problems.is_empty() {
        return vec![CheckResult::pass(
            "Structure",
            format!("{} nodes, {} edges", graph.nodes.len(), graph.edges.len()),
        )];
    }
    problems
        .into_iter()
        .map(|p| CheckResult::fail("Structure", p))
        .collect()
}

fn check_node_types(graph: &Graph, registry: &NodeRegistry) -> Vec<CheckResult> {
    let unknown: Vec<String> = graph
        .nodes
        .iter()
        .filter(|n| registry.get(&n.node_type).is_none())
        .map(|n| format!("{} ({})", n.id, n.node_type))
        .collect();

    if unknown.is_empty() {
        vec![CheckResult::pass("Node types", "All registered")]
    } else {
        vec![CheckResult::fail(
            "Node types",
            format!("No plugin for: {}", unknown.join(", ")),
        )]
    }
}

fn check_node_data(graph: &Graph, registry: &NodeRegistry) -> Vec<CheckResult> {
    let mut checks = Vec::new();
    for node in &graph.nodes {
        let Some(plugin) = registry.get(&node.node_type) else {
            continue;
        };
        for error in plugin.validate_data(&node.data) {
            checks.push(CheckResult::fail(format!("Node {}", node.id), error));
        }
    }
    if checks.is_empty() {
        checks.push(CheckResult::pass("Node data", "Valid"));
    }
    checks
}

/// Edges into nodes without inputs or out of nodes without outputs.
fn check_ports(graph: &Graph, registry: &NodeRegistry) -> Vec<CheckResult> {
    let mut checks = Vec::new();
    for node in &graph.nodes {
        let Some(plugin) = registry.get(&node.node_type) else {
            continue;
        };
        let ports = plugin.ports();
        if ports.inputs == 0 && graph.incoming(&node.id).next().is_some() {
            checks.push(CheckResult::fail(
                format!("Node {}", node.id),
                format!("{} nodes take no incoming edges", node.node_type),
            ));
        }
        if ports.outputs == 0 && graph.outgoing(&node.id).next().is_some() {
            checks.push(CheckResult::fail(
                format!("Node {}", node.id),
                format!("{} nodes have no outputs", node.node_type),
            ));
        }
    }
    if checks.is_empty() {
        checks.push(CheckResult::pass("Ports", "Edges match node ports"));
    }
    checks
}

fn check_references(graph: &Graph, registry: &NodeRegistry) -> Vec<CheckResult> {
    let variables = registry.variables();
    let mut checks = Vec::new();
    let mut total = 0;

    for node in &graph.nodes {
        let mut texts = Vec::new();
        collect_strings(&node.data, &mut texts);
        if texts.is_empty() {
            continue;
        }
        let available = variables.get_available_variables_for_node(&node.id, graph);
        for text in texts {
            for check in validate_references(text, &available) {
                if source_of(&check.reference) == INPUT_ALIAS {
                    continue;
                }
                total += 1;
                if !check.valid {
                    checks.push(CheckResult::fail(
                        format!("Node {}", node.id),
                        format!(
                            "{{{}}}: {}",
                            check.reference,
                            check.reason.unwrap_or_default()
                        ),
                    ));
                }
            }
        }
    }

    if checks.is_empty() {
        checks.push(CheckResult::pass(
            "References",
            format!("{} reference(s) resolve", total),
        ));
    }
    checks
}

fn source_of(reference: &str) -> &str {
    reference
        .split(['.', '['])
        .next()
        .unwrap_or(reference)
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::AppConfig;
    use nodeflow_test_utils::GraphBuilder;
    use nodeflow_variables::VariableRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> NodeRegistry {
        let config = AppConfig::default();
        let variables = Arc::new(VariableRegistry::new(config.extractor.clone()));
        NodeRegistry::with_builtins(&config, variables, None).unwrap()
    }

    fn failures(checks: &[CheckResult]) -> Vec<String> {
        checks
            .iter()
            .filter(|c| !c.ok)
            .map(|c| format!("{}: {}", c.label, c.detail))
            .collect()
    }

    #[test]
    fn clean_graph_passes() {
        let graph = GraphBuilder::new()
            .node("start", "trigger")
            .node_with(
                "fmt",
                "transform",
                json!({"operation": "format", "template": "Run {start._trigger.execution_id} got {input.name}"}),
            )
            .node("done", "end")
            .chain(&["start", "fmt", "done"])
            .build();

        let checks = graph_checks(&graph, &registry());
        assert!(failures(&checks).is_empty(), "{:?}", failures(&checks));
    }

    #[test]
    fn reports_every_kind_of_problem() {
        let graph = GraphBuilder::new()
            .node("start", "trigger")
            .node_with("check", "condition", json!({"expression": ""}))
            .node_with(
                "fmt",
                "transform",
                json!({"operation": "format", "template": "{later.result}"}),
            )
            .node("later", "transform")
            .node("mystery", "teleport")
            .node("done", "end")
            .chain(&["start", "check", "fmt", "done", "later"])
            .build();

        let problems = failures(&graph_checks(&graph, &registry()));
        assert!(problems.iter().any(|p| p.contains("No plugin for: mystery (teleport)")));
        assert!(problems.iter().any(|p| p.contains("Node check: expression is required")));
        assert!(problems.iter().any(|p| p.contains("end nodes have no outputs")));
        assert!(problems.iter().any(|p| p.contains("{later.result}")));
    }

    #[test]
    fn missing_trigger_is_structural() {
        let graph = GraphBuilder::new().node("done", "end").build();
        let problems = failures(&graph_checks(&graph, &registry()));
        assert!(problems.contains(&"Structure: No trigger node found".to_string()));
    }

    #[test]
    fn input_alias_is_not_an_upstream_source() {
        assert_eq!(source_of("input.items[0]"), "input");
        assert_eq!(source_of("input"), "input");
        assert_eq!(source_of("fetch.body"), "fetch");
    }
}
