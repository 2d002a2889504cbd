use serde_json::Value;

use nodeflow_core::traits::is_truthy;
use nodeflow_core::types::node_types;
use nodeflow_core::{FlowError, Graph, GraphEdge, GraphNode, Result};
use nodeflow_nodes::builtin::loop_node::{CONTINUE_ROUTE, DONE_ROUTE};
use nodeflow_nodes::builtin::switch::DEFAULT_ROUTE;

/// Where the run goes after a node has produced its output.
#[derive(Debug)]
pub enum Route<'g> {
    /// Follow this edge.
    Next(&'g GraphEdge),
    /// The node has no outgoing edge to follow.
    Stop,
    /// The node chose a port that nothing is connected to.
    Unconnected { port: String },
}

/// Pick the edge to follow from `node` given its output.
///
/// - condition: the `true` or `false` port, by the truthiness of `result`
/// - switch: the port named by `route`, or one named after the case label,
///   or the `default` port when the node declares one; otherwise a
///   branching error
/// - loop: `continue` when items were processed, `done` otherwise
/// - anything else: the first outgoing edge
pub fn next_route<'g>(graph: &'g Graph, node: &GraphNode, output: &Value) -> Result<Route<'g>> {
    match node.node_type.as_str() {
        node_types::CONDITION => {
            let port = if output.get("result").is_some_and(is_truthy) {
                "true"
            } else {
                "false"
            };
            Ok(port_route(graph, &node.id, port))
        }
        node_types::SWITCH => {
            let route = output
                .get("route")
                .and_then(Value::as_str)
                .ok_or_else(|| FlowError::Branching {
                    node_id: node.id.clone(),
                    message: "switch output has no route".into(),
                })?;
            if let Some(edge) = edge_on_port(graph, &node.id, route) {
                return Ok(Route::Next(edge));
            }
            if let Some(label) = output.get("label").and_then(Value::as_str) {
                if let Some(edge) = edge_on_port(graph, &node.id, label) {
                    return Ok(Route::Next(edge));
                }
            }
            let has_default = node.data.get("has_default").is_some_and(is_truthy);
            if has_default && route != DEFAULT_ROUTE {
                if let Some(edge) = edge_on_port(graph, &node.id, DEFAULT_ROUTE) {
                    return Ok(Route::Next(edge));
                }
            }
            Err(FlowError::Branching {
                node_id: node.id.clone(),
                message: format!("no edge is connected to the '{}' port", route),
            })
        }
        node_types::LOOP => {
            let processed = output.get("processed").and_then(Value::as_u64).unwrap_or(0);
            let port = if processed > 0 { CONTINUE_ROUTE } else { DONE_ROUTE };
            Ok(port_route(graph, &node.id, port))
        }
        _ => Ok(graph
            .outgoing(&node.id)
            .next()
            .map_or(Route::Stop, Route::Next)),
    }
}

fn edge_on_port<'g>(graph: &'g Graph, node_id: &str, port: &str) -> Option<&'g GraphEdge> {
    graph
        .outgoing(node_id)
        .find(|e| e.source_handle.as_deref() == Some(port))
}

fn port_route<'g>(graph: &'g Graph, node_id: &str, port: &str) -> Route<'g> {
    match edge_on_port(graph, node_id, port) {
        Some(edge) => Route::Next(edge),
        None => Route::Unconnected { port: port.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_test_utils::GraphBuilder;
    use serde_json::json;

    fn target(route: Route<'_>) -> Option<String> {
        match route {
            Route::Next(edge) => Some(edge.target.clone()),
            _ => None,
        }
    }

    #[test]
    fn condition_follows_named_ports() {
        let graph = GraphBuilder::new()
            .node("c", "condition")
            .node("yes", "end")
            .node("no", "end")
            .port("c", "false", "no")
            .port("c", "true", "yes")
            .build();
        let c = graph.node("c").unwrap();

        let yes = next_route(&graph, c, &json!({"result": true})).unwrap();
        assert_eq!(target(yes).as_deref(), Some("yes"));
        let no = next_route(&graph, c, &json!({"result": false})).unwrap();
        assert_eq!(target(no).as_deref(), Some("no"));
    }

    #[test]
    fn condition_never_falls_through_to_another_port() {
        let graph = GraphBuilder::new()
            .node("c", "condition")
            .node("yes", "end")
            .node("any", "end")
            .port("c", "true", "yes")
            .edge("c", "any")
            .build();
        let route = next_route(&graph, graph.node("c").unwrap(), &json!({"result": false})).unwrap();
        assert!(matches!(route, Route::Unconnected { ref port } if port == "false"));
    }

    #[test]
    fn switch_matches_route_then_label() {
        let graph = GraphBuilder::new()
            .node("s", "switch")
            .node("a", "end")
            .node("b", "end")
            .node("d", "end")
            .port("s", "case-0", "a")
            .port("s", "paid", "b")
            .port("s", "default", "d")
            .build();
        let s = graph.node("s").unwrap();

        let r = next_route(&graph, s, &json!({"route": "case-0"})).unwrap();
        assert_eq!(target(r).as_deref(), Some("a"));
        let r = next_route(&graph, s, &json!({"route": "case-1", "label": "paid"})).unwrap();
        assert_eq!(target(r).as_deref(), Some("b"));
        let r = next_route(&graph, s, &json!({"route": "default"})).unwrap();
        assert_eq!(target(r).as_deref(), Some("d"));
    }

    #[test]
    fn switch_without_matching_port_is_a_branching_error() {
        let graph = GraphBuilder::new()
            .node("s", "switch")
            .node("a", "end")
            .port("s", "case-0", "a")
            .build();
        let err = next_route(&graph, graph.node("s").unwrap(), &json!({"route": "case-3"})).unwrap_err();
        assert!(matches!(err, FlowError::Branching { .. }));
    }

    #[test]
    fn switch_falls_back_to_the_default_port() {
        let graph = GraphBuilder::new()
            .node_with("s", "switch", json!({"has_default": true}))
            .node("fallback", "end")
            .port("s", "default", "fallback")
            .build();
        let s = graph.node("s").unwrap();

        let r = next_route(&graph, s, &json!({"route": "case-0", "matched_case": 0})).unwrap();
        assert_eq!(target(r).as_deref(), Some("fallback"));
    }

    #[test]
    fn switch_without_default_does_not_fall_back() {
        let graph = GraphBuilder::new()
            .node_with("s", "switch", json!({"has_default": false}))
            .node("fallback", "end")
            .port("s", "default", "fallback")
            .build();
        let err = next_route(&graph, graph.node("s").unwrap(), &json!({"route": "case-0"})).unwrap_err();
        assert!(matches!(err, FlowError::Branching { .. }));
    }

    #[test]
    fn routes_outlive_the_node_borrow() {
        let graph = GraphBuilder::new()
            .node("t", "transform")
            .node("a", "end")
            .edge("t", "a")
            .build();
        let route = {
            let node = graph.node("t").unwrap().clone();
            next_route(&graph, &node, &json!({})).unwrap()
        };
        assert_eq!(target(route).as_deref(), Some("a"));
    }

    #[test]
    fn loop_continues_while_items_were_processed() {
        let graph = GraphBuilder::new()
            .node("l", "loop")
            .node("body", "transform")
            .node("after", "end")
            .port("l", "continue", "body")
            .port("l", "done", "after")
            .build();
        let l = graph.node("l").unwrap();

        let r = next_route(&graph, l, &json!({"processed": 3})).unwrap();
        assert_eq!(target(r).as_deref(), Some("body"));
        let r = next_route(&graph, l, &json!({"processed": 0})).unwrap();
        assert_eq!(target(r).as_deref(), Some("after"));
    }

    #[test]
    fn other_nodes_take_the_first_edge() {
        let graph = GraphBuilder::new()
            .node("t", "transform")
            .node("a", "end")
            .node("b", "end")
            .edge("t", "a")
            .edge("t", "b")
            .build();
        let r = next_route(&graph, graph.node("t").unwrap(), &json!({})).unwrap();
        assert_eq!(target(r).as_deref(), Some("a"));
        let r = next_route(&graph, graph.node("a").unwrap(), &json!({})).unwrap();
        assert!(matches!(r, Route::Stop));
    }
}
