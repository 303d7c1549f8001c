use serde_json::{json, Value};
use stepflow_core::types::{EdgeDefinition, NodeDefinition, NodeType, WorkflowDefinition};

/// An `agent_call` node with a valid config.
pub fn agent(key: &str) -> NodeDefinition {
    NodeDefinition::new(key, NodeType::AgentCall).with_config(json!({ "agent": "test-agent" }))
}

/// A `tool_call` node with a valid config.
pub fn tool(key: &str) -> NodeDefinition {
    NodeDefinition::new(key, NodeType::ToolCall).with_config(json!({ "tool": "test-tool" }))
}

/// A `condition` node from `(label, when)` pairs and an optional default.
pub fn condition(key: &str, branches: &[(&str, &str)], default: Option<&str>) -> NodeDefinition {
    let branches: Vec<Value> = branches
        .iter()
        .map(|(label, when)| json!({ "label": label, "when": when }))
        .collect();
    let mut config = json!({ "branches": branches });
    if let Some(default) = default {
        config["default"] = json!(default);
    }
    NodeDefinition::new(key, NodeType::Condition).with_config(config)
}

/// A `human_gate` node, optionally bounded by `timeout_ms`.
pub fn gate(key: &str, timeout_ms: Option<u64>) -> NodeDefinition {
    let mut config = json!({ "prompt": format!("approve {key}?") });
    if let Some(ms) = timeout_ms {
        config["timeout_ms"] = json!(ms);
    }
    NodeDefinition::new(key, NodeType::HumanGate).with_config(config)
}

/// `a -> b -> c`, each step forwarding the previous output.
pub fn linear_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("linear", 1)
        .with_node(agent("a").bind("x", "$context.x"))
        .with_node(tool("b").bind("prev", "$a"))
        .with_node(agent("c").bind("prev", "$b"))
        .connect("a", "b")
        .connect("b", "c")
}

/// `a -> {b, c} -> d`.
pub fn diamond_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("diamond", 1)
        .with_node(agent("a"))
        .with_node(tool("b").bind("from", "$a"))
        .with_node(tool("c").bind("from", "$a"))
        .with_node(agent("d").bind("left", "$b").bind("right", "$c"))
        .connect("a", "b")
        .connect("a", "c")
        .connect("b", "d")
        .connect("c", "d")
}

/// `score` feeds a condition that routes to `high` on `$score.value > 50`
/// and falls back to `low`, whose own expression never holds.
pub fn branching_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("branching", 1)
        .with_node(agent("score").bind("value", "$context.score"))
        .with_node(condition(
            "route",
            &[("high", "$score.value > 50"), ("low", "false")],
            Some("low"),
        ))
        .with_node(tool("high").bind("score", "$score.value"))
        .with_node(tool("low").bind("score", "$score.value"))
        .connect("score", "route")
        .with_edge(EdgeDefinition::branch("route", "high", "high"))
        .with_edge(EdgeDefinition::branch("route", "low", "low"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_fixture_shape() {
        let node = condition("route", &[("yes", "$a.ok")], Some("no"));
        assert_eq!(node.config["branches"][0]["label"], "yes");
        assert_eq!(node.config["default"], "no");
    }

    #[test]
    fn test_fixtures_are_well_formed() {
        let def = branching_workflow();
        assert_eq!(def.nodes.len(), 4);
        assert_eq!(def.edges.len(), 3);
        assert!(def.node("route").is_some());
    }
}
