//! Validation passes. Every pass runs and every error is collected; later
//! passes only skip the parts that earlier errors make meaningless.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use stepflow_core::error::ValidationError;
use stepflow_core::types::{NodeDefinition, NodeType, WorkflowDefinition};

use super::topology::{ranks, Topology};
use crate::binding::{node_key_pattern, BindingSpec, CONTEXT_SOURCE};
use crate::condition::{Branch, BranchSet, ConditionExpr};

/// Per-node facts extracted once and shared by validation and planning.
#[derive(Debug, Default)]
pub(super) struct ParsedNode {
    pub node_type: Option<NodeType>,
    pub bindings: BTreeMap<String, BindingSpec>,
    pub branches: Option<BranchSet>,
    pub gate_timeout_ms: Option<u64>,
    pub gate_prompt: Option<String>,
    /// (param, expression, reason)
    malformed: Vec<(String, String, String)>,
    config_errors: Vec<ValidationError>,
    /// (param, referenced node key)
    references: Vec<(String, String)>,
}

pub(super) struct Analysis {
    pub errors: Vec<ValidationError>,
    pub nodes: Vec<ParsedNode>,
    pub index: HashMap<String, usize>,
    /// (edge position, from, to) for edges whose endpoints both exist.
    pub edges: Vec<(usize, usize, usize)>,
}

/// Validate a definition, returning every problem found.
pub fn validate(def: &WorkflowDefinition) -> Vec<ValidationError> {
    analyze(def).errors
}

pub(super) fn analyze(def: &WorkflowDefinition) -> Analysis {
    let mut errors = Vec::new();

    // Structure
    if def.nodes.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
    }
    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, node) in def.nodes.iter().enumerate() {
        if let Some(reason) = key_problem(&node.key) {
            errors.push(ValidationError::InvalidNodeKey {
                key: node.key.clone(),
                reason: reason.to_string(),
            });
        }
        if index.contains_key(&node.key) {
            errors.push(ValidationError::DuplicateNode {
                key: node.key.clone(),
            });
        } else {
            index.insert(node.key.clone(), i);
        }
    }
    // Later duplicates of a key take no part in graph checks.
    let canonical: Vec<usize> = (0..def.nodes.len())
        .filter(|&i| index.get(&def.nodes[i].key) == Some(&i))
        .collect();

    let nodes: Vec<ParsedNode> = def.nodes.iter().map(parse_node).collect();

    // References
    let mut edges = Vec::new();
    for (pos, edge) in def.edges.iter().enumerate() {
        let from = index.get(&edge.from).copied();
        let to = index.get(&edge.to).copied();
        for (endpoint, resolved) in [(&edge.from, from), (&edge.to, to)] {
            if resolved.is_none() {
                errors.push(ValidationError::UnknownEdgeEndpoint {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
        if let (Some(from), Some(to)) = (from, to) {
            edges.push((pos, from, to));
        }
    }
    for (node, parsed) in def.nodes.iter().zip(&nodes) {
        for (param, target) in &parsed.references {
            if !index.contains_key(target) {
                errors.push(ValidationError::UnknownReference {
                    node: node.key.clone(),
                    param: param.clone(),
                    reference: target.clone(),
                });
            }
        }
    }

    // Node types, config, edge labels, retry policies
    for (node, parsed) in def.nodes.iter().zip(&nodes) {
        if parsed.node_type.is_none() {
            errors.push(ValidationError::InvalidNodeType {
                node: node.key.clone(),
                type_name: node.kind.clone(),
            });
        }
        errors.extend(parsed.config_errors.iter().cloned());
        if let Some(reason) = retry_problem(node) {
            errors.push(ValidationError::InvalidRetryPolicy {
                node: node.key.clone(),
                reason,
            });
        }
        if node.timeout_ms == Some(0) {
            errors.push(ValidationError::InvalidConfig {
                node: node.key.clone(),
                field: "timeout_ms".into(),
                reason: "must be a positive number of milliseconds".into(),
            });
        }
    }
    for &(pos, from, _) in &edges {
        let edge = &def.edges[pos];
        let source = &nodes[from];
        let reason = match (&edge.condition, source.node_type, &source.branches) {
            // A condition node only activates edges by branch label.
            (None, Some(NodeType::Condition), _) => {
                Some("edges out of a condition node must name a branch".to_string())
            }
            (None, _, _) => None,
            (Some(label), Some(NodeType::Condition), Some(set)) if !set.has_label(label) => {
                Some(format!("'{}' has no branch with this label", edge.from))
            }
            (Some(_), Some(NodeType::Condition), _) | (Some(_), None, _) => None,
            (Some(_), Some(other), _) => Some(format!("source is a {other} node, not a condition node")),
        };
        if let Some(reason) = reason {
            errors.push(ValidationError::InvalidEdgeCondition {
                from: edge.from.clone(),
                to: edge.to.clone(),
                condition: edge.condition.clone().unwrap_or_default(),
                reason,
            });
        }
    }

    let topology = Topology::new(def.nodes.len(), edges.iter().map(|&(_, f, t)| (f, t)));

    // Cycles
    let mut on_cycle = HashSet::new();
    for cycle in topology.cycles(&canonical) {
        on_cycle.extend(cycle.iter().copied());
        errors.push(ValidationError::Cycle {
            path: cycle.iter().map(|&i| def.nodes[i].key.clone()).collect(),
        });
    }

    // Reachability
    let single = canonical.len() == 1;
    let isolated = |i: usize| topology.in_degree(i) == 0 && topology.out_degree(i) == 0;
    let roots: Vec<usize> = canonical
        .iter()
        .copied()
        .filter(|&i| topology.in_degree(i) == 0 && (single || !isolated(i)))
        .collect();
    let reached = topology.reachable_from(&roots);
    for &i in &canonical {
        if !reached.contains(&i) && !on_cycle.contains(&i) {
            errors.push(ValidationError::Unreachable {
                node: def.nodes[i].key.clone(),
            });
        }
    }

    // Bindings
    let rank = ranks(def.nodes.len(), &topology.levels());
    for (i, (node, parsed)) in def.nodes.iter().zip(&nodes).enumerate() {
        for (param, expression, reason) in &parsed.malformed {
            errors.push(ValidationError::MalformedBinding {
                node: node.key.clone(),
                param: param.clone(),
                expression: expression.clone(),
                reason: reason.clone(),
            });
        }
        if parsed.references.is_empty() || index.get(&node.key) != Some(&i) {
            continue;
        }
        for (param, target) in &parsed.references {
            let Some(&t) = index.get(target) else {
                continue;
            };
            if !topology.is_ancestor(t, i, &rank) {
                errors.push(ValidationError::NonAncestorBinding {
                    node: node.key.clone(),
                    param: param.clone(),
                    reference: target.clone(),
                });
            }
        }
    }

    Analysis {
        errors,
        nodes,
        index,
        edges,
    }
}

fn key_problem(key: &str) -> Option<&'static str> {
    if key.is_empty() {
        Some("must not be empty")
    } else if key == CONTEXT_SOURCE {
        Some("'context' is reserved for the run input")
    } else if !node_key_pattern().is_match(key) {
        Some("must not contain '.', '$' or whitespace")
    } else {
        None
    }
}

fn retry_problem(node: &NodeDefinition) -> Option<String> {
    let policy = node.retry?;
    if policy.max_attempts == 0 {
        return Some("max_attempts must be at least 1".into());
    }
    if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
        return Some(format!("multiplier must be >= 1.0, got {}", policy.multiplier));
    }
    None
}

fn parse_node(node: &NodeDefinition) -> ParsedNode {
    let mut parsed = ParsedNode {
        node_type: node.kind.parse().ok(),
        ..ParsedNode::default()
    };

    for (param, value) in &node.input_bindings {
        match BindingSpec::parse(value) {
            Ok(spec) => {
                if let Some(target) = spec.reference().and_then(|r| r.node_key()) {
                    parsed.references.push((param.clone(), target.to_string()));
                }
                parsed.bindings.insert(param.clone(), spec);
            }
            Err(e) => parsed.malformed.push((
                param.clone(),
                value.as_str().unwrap_or_default().to_string(),
                e.to_string(),
            )),
        }
    }

    let Some(config) = node.config.as_object() else {
        parsed.config_errors.push(invalid(node, "config", "must be an object"));
        return parsed;
    };

    match parsed.node_type {
        Some(NodeType::AgentCall) => require_string(node, config, "agent", &mut parsed.config_errors),
        Some(NodeType::ToolCall) => require_string(node, config, "tool", &mut parsed.config_errors),
        Some(NodeType::Condition) => parse_branches(node, config, &mut parsed),
        Some(NodeType::HumanGate) => {
            match config.get("timeout_ms") {
                None | Some(Value::Null) => {}
                Some(v) => match v.as_u64().filter(|&ms| ms > 0) {
                    Some(ms) => parsed.gate_timeout_ms = Some(ms),
                    None => parsed.config_errors.push(invalid(
                        node,
                        "timeout_ms",
                        "must be a positive integer",
                    )),
                },
            }
            match config.get("prompt") {
                None | Some(Value::Null) => {}
                Some(Value::String(p)) => parsed.gate_prompt = Some(p.clone()),
                Some(_) => parsed.config_errors.push(invalid(node, "prompt", "must be a string")),
            }
        }
        None => {}
    }
    parsed
}

fn require_string(
    node: &NodeDefinition,
    config: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Vec<ValidationError>,
) {
    match config.get(field) {
        None | Some(Value::Null) => errors.push(ValidationError::MissingConfig {
            node: node.key.clone(),
            field: field.to_string(),
        }),
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(_) => errors.push(invalid(node, field, "must be a non-empty string")),
    }
}

fn parse_branches(node: &NodeDefinition, config: &serde_json::Map<String, Value>, parsed: &mut ParsedNode) {
    let errors = &mut parsed.config_errors;
    let items = match config.get("branches") {
        None | Some(Value::Null) => {
            errors.push(ValidationError::MissingConfig {
                node: node.key.clone(),
                field: "branches".into(),
            });
            return;
        }
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(_) => {
            errors.push(invalid(node, "branches", "must be a non-empty array"));
            return;
        }
    };

    let mut branches = Vec::with_capacity(items.len());
    let mut labels = HashSet::new();
    let mut ok = true;
    for (i, item) in items.iter().enumerate() {
        let label = item.get("label").and_then(Value::as_str).filter(|l| !l.is_empty());
        let when = item.get("when").and_then(Value::as_str);
        let (Some(label), Some(when)) = (label, when) else {
            errors.push(invalid(
                node,
                &format!("branches[{i}]"),
                "needs a non-empty string 'label' and a string 'when'",
            ));
            ok = false;
            continue;
        };
        if !labels.insert(label) {
            errors.push(invalid(node, &format!("branches[{i}].label"), "duplicate label"));
            ok = false;
        }
        match ConditionExpr::parse(when) {
            Ok(expr) => {
                for r in expr.references() {
                    if let Some(target) = r.node_key() {
                        parsed
                            .references
                            .push((format!("branches[{i}].when"), target.to_string()));
                    }
                }
                branches.push(Branch {
                    label: label.to_string(),
                    when: expr,
                });
            }
            Err(e) => {
                errors.push(invalid(node, &format!("branches[{i}].when"), &e.to_string()));
                ok = false;
            }
        }
    }

    let default = match config.get("default") {
        None | Some(Value::Null) => None,
        Some(Value::String(d)) if labels.contains(d.as_str()) => Some(d.clone()),
        Some(Value::String(_)) => {
            errors.push(invalid(node, "default", "must name one of the branch labels"));
            ok = false;
            None
        }
        Some(_) => {
            errors.push(invalid(node, "default", "must be a string"));
            ok = false;
            None
        }
    };

    if ok {
        parsed.branches = Some(BranchSet { branches, default });
    }
}

fn invalid(node: &NodeDefinition, field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidConfig {
        node: node.key.clone(),
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
