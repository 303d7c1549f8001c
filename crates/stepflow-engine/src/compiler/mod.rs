//! Workflow compiler.
//!
//! Turns a [`WorkflowDefinition`] into an immutable [`CompiledWorkflow`]:
//! every node's bindings and branch expressions parsed, edges resolved to
//! node indices, and nodes grouped into execution levels with Kahn's
//! algorithm. Nothing is compiled unless the definition validates cleanly.

mod checks;
mod topology;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use stepflow_core::error::CompileError;
use stepflow_core::types::{ErrorPolicy, NodeType, RetryPolicy, WorkflowDefinition};
use tracing::debug;

pub use checks::validate;

use crate::binding::BindingSpec;
use crate::condition::BranchSet;
use topology::Topology;

/// Settings of a `human_gate` node.
#[derive(Debug, Clone, PartialEq)]
pub struct GateSettings {
    pub timeout_ms: Option<u64>,
    pub prompt: Option<String>,
}

/// A validated node, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledNode {
    pub key: String,
    pub node_type: NodeType,
    pub config: Value,
    pub bindings: BTreeMap<String, BindingSpec>,
    pub retry: RetryPolicy,
    pub on_error: ErrorPolicy,
    /// Upper bound on one handler invocation.
    pub timeout: Option<Duration>,
    /// Present on `condition` nodes.
    pub branches: Option<BranchSet>,
    /// Present on `human_gate` nodes.
    pub gate: Option<GateSettings>,
    pub level: usize,
    incoming: Vec<usize>,
    outgoing: Vec<usize>,
}

/// An edge between two compiled nodes, by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledEdge {
    pub from: usize,
    pub to: usize,
    /// Branch label that activates this edge, if any.
    pub label: Option<String>,
}

/// An immutable, validated execution plan.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWorkflow {
    definition: WorkflowDefinition,
    nodes: Vec<CompiledNode>,
    edges: Vec<CompiledEdge>,
    index: HashMap<String, usize>,
    levels: Vec<Vec<usize>>,
}

/// Validate and compile a definition. On failure the error carries every
/// validation problem found, not just the first.
pub fn compile(definition: WorkflowDefinition) -> Result<CompiledWorkflow, CompileError> {
    let analysis = checks::analyze(&definition);
    if !analysis.errors.is_empty() {
        debug!(
            workflow = %definition.id,
            errors = analysis.errors.len(),
            "Workflow failed validation"
        );
        return Err(CompileError::new(analysis.errors));
    }

    let edges: Vec<CompiledEdge> = analysis
        .edges
        .iter()
        .map(|&(pos, from, to)| CompiledEdge {
            from,
            to,
            label: definition.edges[pos].condition.clone(),
        })
        .collect();

    let levels = Topology::new(definition.nodes.len(), edges.iter().map(|e| (e.from, e.to))).levels();
    let mut level_of = vec![0; definition.nodes.len()];
    for (level, members) in levels.iter().enumerate() {
        for &i in members {
            level_of[i] = level;
        }
    }
    let mut incoming = vec![Vec::new(); definition.nodes.len()];
    let mut outgoing = vec![Vec::new(); definition.nodes.len()];
    for (ei, edge) in edges.iter().enumerate() {
        incoming[edge.to].push(ei);
        outgoing[edge.from].push(ei);
    }

    let nodes = definition
        .nodes
        .iter()
        .zip(analysis.nodes)
        .enumerate()
        .filter_map(|(i, (def, parsed))| {
            // Validation guarantees a known type.
            let node_type = parsed.node_type?;
            let gate = (node_type == NodeType::HumanGate).then(|| GateSettings {
                timeout_ms: parsed.gate_timeout_ms,
                prompt: parsed.gate_prompt,
            });
            Some(CompiledNode {
                key: def.key.clone(),
                node_type,
                config: def.config.clone(),
                bindings: parsed.bindings,
                retry: def.retry_policy(),
                on_error: def.on_error,
                timeout: def.timeout_ms.map(Duration::from_millis),
                branches: parsed.branches,
                gate,
                level: level_of[i],
                incoming: std::mem::take(&mut incoming[i]),
                outgoing: std::mem::take(&mut outgoing[i]),
            })
        })
        .collect();

    debug!(
        workflow = %definition.id,
        version = definition.version,
        levels = levels.len(),
        "Workflow compiled"
    );

    Ok(CompiledWorkflow {
        definition,
        nodes,
        edges,
        index: analysis.index,
        levels,
    })
}

impl CompiledWorkflow {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn version(&self) -> u32 {
        self.definition.version
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, key: &str) -> Option<&CompiledNode> {
        self.index.get(key).map(|&i| &self.nodes[i])
    }

    pub fn edges(&self) -> &[CompiledEdge] {
        &self.edges
    }

    /// Execution levels, as node keys.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|&i| self.nodes[i].key.as_str()).collect())
            .collect()
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn level_of(&self, key: &str) -> Option<usize> {
        self.node(key).map(|n| n.level)
    }

    /// All node keys, level by level.
    pub fn topological_order(&self) -> Vec<&str> {
        self.levels.iter().flatten().map(|&i| self.nodes[i].key.as_str()).collect()
    }

    /// Nodes without incoming edges.
    pub fn roots(&self) -> Vec<&str> {
        self.levels
            .first()
            .map(|level| level.iter().map(|&i| self.nodes[i].key.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn predecessors(&self, key: &str) -> Vec<&str> {
        self.neighbours(key, |n| &n.incoming, |e| e.from)
    }

    pub fn successors(&self, key: &str) -> Vec<&str> {
        self.neighbours(key, |n| &n.outgoing, |e| e.to)
    }

    fn neighbours(
        &self,
        key: &str,
        edges_of: impl Fn(&CompiledNode) -> &Vec<usize>,
        endpoint: impl Fn(&CompiledEdge) -> usize,
    ) -> Vec<&str> {
        let Some(node) = self.node(key) else {
            return vec![];
        };
        let mut seen = HashSet::new();
        edges_of(node)
            .iter()
            .map(|&ei| self.nodes[endpoint(&self.edges[ei])].key.as_str())
            .filter(|k| seen.insert(*k))
            .collect()
    }

    pub(crate) fn level_indices(&self) -> &[Vec<usize>] {
        &self.levels
    }

    pub(crate) fn node_at(&self, idx: usize) -> &CompiledNode {
        &self.nodes[idx]
    }

    pub(crate) fn incoming(&self, idx: usize) -> impl Iterator<Item = &CompiledEdge> {
        self.nodes[idx].incoming.iter().map(|&ei| &self.edges[ei])
    }

    pub(crate) fn outgoing(&self, idx: usize) -> impl Iterator<Item = &CompiledEdge> {
        self.nodes[idx].outgoing.iter().map(|&ei| &self.edges[ei])
    }
}
