use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{NodeError, Result, StepflowError};

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of node kinds a workflow may contain.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    AgentCall,
    ToolCall,
    HumanGate,
    Condition,
}

impl NodeType {
    pub const ALL: [NodeType; 4] = [
        NodeType::AgentCall,
        NodeType::ToolCall,
        NodeType::HumanGate,
        NodeType::Condition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentCall => "agent_call",
            Self::ToolCall => "tool_call",
            Self::HumanGate => "human_gate",
            Self::Condition => "condition",
        }
    }

    /// Whether the runner executes this kind itself instead of dispatching
    /// to a registered handler.
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::HumanGate | Self::Condition)
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown node type: {s}"))
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy for a single node.
///
/// The delay before retry `k` (0-based) is `base_delay_ms * multiplier^k`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 { 1 }
fn default_multiplier() -> f64 { 2.0 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: 0,
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            multiplier,
        }
    }
}

/// What happens to the run when a node fails terminally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// The whole run fails and no further levels start.
    #[default]
    Fail,
    /// Only this node fails; nodes that depend solely on it are skipped.
    Continue,
}

/// A node as authored in a workflow definition.
///
/// `kind` keeps the raw type string so that an unknown type is reported by
/// the compiler alongside every other problem instead of failing parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default)]
    pub input_bindings: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    /// Upper bound on a single handler invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl NodeDefinition {
    /// Create a node of a known type with empty config and no bindings.
    pub fn new(key: impl Into<String>, node_type: NodeType) -> Self {
        Self::raw(key, node_type.as_str())
    }

    /// Create a node with an arbitrary type string.
    pub fn raw(key: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            config: empty_object(),
            input_bindings: BTreeMap::new(),
            retry: None,
            on_error: ErrorPolicy::Fail,
            timeout_ms: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Bind an input parameter to a literal or a `$`-expression.
    pub fn bind(mut self, param: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_bindings.insert(param.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_error_policy(mut self, on_error: ErrorPolicy) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// The effective retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or_default()
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
    /// Branch label of a `condition` source node that activates this edge.
    #[serde(default)]
    pub condition: Option<String>,
}

impl EdgeDefinition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Create an edge activated only when `from` selects `label`.
    pub fn branch(from: impl Into<String>, to: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(label.into()),
        }
    }
}

/// A declarative workflow, as submitted for compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

fn default_version() -> u32 { 1 }

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            nodes: vec![],
            edges: vec![],
        }
    }

    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: EdgeDefinition) -> Self {
        self.edges.push(edge);
        self
    }

    /// Shorthand for an unconditional edge.
    pub fn connect(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.with_edge(EdgeDefinition::new(from, to))
    }

    pub fn node(&self, key: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// Parse a definition from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StepflowError::Definition(e.to_string()))
    }

    /// Load a definition from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

/// Run-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum RunStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }
}

/// Atomic holder for a [`RunStatus`], advanced only through legal
/// compare-and-set transitions.
#[derive(Debug)]
pub struct RunStatusCell(AtomicU8);

impl RunStatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(RunStatus::Pending as u8))
    }

    pub fn get(&self) -> RunStatus {
        RunStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. Returns the actual current status on
    /// failure, either because another task won the race or because the
    /// transition is not legal.
    pub fn transition(&self, from: RunStatus, to: RunStatus) -> std::result::Result<(), RunStatus> {
        if !from.can_transition_to(to) {
            return Err(self.get());
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(RunStatus::from_u8)
    }
}

impl Default for RunStatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node lifecycle within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Skipped | Self::Cancelled),
            Self::Running => matches!(
                next,
                Self::Queued | Self::Completed | Self::Failed | Self::Cancelled
            ),
            _ => false,
        }
    }
}

/// Why a node was skipped without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Every path into the node ran through a condition branch that was not selected.
    BranchNotTaken,
    /// Every viable path into the node ran through a failed or skipped-by-failure node.
    UpstreamFailed,
}

/// Execution record of one node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRun {
    pub key: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Cost summed over every attempt.
    pub cost: f64,
    /// Handler time summed over every attempt.
    pub duration_ms: u64,
    /// Backoff delays actually waited between attempts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backoff_ms: Vec<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeRun {
    pub fn queued(key: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            key: key.into(),
            node_type,
            status: NodeStatus::Queued,
            attempts: 0,
            input: None,
            output: None,
            error: None,
            skip_reason: None,
            cost: 0.0,
            duration_ms: 0,
            backoff_ms: vec![],
            started_at: None,
            finished_at: None,
        }
    }

    pub fn skipped(key: impl Into<String>, node_type: NodeType, reason: SkipReason) -> Self {
        let mut run = Self::queued(key, node_type);
        run.status = NodeStatus::Skipped;
        run.skip_reason = Some(reason);
        run.finished_at = Some(Utc::now());
        run
    }

    pub fn cancelled(key: impl Into<String>, node_type: NodeType) -> Self {
        let mut run = Self::queued(key, node_type);
        run.status = NodeStatus::Cancelled;
        run.finished_at = Some(Utc::now());
        run
    }

    /// Advance to `next` if the transition is legal. Returns whether it moved.
    pub fn advance(&mut self, next: NodeStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next == NodeStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }
}

/// The error that terminated a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub node_key: String,
    pub error: NodeError,
}

/// Outcome of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunResult {
    pub run_id: RunId,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub status: RunStatus,
    /// Every node that was reached, in topological order.
    pub nodes: Vec<NodeRun>,
    /// Outputs of completed terminal nodes.
    pub outputs: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<RunFailure>,
    /// Completed, but some nodes failed or were skipped because of a failure.
    pub partial: bool,
    pub total_cost: f64,
    /// Sum of node durations, including retried attempts.
    pub total_duration_ms: u64,
    pub wall_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowRunResult {
    pub fn node(&self, key: &str) -> Option<&NodeRun> {
        self.nodes.iter().find(|n| n.key == key)
    }

    pub fn node_status(&self, key: &str) -> Option<NodeStatus> {
        self.node(key).map(|n| n.status)
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed && !self.partial
    }
}
