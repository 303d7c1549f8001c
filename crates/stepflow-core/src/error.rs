use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepflowError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Definition errors
    #[error("Invalid workflow definition: {0}")]
    Definition(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    // Human gate errors
    #[error("No human gate pending for run {run_id} node {node_key}")]
    GateNotPending { run_id: String, node_key: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StepflowError>;

/// A structural or semantic defect found while compiling a workflow.
///
/// Validation never stops at the first problem: the compiler reports every
/// defect it finds so the author gets a complete picture in one pass.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Workflow has no nodes")]
    EmptyWorkflow,

    #[error("Invalid node key '{key}': {reason}")]
    InvalidNodeKey { key: String, reason: String },

    #[error("Duplicate node key: {key}")]
    DuplicateNode { key: String },

    #[error("Edge {from} -> {to} references unknown node '{missing}'")]
    UnknownEdgeEndpoint {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Node {node}: '{param}' references unknown node '{reference}'")]
    UnknownReference {
        node: String,
        param: String,
        reference: String,
    },

    #[error("Node {node}: unknown node type '{type_name}'")]
    InvalidNodeType { node: String, type_name: String },

    #[error("Node {node}: missing required config field '{field}'")]
    MissingConfig { node: String, field: String },

    #[error("Node {node}: invalid config field '{field}': {reason}")]
    InvalidConfig {
        node: String,
        field: String,
        reason: String,
    },

    #[error("Edge {from} -> {to}: invalid branch condition '{condition}': {reason}")]
    InvalidEdgeCondition {
        from: String,
        to: String,
        condition: String,
        reason: String,
    },

    #[error("Node {node}: invalid retry policy: {reason}")]
    InvalidRetryPolicy { node: String, reason: String },

    #[error("Cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Node {node} is unreachable from any start node")]
    Unreachable { node: String },

    #[error("Node {node}: malformed binding '{param}' = '{expression}': {reason}")]
    MalformedBinding {
        node: String,
        param: String,
        expression: String,
        reason: String,
    },

    #[error("Node {node}: binding '{param}' references '{reference}', which is not an ancestor")]
    NonAncestorBinding {
        node: String,
        param: String,
        reference: String,
    },
}

/// Coarse classification of [`ValidationError`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    Structure,
    InvalidReference,
    InvalidNode,
    Cycle,
    Unreachable,
    InvalidBinding,
}

impl ValidationError {
    pub fn kind(&self) -> ValidationErrorKind {
        match self {
            Self::EmptyWorkflow | Self::InvalidNodeKey { .. } | Self::DuplicateNode { .. } => {
                ValidationErrorKind::Structure
            }
            Self::UnknownEdgeEndpoint { .. } | Self::UnknownReference { .. } => {
                ValidationErrorKind::InvalidReference
            }
            Self::InvalidNodeType { .. }
            | Self::MissingConfig { .. }
            | Self::InvalidConfig { .. }
            | Self::InvalidEdgeCondition { .. }
            | Self::InvalidRetryPolicy { .. } => ValidationErrorKind::InvalidNode,
            Self::Cycle { .. } => ValidationErrorKind::Cycle,
            Self::Unreachable { .. } => ValidationErrorKind::Unreachable,
            Self::MalformedBinding { .. } | Self::NonAncestorBinding { .. } => {
                ValidationErrorKind::InvalidBinding
            }
        }
    }

    /// The node this error is about, when there is a single one.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::InvalidNodeKey { key, .. } | Self::DuplicateNode { key } => Some(key),
            Self::UnknownReference { node, .. }
            | Self::InvalidNodeType { node, .. }
            | Self::MissingConfig { node, .. }
            | Self::InvalidConfig { node, .. }
            | Self::InvalidRetryPolicy { node, .. }
            | Self::Unreachable { node }
            | Self::MalformedBinding { node, .. }
            | Self::NonAncestorBinding { node, .. } => Some(node),
            Self::UnknownEdgeEndpoint { missing, .. } => Some(missing),
            Self::Cycle { path } => path.first().map(String::as_str),
            Self::EmptyWorkflow | Self::InvalidEdgeCondition { .. } => None,
        }
    }
}

/// The full batch of validation errors that prevented compilation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("workflow failed validation with {} error(s): {}", .errors.len(), summarize(.errors))]
pub struct CompileError {
    pub errors: Vec<ValidationError>,
}

impl CompileError {
    pub fn new(errors: Vec<ValidationError>) -> Self {
        Self { errors }
    }

    pub fn has_kind(&self, kind: ValidationErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind() == kind)
    }
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure to resolve a binding expression against the run context.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BindingResolutionError {
    #[error("node '{node}' has not produced output")]
    NodeOutputMissing { node: String },

    #[error("path '{path}' not found in {reference}")]
    PathNotFound { reference: String, path: String },

    #[error("cannot read '{segment}' from a {found} in {reference}")]
    TypeMismatch {
        reference: String,
        segment: String,
        found: String,
    },
}

/// Per-node runtime failure, recorded on the node run and carried in events.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    #[error("binding '{param}' failed: {error}")]
    BindingResolution {
        param: String,
        error: BindingResolutionError,
    },

    #[error("node execution failed: {message}")]
    Execution { message: String, retryable: bool },

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("human gate timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("cancelled while in flight")]
    Cancelled,

    #[error("rejected at human gate{}", reason_suffix(.reason))]
    Rejected { reason: Option<String> },
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

impl NodeError {
    /// Taxonomy name of this error, as reported to hosts.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BindingResolution { .. } => "BindingResolutionError",
            Self::Execution { .. } => "NodeExecutionError",
            Self::RetryExhausted { .. } => "RetryExhaustedError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Cancelled => "CancellationError",
            Self::Rejected { .. } => "GateRejectedError",
        }
    }

    pub fn execution(message: impl Into<String>, retryable: bool) -> Self {
        Self::Execution {
            message: message.into(),
            retryable,
        }
    }
}
