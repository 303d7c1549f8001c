use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use stepflow_core::types::{
    NodeRun, NodeStatus, RunFailure, RunId, RunStatus, RunStatusCell, SkipReason, WorkflowRunResult,
};

use super::node::NodeOutcome;
use crate::compiler::{CompiledEdge, CompiledWorkflow};
use crate::context::RunContext;

/// Whether a node may start once its level comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Run,
    Skip(SkipReason),
}

/// Live state of one run, owned by the orchestrating task.
///
/// Node records are created lazily as nodes are scheduled, skipped or
/// cancelled. The context is only written here, after a level settles.
pub(crate) struct WorkflowRun {
    id: RunId,
    workflow: Arc<CompiledWorkflow>,
    status: Arc<RunStatusCell>,
    context: Arc<RunContext>,
    records: Vec<Option<NodeRun>>,
    /// Branch selected by each condition node.
    branches: Vec<Option<String>>,
    cause: Option<RunFailure>,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl WorkflowRun {
    pub(crate) fn new(id: RunId, workflow: Arc<CompiledWorkflow>, input: Value) -> Self {
        let n = workflow.len();
        Self {
            id,
            workflow,
            status: Arc::new(RunStatusCell::new()),
            context: Arc::new(RunContext::new(input)),
            records: vec![None; n],
            branches: vec![None; n],
            cause: None,
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> &RunId {
        &self.id
    }

    pub(crate) fn status_cell(&self) -> Arc<RunStatusCell> {
        self.status.clone()
    }

    /// Read-only view of the context handed to the next level's tasks.
    pub(crate) fn snapshot(&self) -> Arc<RunContext> {
        self.context.clone()
    }

    pub(crate) fn is_recorded(&self, idx: usize) -> bool {
        self.records[idx].is_some()
    }

    pub(crate) fn is_settled(&self, idx: usize) -> bool {
        self.records[idx]
            .as_ref()
            .is_some_and(|r| r.status.is_terminal())
    }

    pub(crate) fn any_cancelled(&self) -> bool {
        self.records
            .iter()
            .flatten()
            .any(|r| r.status == NodeStatus::Cancelled)
    }

    /// Store the outcome of a node task.
    pub(crate) fn record(&mut self, outcome: NodeOutcome) {
        let NodeOutcome {
            idx,
            record,
            branch,
            escalated,
        } = outcome;

        if record.status == NodeStatus::Completed {
            if let Some(output) = &record.output {
                Arc::make_mut(&mut self.context).record(record.key.clone(), output.clone());
            }
        }
        if escalated && self.cause.is_none() {
            if let Some(error) = &record.error {
                self.cause = Some(RunFailure {
                    node_key: record.key.clone(),
                    error: error.clone(),
                });
            }
        }
        self.branches[idx] = branch;
        self.records[idx] = Some(record);
    }

    /// Store a record for a node that never ran (skipped or cancelled).
    pub(crate) fn mark(&mut self, idx: usize, record: NodeRun) {
        self.records[idx] = Some(record);
    }

    /// An edge is active when its source completed and, for a labeled edge,
    /// selected that label.
    fn edge_active(&self, edge: &CompiledEdge) -> bool {
        let completed = self.records[edge.from]
            .as_ref()
            .is_some_and(|r| r.status == NodeStatus::Completed);
        completed
            && match &edge.label {
                None => true,
                Some(label) => self.branches[edge.from].as_deref() == Some(label.as_str()),
            }
    }

    /// Roots always run. Other nodes run when at least one incoming edge is
    /// active; otherwise they are skipped, as `BranchNotTaken` only when every
    /// dead path traces back to an unselected branch.
    pub(crate) fn admission(&self, idx: usize) -> Admission {
        let mut incoming = self.workflow.incoming(idx).peekable();
        if incoming.peek().is_none() {
            return Admission::Run;
        }

        let mut upstream_failed = false;
        for edge in incoming {
            if self.edge_active(edge) {
                return Admission::Run;
            }
            let by_branch = match &self.records[edge.from] {
                Some(r) if r.status == NodeStatus::Completed => true,
                Some(r) => r.skip_reason == Some(SkipReason::BranchNotTaken),
                None => false,
            };
            upstream_failed |= !by_branch;
        }

        Admission::Skip(if upstream_failed {
            SkipReason::UpstreamFailed
        } else {
            SkipReason::BranchNotTaken
        })
    }

    /// A completed node with no active outgoing edge.
    fn is_terminal_output(&self, idx: usize) -> bool {
        let completed = self.records[idx]
            .as_ref()
            .is_some_and(|r| r.status == NodeStatus::Completed);
        completed && !self.workflow.outgoing(idx).any(|e| self.edge_active(e))
    }

    /// Aggregate the final result.
    pub(crate) fn finish(mut self, status: RunStatus) -> WorkflowRunResult {
        let order: Vec<usize> = self.workflow.level_indices().iter().flatten().copied().collect();

        let outputs: BTreeMap<String, Value> = order
            .iter()
            .filter(|&&idx| self.is_terminal_output(idx))
            .filter_map(|&idx| {
                let record = self.records[idx].as_ref()?;
                Some((record.key.clone(), record.output.clone()?))
            })
            .collect();

        let nodes: Vec<NodeRun> = order.iter().filter_map(|&idx| self.records[idx].take()).collect();

        let partial = status == RunStatus::Completed
            && nodes.iter().any(|n| {
                n.status == NodeStatus::Failed || n.skip_reason == Some(SkipReason::UpstreamFailed)
            });

        WorkflowRunResult {
            run_id: self.id,
            workflow_id: self.workflow.id().to_string(),
            workflow_version: self.workflow.version(),
            status,
            total_cost: nodes.iter().map(|n| n.cost).sum(),
            total_duration_ms: nodes.iter().map(|n| n.duration_ms).sum(),
            nodes,
            outputs,
            cause: self.cause,
            partial,
            wall_time_ms: self.clock.elapsed().as_millis() as u64,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
