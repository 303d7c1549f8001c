//! Level-barrier workflow execution.
//!
//! The orchestrating task walks the compiled levels in order. Every node of a
//! level that is admitted runs on its own task; the next level starts only
//! once the whole level has settled and its outputs are in the context.

mod node;
mod state;

use std::sync::Arc;

use serde_json::{json, Value};
use stepflow_core::config::RunnerConfig;
use stepflow_core::error::{NodeError, Result};
use stepflow_core::event::{EventSink, EventType, RunEvent};
use stepflow_core::types::{
    ErrorPolicy, NodeRun, NodeStatus, RunId, RunStatus, RunStatusCell, WorkflowRunResult,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compiler::CompiledWorkflow;
use crate::gate::{GateBroker, GateDecision};
use crate::registry::HandlerRegistry;

use node::{NodeOutcome, NodeTask};
use state::{Admission, WorkflowRun};

/// Executes compiled workflows against a handler registry.
///
/// A runner holds no per-run state, so one instance can drive any number of
/// concurrent runs.
pub struct WorkflowRunner {
    handlers: Arc<HandlerRegistry>,
    sink: Arc<dyn EventSink>,
    gates: Arc<GateBroker>,
    config: RunnerConfig,
}

impl WorkflowRunner {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        sink: Arc<dyn EventSink>,
        gates: Arc<GateBroker>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            handlers,
            sink,
            gates,
            config,
        }
    }

    pub fn gates(&self) -> &Arc<GateBroker> {
        &self.gates
    }

    /// Deliver a host decision to a waiting human gate.
    pub async fn resume(
        &self,
        run_id: &RunId,
        node_key: &str,
        decision: GateDecision,
        payload: Value,
    ) -> Result<()> {
        self.gates.resume(run_id, node_key, decision, payload).await
    }

    /// Run `workflow` once under a fresh run id.
    pub async fn execute(
        &self,
        workflow: Arc<CompiledWorkflow>,
        input: Value,
        cancel: CancellationToken,
    ) -> WorkflowRunResult {
        self.execute_with_id(RunId::new(), workflow, input, cancel).await
    }

    /// Run `workflow` under a run id chosen by the caller, so the host can
    /// subscribe to events or resume gates before the first node starts.
    pub async fn execute_with_id(
        &self,
        run_id: RunId,
        workflow: Arc<CompiledWorkflow>,
        input: Value,
        cancel: CancellationToken,
    ) -> WorkflowRunResult {
        let mut run = WorkflowRun::new(run_id, workflow.clone(), input);
        let status = run.status_cell();
        // Fires on host cancellation, or once a `fail`-policy node fails.
        let halt = cancel.child_token();

        if status.transition(RunStatus::Pending, RunStatus::Running).is_err() {
            warn!(run_id = %run.id(), "Run was not pending at start");
        }
        info!(
            run_id = %run.id(),
            workflow = %workflow.id(),
            version = workflow.version(),
            nodes = workflow.len(),
            levels = workflow.level_count(),
            "Run started"
        );
        self.emit_run(
            run.id(),
            EventType::RunStarted,
            json!({
                "workflow_id": workflow.id(),
                "version": workflow.version(),
                "levels": workflow.levels(),
            }),
        );

        for (level, indices) in workflow.level_indices().iter().enumerate() {
            if halt.is_cancelled() {
                debug!(run_id = %run.id(), level, "Run halted before level");
                break;
            }

            let mut tasks = JoinSet::new();
            let mut launched = Vec::new();
            let snapshot = run.snapshot();

            for &idx in indices {
                if halt.is_cancelled() {
                    break;
                }
                let node = workflow.node_at(idx);
                match run.admission(idx) {
                    Admission::Skip(reason) => {
                        debug!(run_id = %run.id(), node = %node.key, ?reason, "Node skipped");
                        run.mark(idx, NodeRun::skipped(&node.key, node.node_type, reason));
                        self.emit_node(run.id(), &node.key, EventType::NodeSkipped, json!({ "reason": reason }));
                    }
                    Admission::Run => {
                        self.emit_node(
                            run.id(),
                            &node.key,
                            EventType::NodeQueued,
                            json!({ "level": level, "node_type": node.node_type }),
                        );
                        launched.push(idx);
                        tasks.spawn(
                            NodeTask {
                                run_id: run.id().clone(),
                                workflow: workflow.clone(),
                                idx,
                                context: snapshot.clone(),
                                handlers: self.handlers.clone(),
                                gates: self.gates.clone(),
                                sink: self.sink.clone(),
                                status: status.clone(),
                                cancel: cancel.clone(),
                                halt: halt.clone(),
                                config: self.config.clone(),
                            }
                            .run(),
                        );
                    }
                }
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => run.record(outcome),
                    Err(e) => error!(run_id = %run.id(), error = %e, "Node task aborted"),
                }
            }

            // A task that died without reporting still needs a terminal record.
            for idx in launched {
                if !run.is_settled(idx) {
                    self.abandon(&mut run, &workflow, idx, &status, &halt);
                }
            }
        }

        let failed = status.get() == RunStatus::Failed;
        let reason = if failed { "run_failed" } else { "run_cancelled" };
        for &idx in workflow.level_indices().iter().flatten() {
            if !run.is_recorded(idx) {
                let node = workflow.node_at(idx);
                run.mark(idx, NodeRun::cancelled(&node.key, node.node_type));
                self.emit_node(run.id(), &node.key, EventType::NodeCancelled, json!({ "reason": reason }));
            }
        }

        let final_status = if failed {
            RunStatus::Failed
        } else if cancel.is_cancelled() && run.any_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        if !failed {
            if let Err(actual) = status.transition(RunStatus::Running, final_status) {
                warn!(run_id = %run.id(), ?actual, "Run status moved unexpectedly");
            }
        }

        let result = run.finish(final_status);
        match final_status {
            RunStatus::Completed => {
                info!(
                    run_id = %result.run_id,
                    partial = result.partial,
                    total_cost = result.total_cost,
                    wall_time_ms = result.wall_time_ms,
                    "Run completed"
                );
                self.emit_run(
                    &result.run_id,
                    EventType::RunCompleted,
                    json!({
                        "partial": result.partial,
                        "outputs": result.outputs,
                        "total_cost": result.total_cost,
                        "total_duration_ms": result.total_duration_ms,
                    }),
                );
            }
            RunStatus::Failed => {
                warn!(
                    run_id = %result.run_id,
                    node = result.cause.as_ref().map(|c| c.node_key.as_str()).unwrap_or("?"),
                    "Run failed"
                );
                self.emit_run(&result.run_id, EventType::RunFailed, json!({ "cause": result.cause }));
            }
            _ => {
                info!(run_id = %result.run_id, "Run cancelled");
                self.emit_run(&result.run_id, EventType::RunCancelled, json!({}));
            }
        }
        result
    }

    /// Record a launched node whose task never reported back as failed.
    fn abandon(
        &self,
        run: &mut WorkflowRun,
        workflow: &CompiledWorkflow,
        idx: usize,
        status: &RunStatusCell,
        halt: &CancellationToken,
    ) {
        let node = workflow.node_at(idx);
        let error = NodeError::execution("node task aborted", false);

        let mut record = NodeRun::queued(&node.key, node.node_type);
        record.error = Some(error.clone());
        record.advance(NodeStatus::Running);
        record.advance(NodeStatus::Failed);

        let escalated = node.on_error == ErrorPolicy::Fail
            && status.transition(RunStatus::Running, RunStatus::Failed).is_ok();
        if escalated {
            halt.cancel();
        }
        self.emit_node(
            run.id(),
            &node.key,
            EventType::NodeFailed,
            json!({ "attempts": 0, "code": error.code(), "error": error, "on_error": node.on_error }),
        );
        run.record(NodeOutcome {
            idx,
            record,
            branch: None,
            escalated,
        });
    }

    fn emit_run(&self, run_id: &RunId, event_type: EventType, payload: Value) {
        self.sink.emit(RunEvent::run(run_id, event_type, payload));
    }

    fn emit_node(&self, run_id: &RunId, key: &str, event_type: EventType, payload: Value) {
        self.sink.emit(RunEvent::node(run_id, key, event_type, payload));
    }
}
