use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use stepflow_core::config::RunnerConfig;
use stepflow_core::error::NodeError;
use stepflow_core::event::{EventSink, EventType, RunEvent};
use stepflow_core::traits::HandlerRequest;
use stepflow_core::types::{ErrorPolicy, NodeRun, NodeStatus, NodeType, RunId, RunStatus, RunStatusCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binding::resolve_inputs;
use crate::compiler::{CompiledNode, CompiledWorkflow};
use crate::context::RunContext;
use crate::gate::{GateBroker, GateDecision, GateResolution};
use crate::registry::HandlerRegistry;
use crate::retry::{backoff_delay, has_attempts_left};

/// What a node task reports back to the orchestrator.
#[derive(Debug)]
pub(crate) struct NodeOutcome {
    pub idx: usize,
    pub record: NodeRun,
    /// Label chosen by a condition node.
    pub branch: Option<String>,
    /// This node's failure moved the run to `Failed`.
    pub escalated: bool,
}

/// Everything one node needs to run to completion on its own task.
pub(crate) struct NodeTask {
    pub run_id: RunId,
    pub workflow: Arc<CompiledWorkflow>,
    pub idx: usize,
    pub context: Arc<RunContext>,
    pub handlers: Arc<HandlerRegistry>,
    pub gates: Arc<GateBroker>,
    pub sink: Arc<dyn EventSink>,
    pub status: Arc<RunStatusCell>,
    /// Cancellation requested by the host.
    pub cancel: CancellationToken,
    /// Fires on host cancellation or once the run has failed.
    pub halt: CancellationToken,
    pub config: RunnerConfig,
}

impl NodeTask {
    pub async fn run(self) -> NodeOutcome {
        let workflow = self.workflow.clone();
        let node = workflow.node_at(self.idx);

        // The run may have failed or been cancelled while this task waited
        // for a worker. A node that never started is never started late.
        if self.halt.is_cancelled() {
            let reason = if self.cancel.is_cancelled() {
                "run_cancelled"
            } else {
                "run_failed"
            };
            debug!(run_id = %self.run_id, node = %node.key, reason, "Node cancelled before start");
            self.emit(&node.key, EventType::NodeCancelled, json!({ "reason": reason }));
            return NodeOutcome {
                idx: self.idx,
                record: NodeRun::cancelled(&node.key, node.node_type),
                branch: None,
                escalated: false,
            };
        }

        let mut record = NodeRun::queued(&node.key, node.node_type);
        let mut branch = None;

        let result = match node.node_type {
            NodeType::Condition => self.run_condition(node, &mut record).map(|selected| {
                branch = selected.clone();
                json!({ "branch": selected })
            }),
            NodeType::HumanGate => self.run_gate(node, &mut record).await,
            NodeType::AgentCall | NodeType::ToolCall => self.run_handler(node, &mut record).await,
        };

        self.settle(node, record, result, branch)
    }

    fn emit(&self, key: &str, event_type: EventType, payload: Value) {
        self.sink
            .emit(RunEvent::node(&self.run_id, key, event_type, payload));
    }

    /// Enter `Running` for a new attempt and announce it.
    fn start_attempt(&self, node: &CompiledNode, record: &mut NodeRun, extra: Value) {
        record.advance(NodeStatus::Running);
        record.attempts += 1;

        let mut payload = json!({
            "attempt": record.attempts,
            "max_attempts": node.retry.max_attempts,
        });
        if let (Some(target), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            target.extend(extra);
        }
        debug!(run_id = %self.run_id, node = %node.key, attempt = record.attempts, "Node running");
        self.emit(&node.key, EventType::NodeRunning, payload);
    }

    fn resolve_input(&self, node: &CompiledNode, record: &mut NodeRun) -> Result<Value, NodeError> {
        let input = resolve_inputs(&node.bindings, &self.context)?;
        record.input = Some(input.clone());
        Ok(input)
    }

    fn run_condition(&self, node: &CompiledNode, record: &mut NodeRun) -> Result<Option<String>, NodeError> {
        self.start_attempt(node, record, json!({}));
        let started = Instant::now();

        let result = self.resolve_input(node, record).and_then(|_| {
            let set = node
                .branches
                .as_ref()
                .ok_or_else(|| NodeError::execution("condition node has no branches", false))?;
            set.select(&self.context)
                .map_err(|error| NodeError::BindingResolution {
                    param: "when".into(),
                    error,
                })
        });

        record.duration_ms += started.elapsed().as_millis() as u64;
        if let Ok(selected) = &result {
            debug!(run_id = %self.run_id, node = %node.key, branch = ?selected, "Branch selected");
        }
        result
    }

    async fn run_gate(&self, node: &CompiledNode, record: &mut NodeRun) -> Result<Value, NodeError> {
        let input = match resolve_inputs(&node.bindings, &self.context) {
            Ok(input) => input,
            Err(e) => {
                self.start_attempt(node, record, json!({}));
                return Err(e);
            }
        };
        record.input = Some(input.clone());

        let prompt = node.gate.as_ref().and_then(|g| g.prompt.clone());
        let timeout_ms = node
            .gate
            .as_ref()
            .and_then(|g| g.timeout_ms)
            .or(self.config.default_gate_timeout_ms);

        // Register before announcing, so a host reacting to the event can
        // resume right away.
        let rx = self.gates.register(&self.run_id, &node.key, prompt.clone()).await;
        self.start_attempt(
            node,
            record,
            json!({
                "awaiting": "human_gate",
                "prompt": prompt,
                "timeout_ms": timeout_ms,
                "input": input,
            }),
        );
        info!(run_id = %self.run_id, node = %node.key, "Waiting at human gate");

        let started = Instant::now();
        let deadline = async {
            match timeout_ms {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => std::future::pending::<()>().await,
            }
        };

        let result = tokio::select! {
            resolution = rx => match resolution {
                Ok(GateResolution { decision: GateDecision::Approve, payload }) => {
                    Ok(json!({ "decision": "approve", "payload": payload }))
                }
                Ok(GateResolution { decision: GateDecision::Reject, payload }) => {
                    Err(NodeError::Rejected {
                        reason: payload.get("reason").and_then(Value::as_str).map(String::from),
                    })
                }
                Err(_) => Err(NodeError::Cancelled),
            },
            _ = self.halt.cancelled() => {
                self.gates.cancel(&self.run_id, &node.key).await;
                Err(NodeError::Cancelled)
            }
            _ = deadline => {
                self.gates.cancel(&self.run_id, &node.key).await;
                Err(NodeError::Timeout { after_ms: timeout_ms.unwrap_or_default() })
            }
        };

        record.duration_ms += started.elapsed().as_millis() as u64;
        result
    }

    async fn run_handler(&self, node: &CompiledNode, record: &mut NodeRun) -> Result<Value, NodeError> {
        let policy = node.retry;
        self.start_attempt(node, record, json!({}));
        let input = self.resolve_input(node, record)?;

        loop {
            let request = HandlerRequest {
                run_id: self.run_id.clone(),
                node_key: node.key.clone(),
                node_type: node.node_type,
                attempt: record.attempts,
                config: node.config.clone(),
                input: input.clone(),
            };

            let started = Instant::now();
            let outcome = self
                .handlers
                .invoke(request, self.cancel.child_token(), node.timeout)
                .await;
            record.duration_ms += started.elapsed().as_millis() as u64;
            record.cost += outcome.cost;

            if outcome.is_success() {
                return Ok(outcome.output);
            }

            let message = outcome.error.unwrap_or_default();
            if self.cancel.is_cancelled() {
                return Err(NodeError::Cancelled);
            }
            if !outcome.retryable {
                return Err(NodeError::execution(message, false));
            }
            if !has_attempts_left(&policy, record.attempts) {
                return Err(if policy.max_attempts > 1 {
                    NodeError::RetryExhausted {
                        attempts: record.attempts,
                        last_error: message,
                    }
                } else {
                    NodeError::execution(message, true)
                });
            }
            if self.halt.is_cancelled() {
                return Err(NodeError::Cancelled);
            }

            let delay = backoff_delay(
                &policy,
                record.attempts - 1,
                self.config.jitter,
                self.config.max_backoff_ms,
            );
            let backoff_ms = delay.as_millis() as u64;
            warn!(
                run_id = %self.run_id,
                node = %node.key,
                attempt = record.attempts,
                max_attempts = policy.max_attempts,
                backoff_ms,
                error = %message,
                "Retrying node"
            );
            record.advance(NodeStatus::Queued);
            record.backoff_ms.push(backoff_ms);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.halt.cancelled() => return Err(NodeError::Cancelled),
            }
            if self.halt.is_cancelled() {
                return Err(NodeError::Cancelled);
            }

            self.start_attempt(
                node,
                record,
                json!({ "backoff_ms": backoff_ms, "last_error": message }),
            );
        }
    }

    /// Move the record to its terminal state, emit the terminal event and,
    /// for a `fail`-policy failure, try to fail the run.
    fn settle(
        &self,
        node: &CompiledNode,
        mut record: NodeRun,
        result: Result<Value, NodeError>,
        branch: Option<String>,
    ) -> NodeOutcome {
        let mut escalated = false;

        match result {
            Ok(output) => {
                record.output = Some(output.clone());
                record.advance(NodeStatus::Completed);
                debug!(
                    run_id = %self.run_id,
                    node = %node.key,
                    attempts = record.attempts,
                    duration_ms = record.duration_ms,
                    "Node completed"
                );
                self.emit(
                    &node.key,
                    EventType::NodeCompleted,
                    json!({
                        "attempts": record.attempts,
                        "cost": record.cost,
                        "duration_ms": record.duration_ms,
                        "output": output,
                    }),
                );
            }
            Err(NodeError::Cancelled) => {
                record.error = Some(NodeError::Cancelled);
                record.advance(NodeStatus::Cancelled);
                debug!(run_id = %self.run_id, node = %node.key, "Node cancelled in flight");
                self.emit(
                    &node.key,
                    EventType::NodeCancelled,
                    json!({ "attempts": record.attempts, "error": NodeError::Cancelled }),
                );
            }
            Err(error) => {
                warn!(
                    run_id = %self.run_id,
                    node = %node.key,
                    attempts = record.attempts,
                    error = %error,
                    "Node failed"
                );
                record.error = Some(error.clone());
                record.advance(NodeStatus::Failed);
                self.emit(
                    &node.key,
                    EventType::NodeFailed,
                    json!({
                        "attempts": record.attempts,
                        "code": error.code(),
                        "error": error,
                        "on_error": node.on_error,
                    }),
                );

                if node.on_error == ErrorPolicy::Fail
                    && self
                        .status
                        .transition(RunStatus::Running, RunStatus::Failed)
                        .is_ok()
                {
                    escalated = true;
                    self.halt.cancel();
                }
            }
        }

        NodeOutcome {
            idx: self.idx,
            record,
            branch,
            escalated,
        }
    }
}
