use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use stepflow_core::config::RunnerConfig;
use stepflow_core::error::{NodeError, ValidationError, ValidationErrorKind};
use stepflow_core::event::{EventBus, EventType};
use stepflow_core::traits::HandlerOutcome;
use stepflow_core::types::{NodeStatus, NodeType, RunStatus, SkipReason, WorkflowDefinition};
use stepflow_engine::{compile, CompiledWorkflow, GateBroker, HandlerRegistry, RunLogger, WorkflowRunner};
use stepflow_test_utils::{
    branching_workflow, diamond_workflow, echo_handler, linear_workflow, tagging_handler,
    CollectingSink, ScriptedHandler,
};

fn definition(json: Value) -> WorkflowDefinition {
    WorkflowDefinition::from_json(&json.to_string()).expect("parse definition")
}

fn compiled(def: WorkflowDefinition) -> Arc<CompiledWorkflow> {
    Arc::new(compile(def).expect("compile"))
}

fn tagging_runner(sink: Arc<CollectingSink>) -> WorkflowRunner {
    let registry = HandlerRegistry::new()
        .with(NodeType::AgentCall, tagging_handler(0.25))
        .with(NodeType::ToolCall, tagging_handler(0.5));
    WorkflowRunner::new(
        Arc::new(registry),
        sink,
        Arc::new(GateBroker::new()),
        RunnerConfig::default(),
    )
}

fn echo_runner() -> WorkflowRunner {
    let registry = HandlerRegistry::new()
        .with(NodeType::AgentCall, echo_handler())
        .with(NodeType::ToolCall, echo_handler());
    WorkflowRunner::new(
        Arc::new(registry),
        Arc::new(CollectingSink::new()),
        Arc::new(GateBroker::new()),
        RunnerConfig::default(),
    )
}

fn position(sink: &CollectingSink, key: &str, event_type: EventType) -> usize {
    sink.events()
        .iter()
        .position(|e| e.node_key.as_deref() == Some(key) && e.event_type == event_type)
        .unwrap_or_else(|| panic!("no {event_type:?} for {key}"))
}

fn chain(keys: &[&str]) -> Value {
    let nodes: Vec<Value> = keys
        .iter()
        .map(|k| json!({ "key": k, "type": "tool_call", "config": { "tool": "t" } }))
        .collect();
    let edges: Vec<Value> = keys
        .windows(2)
        .map(|w| json!({ "from": w[0], "to": w[1] }))
        .collect();
    json!({ "id": "chain", "version": 1, "nodes": nodes, "edges": edges })
}

#[tokio::test]
async fn test_scenario_a_linear() {
    let workflow = compiled(definition(chain(&["A", "B", "C"])));
    assert_eq!(workflow.levels(), vec![vec!["A"], vec!["B"], vec!["C"]]);

    let sink = Arc::new(CollectingSink::new());
    let result = tagging_runner(sink.clone())
        .execute(workflow, json!({}), CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.succeeded());
    let completed: Vec<String> = sink
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::NodeCompleted)
        .filter_map(|e| e.node_key)
        .collect();
    assert_eq!(completed, vec!["A", "B", "C"]);
    assert_eq!(result.outputs.keys().collect::<Vec<_>>(), vec!["C"]);
    assert_eq!(result.total_cost, 1.5);
}

#[tokio::test]
async fn test_scenario_b_parallel_join() {
    let workflow = compiled(definition(json!({
        "id": "join",
        "version": 1,
        "nodes": [
            { "key": "A", "type": "agent_call", "config": { "agent": "a" } },
            { "key": "B", "type": "tool_call", "config": { "tool": "b" }, "input_bindings": { "x": "$A" } },
            { "key": "C", "type": "tool_call", "config": { "tool": "c" }, "input_bindings": { "x": "$A" } },
            { "key": "D", "type": "agent_call", "config": { "agent": "d" },
              "input_bindings": { "left": "$B.node", "right": "$C.node" } }
        ],
        "edges": [
            { "from": "A", "to": "B" },
            { "from": "A", "to": "C" },
            { "from": "B", "to": "D" },
            { "from": "C", "to": "D" }
        ]
    })));
    assert_eq!(workflow.levels(), vec![vec!["A"], vec!["B", "C"], vec!["D"]]);

    let sink = Arc::new(CollectingSink::new());
    let result = tagging_runner(sink.clone())
        .execute(workflow, json!({}), CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    let d_queued = position(&sink, "D", EventType::NodeQueued);
    assert!(position(&sink, "B", EventType::NodeCompleted) < d_queued);
    assert!(position(&sink, "C", EventType::NodeCompleted) < d_queued);
    assert_eq!(
        result.outputs["D"],
        json!({ "node": "D", "input": { "left": "B", "right": "C" } })
    );
}

#[test]
fn test_scenario_c_cycle() {
    let def = definition(json!({
        "id": "cycle",
        "version": 1,
        "nodes": [
            { "key": "A", "type": "tool_call", "config": { "tool": "a" } },
            { "key": "B", "type": "tool_call", "config": { "tool": "b" } }
        ],
        "edges": [ { "from": "A", "to": "B" }, { "from": "B", "to": "A" } ]
    }));

    let err = compile(def).unwrap_err();
    assert!(err.has_kind(ValidationErrorKind::Cycle));
    let path = err
        .errors
        .iter()
        .find_map(|e| match e {
            ValidationError::Cycle { path } => Some(path.clone()),
            _ => None,
        })
        .expect("cycle error");
    assert!(path.iter().any(|k| k == "A" || k == "B"));
}

#[test]
fn test_scenario_d_unreachable() {
    let def = definition(json!({
        "id": "island",
        "version": 1,
        "nodes": [
            { "key": "A", "type": "tool_call", "config": { "tool": "a" } },
            { "key": "B", "type": "tool_call", "config": { "tool": "b" } },
            { "key": "C", "type": "tool_call", "config": { "tool": "c" } }
        ],
        "edges": [ { "from": "A", "to": "B" } ]
    }));

    let err = compile(def).unwrap_err();
    assert!(err
        .errors
        .contains(&ValidationError::Unreachable { node: "C".into() }));
}

#[tokio::test]
async fn test_scenario_e_conditional_skip() {
    let workflow = compiled(definition(json!({
        "id": "branch",
        "version": 1,
        "nodes": [
            { "key": "A", "type": "condition", "config": { "branches": [
                { "label": "yes", "when": "$context.answer == \"yes\"" },
                { "label": "no", "when": "$context.answer == \"no\"" }
            ] } },
            { "key": "B", "type": "tool_call", "config": { "tool": "b" } },
            { "key": "C", "type": "tool_call", "config": { "tool": "c" } },
            { "key": "D", "type": "tool_call", "config": { "tool": "d" } }
        ],
        "edges": [
            { "from": "A", "to": "B", "condition": "yes" },
            { "from": "A", "to": "C", "condition": "no" },
            { "from": "B", "to": "D" }
        ]
    })));

    let sink = Arc::new(CollectingSink::new());
    let result = tagging_runner(sink.clone())
        .execute(workflow, json!({ "answer": "no" }), CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert!(!result.partial);
    assert_eq!(result.node("A").unwrap().output, Some(json!({ "branch": "no" })));
    assert_eq!(result.node_status("C"), Some(NodeStatus::Completed));

    let b = result.node("B").unwrap();
    assert_eq!(b.status, NodeStatus::Skipped);
    assert_eq!(b.skip_reason, Some(SkipReason::BranchNotTaken));
    // The skip carries through nodes that only hang off the dead branch.
    assert_eq!(result.node("D").unwrap().skip_reason, Some(SkipReason::BranchNotTaken));
    assert_eq!(sink.node_events("B"), vec![EventType::NodeSkipped]);
    assert_eq!(result.outputs.keys().collect::<Vec<_>>(), vec!["C"]);
}

#[tokio::test]
async fn test_scenario_f_retry_then_fail() {
    let workflow = compiled(definition(json!({
        "id": "retry",
        "version": 1,
        "nodes": [
            { "key": "A", "type": "tool_call", "config": { "tool": "a" },
              "retry": { "max_attempts": 3, "base_delay_ms": 20, "multiplier": 3.0 } }
        ],
        "edges": []
    })));
    let handler = Arc::new(ScriptedHandler::always(
        HandlerOutcome::transient("upstream 503").with_cost(0.1),
    ));
    let mut registry = HandlerRegistry::new();
    registry.register_arc(NodeType::ToolCall, handler.clone());
    let sink = Arc::new(CollectingSink::new());
    let runner = WorkflowRunner::new(
        Arc::new(registry),
        sink.clone(),
        Arc::new(GateBroker::new()),
        RunnerConfig::default(),
    );

    let result = runner.execute(workflow, json!({}), CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Failed);
    let a = result.node("A").unwrap();
    assert_eq!(a.status, NodeStatus::Failed);
    assert_eq!(a.attempts, 3);
    assert_eq!(a.backoff_ms, vec![20, 60]);
    assert!((a.cost - 0.3).abs() < 1e-9);
    assert_eq!(
        a.error,
        Some(NodeError::RetryExhausted {
            attempts: 3,
            last_error: "upstream 503".into()
        })
    );
    assert_eq!(handler.call_count(), 3);
    let cause = result.cause.expect("failed run has a cause");
    assert_eq!(cause.node_key, "A");

    let retry = sink
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::NodeRunning)
        .map(|e| e.payload["backoff_ms"].clone())
        .collect::<Vec<_>>();
    assert_eq!(retry, vec![Value::Null, json!(20), json!(60)]);
}

#[tokio::test]
async fn test_fixture_workflows_run_to_completion() {
    for (def, input, terminal) in [
        (linear_workflow(), json!({ "x": 1 }), "c"),
        (diamond_workflow(), json!({}), "d"),
        (branching_workflow(), json!({ "score": 80 }), "high"),
    ] {
        let result = echo_runner()
            .execute(compiled(def), input, CancellationToken::new())
            .await;
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.outputs.contains_key(terminal), "missing output {terminal}");
    }
}

#[tokio::test]
async fn test_branching_default_label() {
    let result = echo_runner()
        .execute(compiled(branching_workflow()), json!({ "score": 10 }), CancellationToken::new())
        .await;

    assert_eq!(result.node("route").unwrap().output, Some(json!({ "branch": "low" })));
    assert_eq!(result.node_status("high"), Some(NodeStatus::Skipped));
    assert_eq!(result.node_status("low"), Some(NodeStatus::Completed));
    assert_eq!(result.outputs["low"], json!({ "score": 10 }));
}

#[tokio::test]
async fn test_event_ordering_per_node() {
    let sink = Arc::new(CollectingSink::new());
    tagging_runner(sink.clone())
        .execute(compiled(diamond_workflow()), json!({}), CancellationToken::new())
        .await;

    for key in ["a", "b", "c", "d"] {
        assert_eq!(
            sink.node_events(key),
            vec![EventType::NodeQueued, EventType::NodeRunning, EventType::NodeCompleted],
            "events for {key}"
        );
    }
    assert_eq!(sink.run_events(), vec![EventType::RunStarted, EventType::RunCompleted]);
    assert_eq!(sink.event_types().first(), Some(&EventType::RunStarted));
    assert_eq!(sink.event_types().last(), Some(&EventType::RunCompleted));
}

#[tokio::test]
async fn test_compiled_workflow_is_shared_across_runs() {
    let workflow = compiled(linear_workflow());
    let runner = Arc::new(tagging_runner(Arc::new(CollectingSink::new())));

    let mut handles = Vec::new();
    for x in 0..4 {
        let runner = runner.clone();
        let workflow = workflow.clone();
        handles.push(tokio::spawn(async move {
            runner
                .execute(workflow, json!({ "x": x }), CancellationToken::new())
                .await
        }));
    }

    let mut run_ids = HashSet::new();
    for (x, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.node("a").unwrap().input, Some(json!({ "x": x })));
        run_ids.insert(result.run_id);
    }
    assert_eq!(run_ids.len(), 4);
}

#[tokio::test]
async fn test_run_log_records_every_event() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let bus = Arc::new(EventBus::new(64));
    let registry = HandlerRegistry::new()
        .with(NodeType::AgentCall, tagging_handler(0.0))
        .with(NodeType::ToolCall, tagging_handler(0.0));
    let runner = WorkflowRunner::new(
        Arc::new(registry),
        bus.clone(),
        Arc::new(GateBroker::new()),
        RunnerConfig::default(),
    );

    let run_id = stepflow_core::types::RunId::new();
    let logger = RunLogger::new(dir.path().to_path_buf());
    let path = logger.log_path(&run_id);
    let log_task = tokio::spawn(logger.run(bus.subscribe(), run_id.clone(), CancellationToken::new()));

    runner
        .execute_with_id(run_id, compiled(linear_workflow()), json!({ "x": 1 }), CancellationToken::new())
        .await;
    log_task.await.unwrap();

    let content = std::fs::read_to_string(path).unwrap();
    let lines: Vec<Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    // run_started, 3 x (queued, running, completed), run_completed
    assert_eq!(lines.len(), 11);
    assert_eq!(lines[0]["event_type"], "run_started");
    assert_eq!(lines[10]["event_type"], "run_completed");
}
