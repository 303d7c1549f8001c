use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::json;
use stepflow_core::traits::{handler_fn, HandlerOutcome, HandlerRequest, NodeHandler};
use tokio_util::sync::CancellationToken;

/// Returns the resolved input unchanged.
pub fn echo_handler() -> impl NodeHandler {
    handler_fn(|req: HandlerRequest, _cancel| async move { HandlerOutcome::success(req.input) })
}

/// Returns `{"node": key, "input": input}` with a fixed cost.
pub fn tagging_handler(cost: f64) -> impl NodeHandler {
    handler_fn(move |req: HandlerRequest, _cancel| async move {
        HandlerOutcome::success(json!({ "node": req.node_key, "input": req.input })).with_cost(cost)
    })
}

/// Fails every attempt with a retryable error.
pub fn transient_failure_handler(message: &'static str) -> impl NodeHandler {
    handler_fn(move |_req: HandlerRequest, _cancel| async move { HandlerOutcome::transient(message) })
}

/// Fails every attempt with a permanent error.
pub fn permanent_failure_handler(message: &'static str) -> impl NodeHandler {
    handler_fn(move |_req: HandlerRequest, _cancel| async move { HandlerOutcome::failure(message) })
}

/// Fails transiently for the first `failures` attempts, then echoes.
pub fn flaky_handler(failures: u32) -> impl NodeHandler {
    handler_fn(move |req: HandlerRequest, _cancel| async move {
        if req.attempt <= failures {
            HandlerOutcome::transient(format!("attempt {} failed", req.attempt))
        } else {
            HandlerOutcome::success(req.input)
        }
    })
}

/// Sleeps for `delay` unless cancelled first, then echoes. A cancelled call
/// reports a retryable failure, the way a well-behaved handler would.
pub fn slow_handler(delay: Duration) -> impl NodeHandler {
    handler_fn(move |req: HandlerRequest, cancel: CancellationToken| async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => HandlerOutcome::success(req.input),
            _ = cancel.cancelled() => HandlerOutcome::transient("cancelled"),
        }
    })
}

/// Handler that plays back a queue of outcomes and records when it was
/// called.
///
/// Once the script runs out it keeps returning the fallback outcome.
pub struct ScriptedHandler {
    script: Mutex<VecDeque<HandlerOutcome>>,
    fallback: HandlerOutcome,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedHandler {
    pub fn new(script: Vec<HandlerOutcome>, fallback: HandlerOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always returns `outcome`.
    pub fn always(outcome: HandlerOutcome) -> Self {
        Self::new(Vec::new(), outcome)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Gaps between consecutive calls.
    pub fn gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock().unwrap();
        calls.windows(2).map(|w| w[1].duration_since(w[0])).collect()
    }
}

impl NodeHandler for ScriptedHandler {
    fn handle(&self, _request: HandlerRequest, _cancel: CancellationToken) -> BoxFuture<'_, HandlerOutcome> {
        self.calls.lock().unwrap().push(Instant::now());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Box::pin(async move { outcome })
    }
}
