use std::future::Future;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::types::{NodeType, RunId};

/// Everything a handler gets to know about one invocation.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub run_id: RunId,
    pub node_key: String,
    pub node_type: NodeType,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The node's type-specific configuration, as authored.
    pub config: Value,
    /// Input bindings resolved against the run context.
    pub input: Value,
}

/// What a handler reports back. `error: None` means success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub cost: f64,
    /// Transient failure, eligible for retry.
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    /// Permanent failure; bypasses any remaining retry budget.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Transient failure; retried while the node's policy allows.
    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            retryable: true,
            ..Self::default()
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Executes `agent_call` and `tool_call` nodes on behalf of the host.
///
/// Handlers should observe `cancel` and return promptly once it fires; the
/// runner never aborts a handler future itself.
pub trait NodeHandler: Send + Sync + 'static {
    fn handle(&self, request: HandlerRequest, cancel: CancellationToken) -> BoxFuture<'_, HandlerOutcome>;
}

/// Adapter that turns an async closure into a [`NodeHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`NodeHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerRequest, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    FnHandler(f)
}

impl<F, Fut> NodeHandler for FnHandler<F>
where
    F: Fn(HandlerRequest, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn handle(&self, request: HandlerRequest, cancel: CancellationToken) -> BoxFuture<'_, HandlerOutcome> {
        Box::pin((self.0)(request, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_fn_adapter() {
        let handler = handler_fn(|req: HandlerRequest, _cancel| async move {
            HandlerOutcome::success(json!({ "echo": req.input })).with_cost(0.5)
        });

        let outcome = handler
            .handle(
                HandlerRequest {
                    run_id: RunId::from("r"),
                    node_key: "a".into(),
                    node_type: NodeType::ToolCall,
                    attempt: 1,
                    config: json!({}),
                    input: json!({ "q": "rust" }),
                },
                CancellationToken::new(),
            )
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.output["echo"]["q"], "rust");
        assert_eq!(outcome.cost, 0.5);
    }

    #[test]
    fn test_outcome_constructors() {
        assert!(!HandlerOutcome::failure("bad").retryable);
        assert!(HandlerOutcome::transient("flaky").retryable);
        assert!(!HandlerOutcome::transient("flaky").is_success());
    }
}
