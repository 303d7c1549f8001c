use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use stepflow_core::traits::{HandlerOutcome, HandlerRequest, NodeHandler};
use stepflow_core::types::NodeType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a timed-out handler may keep running after its token is
/// cancelled.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// Registry of node handlers, keyed by node type.
///
/// `condition` and `human_gate` nodes are executed by the runner itself, so
/// registrations for those kinds are ignored.
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Replaces any existing handler for the same type.
    pub fn register(&mut self, node_type: NodeType, handler: impl NodeHandler) {
        self.register_arc(node_type, Arc::new(handler));
    }

    pub fn register_arc(&mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) {
        if node_type.is_builtin() {
            warn!(node_type = %node_type, "Ignoring handler for built-in node type");
            return;
        }
        if self.handlers.insert(node_type, handler).is_some() {
            debug!(node_type = %node_type, "Replaced node handler");
        }
    }

    /// Builder-style registration.
    pub fn with(mut self, node_type: NodeType, handler: impl NodeHandler) -> Self {
        self.register(node_type, handler);
        self
    }

    /// Unregister the handler for a type.
    pub fn unregister(&mut self, node_type: NodeType) -> bool {
        self.handlers.remove(&node_type).is_some()
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).cloned()
    }

    /// Registered node types, sorted.
    pub fn kinds(&self) -> Vec<NodeType> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Invoke the handler for `request.node_type`.
    ///
    /// A missing handler is a permanent failure. An elapsed `timeout` and a
    /// panicking handler are reported as failures too, so the caller always
    /// gets an outcome back. On timeout the handler's token is cancelled and
    /// the call gets a short grace period to wind down before it is dropped.
    pub async fn invoke(
        &self,
        request: HandlerRequest,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> HandlerOutcome {
        let node_type = request.node_type;
        let Some(handler) = self.get(node_type) else {
            return HandlerOutcome::failure(format!("no handler registered for {node_type} nodes"));
        };

        let signal = cancel.clone();
        let mut call = std::pin::pin!(AssertUnwindSafe(handler.handle(request, cancel)).catch_unwind());
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut call).await {
                Ok(result) => result,
                Err(_) => {
                    signal.cancel();
                    if tokio::time::timeout(TIMEOUT_GRACE, &mut call).await.is_err() {
                        warn!(node_type = %node_type, "Handler ignored cancellation after timeout");
                    }
                    return HandlerOutcome::transient(format!(
                        "handler timed out after {}ms",
                        limit.as_millis()
                    ));
                }
            },
            None => call.await,
        };

        result.unwrap_or_else(|_| HandlerOutcome::failure("handler panicked"))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
