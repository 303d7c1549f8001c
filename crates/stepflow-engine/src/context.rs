use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Accumulated data of one run: the initial input plus every completed
/// node's output, keyed by node key.
///
/// Node tasks only ever read a snapshot of this; the runner records a node's
/// output once, after the level containing it has settled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    input: Value,
    outputs: HashMap<String, Value>,
}

impl RunContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            outputs: HashMap::new(),
        }
    }

    /// The run's initial input (`$context`).
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// A node's recorded output (`$<node>`).
    pub fn output(&self, node_key: &str) -> Option<&Value> {
        self.outputs.get(node_key)
    }

    pub fn has_output(&self, node_key: &str) -> bool {
        self.outputs.contains_key(node_key)
    }

    /// Record a node's output. Each node writes its entry exactly once.
    pub fn record(&mut self, node_key: impl Into<String>, output: Value) {
        let key = node_key.into();
        if self.outputs.contains_key(&key) {
            warn!(node = %key, "Overwriting an already recorded node output");
        }
        self.outputs.insert(key, output);
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_read() {
        let mut ctx = RunContext::new(json!({ "topic": "rust" }));
        assert_eq!(ctx.input()["topic"], "rust");
        assert!(!ctx.has_output("a"));

        ctx.record("a", json!({ "hits": 3 }));
        assert!(ctx.has_output("a"));
        assert_eq!(ctx.output("a").unwrap()["hits"], 3);
        assert_eq!(ctx.outputs().len(), 1);
    }
}
