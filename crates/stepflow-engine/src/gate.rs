use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::types::RunId;

/// A host's verdict on a waiting human gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateDecision {
    Approve,
    Reject,
}

/// What a resumed gate receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResolution {
    pub decision: GateDecision,
    #[serde(default)]
    pub payload: Value,
}

/// A human gate currently waiting for a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingGate {
    pub run_id: RunId,
    pub node_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub requested_at: DateTime<Utc>,
}

type GateKey = (RunId, String);

/// Tracks waiting human gates and hands host decisions to them through
/// oneshot channels.
pub struct GateBroker {
    pending: Mutex<HashMap<GateKey, (PendingGate, oneshot::Sender<GateResolution>)>>,
}

impl GateBroker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiting gate and return the receiver to await.
    pub async fn register(
        &self,
        run_id: &RunId,
        node_key: &str,
        prompt: Option<String>,
    ) -> oneshot::Receiver<GateResolution> {
        let (tx, rx) = oneshot::channel();
        let gate = PendingGate {
            run_id: run_id.clone(),
            node_key: node_key.to_string(),
            prompt,
            requested_at: Utc::now(),
        };
        debug!(run_id = %run_id, node = %node_key, "Human gate registered");
        self.pending
            .lock()
            .await
            .insert((run_id.clone(), node_key.to_string()), (gate, tx));
        rx
    }

    /// Resolve a waiting gate. Fails with `GateNotPending` when nothing is
    /// waiting under that key.
    pub async fn resume(
        &self,
        run_id: &RunId,
        node_key: &str,
        decision: GateDecision,
        payload: Value,
    ) -> Result<()> {
        let entry = self
            .pending
            .lock()
            .await
            .remove(&(run_id.clone(), node_key.to_string()));

        let Some((_gate, tx)) = entry else {
            return Err(StepflowError::GateNotPending {
                run_id: run_id.to_string(),
                node_key: node_key.to_string(),
            });
        };

        info!(run_id = %run_id, node = %node_key, ?decision, "Human gate resolved");
        // The waiter may have timed out or been cancelled in the meantime.
        tx.send(GateResolution { decision, payload })
            .map_err(|_| StepflowError::GateNotPending {
                run_id: run_id.to_string(),
                node_key: node_key.to_string(),
            })
    }

    /// Drop a waiting gate without resolving it.
    pub async fn cancel(&self, run_id: &RunId, node_key: &str) -> bool {
        self.pending
            .lock()
            .await
            .remove(&(run_id.clone(), node_key.to_string()))
            .is_some()
    }

    /// Every gate currently waiting, oldest first.
    pub async fn pending(&self) -> Vec<PendingGate> {
        let mut gates: Vec<_> = self
            .pending
            .lock()
            .await
            .values()
            .map(|(gate, _)| gate.clone())
            .collect();
        gates.sort_by_key(|g| g.requested_at);
        gates
    }

    pub async fn pending_for(&self, run_id: &RunId) -> Vec<PendingGate> {
        self.pending()
            .await
            .into_iter()
            .filter(|g| &g.run_id == run_id)
            .collect()
    }
}

impl Default for GateBroker {
    fn default() -> Self {
        Self::new()
    }
}
