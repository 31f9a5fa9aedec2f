use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::executor::script::{Script, ScriptHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Free,
    Busy,
    Down,
    Locked,
    ToBeReleased,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Free => write!(f, "free"),
            NodeState::Busy => write!(f, "busy"),
            NodeState::Down => write!(f, "down"),
            NodeState::Locked => write!(f, "locked"),
            NodeState::ToBeReleased => write!(f, "to_be_released"),
        }
    }
}

/// One allocatable compute node. Identity is its URL; a node is BUSY for at
/// most one allocation at a time and its transitions are serialized by the
/// pool lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmNode {
    pub url: String,
    pub source: String,
    pub state: NodeState,
    /// Reservation token of the current allocation, while BUSY.
    pub owner: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl RmNode {
    pub fn new(url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source: source.into(),
            state: NodeState::Free,
            owner: None,
            registered_at: Utc::now(),
            last_heartbeat: None,
        }
    }
}

/// Client interface to a node: liveness via explicit heartbeat RPC, and
/// remote evaluation of dynamic selection scripts. Node identity is a plain
/// addressable URL behind this interface.
pub trait NodeClient: Send + Sync + 'static {
    /// Evaluates a selection script on the node. `Ok(true)` means eligible.
    fn execute_script(
        &self,
        node_url: &str,
        script: &Script,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn heartbeat(&self, node_url: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Runs selection scripts in a local shell with the candidate node's URL
/// bound as `GS_NODE_URL`. Exit 0 means eligible. Used for single-host
/// deployments and tests; a remoting client implements the same contract.
#[derive(Debug, Clone, Default)]
pub struct LocalNodeClient;

impl NodeClient for LocalNodeClient {
    async fn execute_script(&self, node_url: &str, script: &Script) -> Result<bool> {
        let mut handler = ScriptHandler::new();
        handler.add_binding("GS_NODE_URL", node_url);
        let result = handler
            .handle(script, None, &tokio_util::sync::CancellationToken::new())
            .await;
        if let Some(error) = &result.error {
            return Err(crate::error::SchedulerError::NoConnection(error.clone()));
        }
        Ok(result.exit_code == Some(0))
    }

    async fn heartbeat(&self, _node_url: &str) -> Result<()> {
        Ok(())
    }
}
