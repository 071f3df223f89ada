use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Started,
    Completed,
    Failed,
}

/// One node execution inside an invocation: timing, outcome, and the state
/// snapshots either side of the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTrace {
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: NodeStatus,
    pub state_before: serde_json::Value,
    pub state_after: serde_json::Value,
    pub error: Option<String>,
}

/// Per-invocation trace, written under `logs/` by the pipeline drivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub graph: String,
    pub invoked_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub nodes: Vec<NodeTrace>,
}

impl ExecutionTrace {
    pub(crate) fn new(graph: &str) -> Self {
        Self {
            graph: graph.to_string(),
            invoked_at: Utc::now(),
            total_duration_ms: 0,
            nodes: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, node: NodeTrace) {
        self.nodes.push(node);
    }

    /// Node names in execution order.
    pub fn path(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.node.as_str()).collect()
    }

    pub fn visited(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n.node == node)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Best-effort persistence; callers log and ignore failures.
    pub fn write_to(&self, dir: impl AsRef<Path>) -> std::io::Result<std::path::PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let file = dir.join(format!(
            "{}_{}.json",
            self.graph,
            self.invoked_at.format("%Y%m%d_%H%M%S_%3f")
        ));
        let payload = serde_json::to_string_pretty(&self.to_json())?;
        std::fs::write(&file, payload)?;
        Ok(file)
    }
}
