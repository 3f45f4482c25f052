//! Per-run execution state.
//!
//! A [`WorkflowExecution`] is the single mutable record of one run: one
//! [`NodeState`] per node plus run-level aggregates. It is owned exclusively
//! by the orchestrator that produced it and mutated only through orchestrator
//! methods; callers read clones. All types derive serde so a hosting layer can
//! persist snapshots for crash recovery; the orchestrator itself persists
//! nothing.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::definition::WorkflowDefinition;
use crate::types::{ExecutionId, NodeId, SessionHandle, WorkflowId};

/// Lifecycle status of a single node within a run.
///
/// Transitions are monotonic: `Pending → Queued → Running → {Completed |
/// Retrying → Queued | Failed}`, plus `Pending → Skipped` (blocked or run
/// cancelled) and `Queued | Running → Skipped` (run cancelled). Once a node is
/// terminal no further transition is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Retrying,
    Skipped,
}

impl NodeStatus {
    /// Terminal statuses accept no further transitions for the run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Skipped => "skipped",
        };
        write!(f, "{label}")
    }
}

/// Runtime record for one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub retry_count: u32,
    /// Opaque handle recorded when the external executor dispatches the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_handle: Option<SessionHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set exactly once, when a terminal outcome is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeState {
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            retry_count: 0,
            session_handle: None,
            started_at: None,
            completed_at: None,
            success: None,
            error: None,
        }
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::pending()
    }
}

/// Run-level status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal run statuses; the execution becomes immutable once reached.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// One run of a workflow definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub node_states: FxHashMap<NodeId, NodeState>,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub running_node_ids: Vec<NodeId>,
    /// Human-readable progress summary, refreshed on every state change.
    pub current_step_label: String,
}

impl WorkflowExecution {
    /// Create an idle execution with every node pending.
    #[must_use]
    pub fn new(id: impl Into<ExecutionId>, definition: &WorkflowDefinition) -> Self {
        let node_states = definition
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::pending()))
            .collect();
        Self {
            id: id.into(),
            workflow_id: definition.id.clone(),
            status: ExecutionStatus::Idle,
            node_states,
            total_nodes: definition.nodes.len(),
            completed_nodes: 0,
            failed_nodes: 0,
            running_node_ids: Vec::new(),
            current_step_label: "waiting to start".to_string(),
        }
    }

    /// Status of one node, if it exists in this run.
    #[must_use]
    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_states.get(node_id).map(|s| s.status)
    }

    /// Count nodes currently in the given status.
    #[must_use]
    pub fn count_in_status(&self, status: NodeStatus) -> usize {
        self.node_states
            .values()
            .filter(|s| s.status == status)
            .count()
    }

    /// True when every node has reached a terminal status.
    #[must_use]
    pub fn all_nodes_terminal(&self) -> bool {
        self.node_states.values().all(|s| s.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DagNode;

    fn sample_execution() -> WorkflowExecution {
        let definition = WorkflowDefinition::new("wf")
            .add_node(DagNode::new("a"))
            .add_node(DagNode::new("b").depends_on(["a"]));
        WorkflowExecution::new("run-1", &definition)
    }

    #[test]
    fn new_execution_is_idle_with_pending_nodes() {
        let execution = sample_execution();
        assert_eq!(execution.status, ExecutionStatus::Idle);
        assert_eq!(execution.total_nodes, 2);
        assert_eq!(execution.count_in_status(NodeStatus::Pending), 2);
        assert_eq!(execution.node_status("a"), Some(NodeStatus::Pending));
        assert!(!execution.all_nodes_terminal());
    }

    #[test]
    fn terminal_status_classification() {
        for status in [NodeStatus::Completed, NodeStatus::Failed, NodeStatus::Skipped] {
            assert!(status.is_terminal());
        }
        for status in [
            NodeStatus::Pending,
            NodeStatus::Queued,
            NodeStatus::Running,
            NodeStatus::Retrying,
        ] {
            assert!(!status.is_terminal());
        }
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }

    #[test]
    fn snapshot_serde_round_trip() {
        let execution = sample_execution();
        let json = serde_json::to_string(&execution).unwrap();
        let back: WorkflowExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(back, execution);
    }

    #[test]
    fn status_labels_are_snake_case() {
        assert_eq!(
            serde_json::to_value(NodeStatus::Retrying).unwrap(),
            serde_json::json!("retrying")
        );
        assert_eq!(ExecutionStatus::Running.to_string(), "running");
    }
}
