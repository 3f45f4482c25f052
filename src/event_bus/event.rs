use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::definition::DagNode;
use crate::state::WorkflowExecution;
use crate::types::NodeId;

/// Typed event emitted by the orchestrator.
///
/// `NodeReady` is a dispatch request: the external executor should run the
/// carried node's payload and report back. The `workflow:*` variants carry a
/// full execution snapshot so consumers never need to query the orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A node's preconditions are satisfied; dispatch it.
    NodeReady { node_id: NodeId, node: DagNode },
    /// A failed node was granted a retry, due after `delay_ms`.
    NodeRetry {
        node_id: NodeId,
        retry_count: u32,
        delay_ms: u64,
    },
    /// Execution state changed: a node was released, started, or scheduled
    /// for retry, or the run was cancelled. Completion and failure have
    /// dedicated variants; cancellation is announced here with the carried
    /// snapshot's status set to `Cancelled`.
    Progress { execution: WorkflowExecution },
    /// Every node is terminal and none failed.
    Completed { execution: WorkflowExecution },
    /// At least one node failed with no remaining escape route.
    Failed { execution: WorkflowExecution },
}

impl Event {
    /// Wire-style label for the event kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::NodeReady { .. } => "node:ready",
            Event::NodeRetry { .. } => "node:retry",
            Event::Progress { .. } => "workflow:progress",
            Event::Completed { .. } => "workflow:completed",
            Event::Failed { .. } => "workflow:failed",
        }
    }

    /// The node this event concerns, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Event::NodeReady { node_id, .. } | Event::NodeRetry { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Convert to a normalized JSON object:
    ///
    /// ```json
    /// {
    ///   "type": "node:ready",
    ///   "timestamp": "2026-08-30T12:34:56.789Z",
    ///   "payload": { /* variant fields */ }
    /// }
    /// ```
    #[must_use]
    pub fn to_json_value(&self) -> Value {
        let payload = match self {
            Event::NodeReady { node_id, node } => json!({
                "node_id": node_id,
                "node": node,
            }),
            Event::NodeRetry {
                node_id,
                retry_count,
                delay_ms,
            } => json!({
                "node_id": node_id,
                "retry_count": retry_count,
                "delay_ms": delay_ms,
            }),
            Event::Progress { execution }
            | Event::Completed { execution }
            | Event::Failed { execution } => json!({
                "execution": execution,
            }),
        };
        json!({
            "type": self.kind(),
            "timestamp": Utc::now().to_rfc3339(),
            "payload": payload,
        })
    }

    /// Compact JSON string form of [`to_json_value`](Self::to_json_value).
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::NodeReady { node_id, .. } => write!(f, "[node:ready] {node_id}"),
            Event::NodeRetry {
                node_id,
                retry_count,
                delay_ms,
            } => write!(
                f,
                "[node:retry] {node_id} attempt={retry_count} delay_ms={delay_ms}"
            ),
            Event::Progress { execution } => write!(
                f,
                "[workflow:progress] {} {}",
                execution.id, execution.current_step_label
            ),
            Event::Completed { execution } => write!(
                f,
                "[workflow:completed] {} ({}/{} nodes)",
                execution.id, execution.completed_nodes, execution.total_nodes
            ),
            Event::Failed { execution } => write!(
                f,
                "[workflow:failed] {} ({} failed)",
                execution.id, execution.failed_nodes
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DagNode, WorkflowDefinition};

    fn ready_event() -> Event {
        Event::NodeReady {
            node_id: "build".into(),
            node: DagNode::new("build"),
        }
    }

    #[test]
    fn kind_labels_match_taxonomy() {
        let definition = WorkflowDefinition::new("wf").add_node(DagNode::new("build"));
        let execution = WorkflowExecution::new("run-1", &definition);
        assert_eq!(ready_event().kind(), "node:ready");
        assert_eq!(
            Event::NodeRetry {
                node_id: "build".into(),
                retry_count: 1,
                delay_ms: 100
            }
            .kind(),
            "node:retry"
        );
        assert_eq!(Event::Progress { execution: execution.clone() }.kind(), "workflow:progress");
        assert_eq!(Event::Completed { execution: execution.clone() }.kind(), "workflow:completed");
        assert_eq!(Event::Failed { execution }.kind(), "workflow:failed");
    }

    #[test]
    fn json_value_has_normalized_shape() {
        let value = ready_event().to_json_value();
        assert_eq!(value["type"], "node:ready");
        assert_eq!(value["payload"]["node_id"], "build");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn display_includes_node_id() {
        assert_eq!(ready_event().to_string(), "[node:ready] build");
    }

    #[test]
    fn serde_round_trip() {
        let event = Event::NodeRetry {
            node_id: "build".into(),
            retry_count: 2,
            delay_ms: 400,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
