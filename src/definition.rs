//! Immutable workflow descriptions.
//!
//! A [`WorkflowDefinition`] is a set of [`DagNode`]s with declared
//! dependencies, optional parallel-group membership, retry policy, and
//! conditional follow-up routing. Definitions are plain data: building one
//! performs no validation (see [`crate::validation::validate`]) and executing
//! one never mutates it, so any number of executions can share a definition.
//!
//! # Examples
//!
//! ```
//! use taskloom::definition::{ConditionalNext, DagNode, RetryPolicy, WorkflowDefinition};
//!
//! let definition = WorkflowDefinition::new("subsystem-audit")
//!     .add_node(DagNode::new("scan"))
//!     .add_node(
//!         DagNode::new("apply")
//!             .depends_on(["scan"])
//!             .with_retry(RetryPolicy::new(2, 500).with_backoff(2.0))
//!             .with_conditional_next(ConditionalNext::on_failure(["rollback"])),
//!     )
//!     .add_node(DagNode::new("rollback"));
//!
//! assert_eq!(definition.nodes.len(), 3);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{NodeId, WorkflowId};

/// Retry policy for a node's external execution.
///
/// The delay before attempt `n` (zero-based) is
/// `delay_ms * backoff_multiplier^n`; see [`crate::retry::retry_delay`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first failure.
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds.
    pub delay_ms: u64,
    /// Multiplier applied per retry attempt.
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_backoff() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Create a policy with a flat delay (multiplier 1.0).
    #[must_use]
    pub fn new(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            delay_ms,
            backoff_multiplier: 1.0,
        }
    }

    /// Set the exponential backoff multiplier.
    #[must_use]
    pub fn with_backoff(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }
}

/// Conditional follow-up routing evaluated when a node reaches a terminal
/// outcome.
///
/// Listed ids are added to the execution's unlock set: `on_success` ids when
/// the node completes successfully, `on_failure` ids when it fails with no
/// retry budget left. An unlocked node becomes ready regardless of its own
/// `depends_on` entries; this is what gives branches their escape route past
/// a failed predecessor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalNext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<NodeId>,
}

impl ConditionalNext {
    /// Routing that unlocks the given ids on success only.
    #[must_use]
    pub fn on_success<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            on_success: ids.into_iter().map(Into::into).collect(),
            on_failure: Vec::new(),
        }
    }

    /// Routing that unlocks the given ids on failure only.
    #[must_use]
    pub fn on_failure<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            on_success: Vec::new(),
            on_failure: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Extend this routing with success targets.
    #[must_use]
    pub fn and_on_success<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.on_success.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Extend this routing with failure targets.
    #[must_use]
    pub fn and_on_failure<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.on_failure.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// Static specification of one unit of work in a workflow.
///
/// The `payload` is opaque to the scheduler: it is carried on
/// [`Event::NodeReady`](crate::event_bus::Event::NodeReady) for the external
/// executor to interpret and never inspected here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    /// Unique id within the definition.
    pub id: NodeId,
    /// Ids that must reach `Completed` with `success = true` before this node
    /// becomes ready through the default path.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<NodeId>,
    /// Optional label marking nodes intended to be released together rather
    /// than strictly sequentially. A scheduling hint for the external runner;
    /// members whose dependencies resolve in the same readiness pass are
    /// released in that pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_next: Option<ConditionalNext>,
    /// Opaque task payload for the external executor.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl DagNode {
    /// Create a node with no dependencies, no retry policy, and no routing.
    #[must_use]
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            parallel_group: None,
            retry_policy: None,
            conditional_next: None,
            payload: Value::Null,
        }
    }

    /// Declare dependencies that must complete successfully first.
    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Tag this node with a parallel-group label.
    #[must_use]
    pub fn in_parallel_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    /// Attach a retry policy.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Attach conditional follow-up routing.
    #[must_use]
    pub fn with_conditional_next(mut self, next: ConditionalNext) -> Self {
        self.conditional_next = Some(next);
        self
    }

    /// Attach an opaque payload for the external executor.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// An immutable DAG of [`DagNode`]s.
///
/// Invariant (enforced by [`crate::validation::validate`], checked again by
/// the orchestrator constructor): node ids are unique, every referenced id
/// exists, and the `depends_on` edges form no cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub nodes: Vec<DagNode>,
}

impl WorkflowDefinition {
    /// Create an empty definition.
    #[must_use]
    pub fn new(id: impl Into<WorkflowId>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
        }
    }

    /// Append a node. Definition order is preserved and determines event
    /// emission order within a readiness pass.
    #[must_use]
    pub fn add_node(mut self, node: DagNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
