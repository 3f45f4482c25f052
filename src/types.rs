//! Identifier aliases shared across the crate.
//!
//! All identifiers arrive from the external definition layer as strings, so
//! they stay plain `String` aliases rather than newtypes. The aliases exist to
//! keep signatures self-describing: a `FxHashMap<NodeId, NodeState>` reads
//! better than a map of bare strings.

/// Unique identifier of a node within a workflow definition.
pub type NodeId = String;

/// Identifier of a workflow definition.
pub type WorkflowId = String;

/// Identifier of one execution (run) of a workflow.
pub type ExecutionId = String;

/// Opaque handle assigned by the external executor when a node is dispatched.
pub type SessionHandle = String;
