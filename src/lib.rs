//! # Taskloom: DAG Workflow Orchestration
//!
//! Taskloom sequences a batch of otherwise-independent tasks as a directed
//! acyclic graph: dependency-aware release, concurrent dispatch of independent
//! nodes, retry with exponential backoff, and conditional routing to different
//! follow-up nodes depending on success or failure.
//!
//! The orchestrator executes no task work itself. It is a state machine driven
//! by caller commands and retry-timer expirations, with one output stream of
//! typed events. An external executor consumes
//! [`Event::NodeReady`](event_bus::Event::NodeReady) notifications, performs
//! the node's payload action, and reports back through
//! [`mark_node_running`](orchestrator::Orchestrator::mark_node_running) and
//! [`mark_node_completed`](orchestrator::Orchestrator::mark_node_completed).
//!
//! ## Quick Start
//!
//! ```
//! use taskloom::definition::{DagNode, WorkflowDefinition};
//! use taskloom::orchestrator::Orchestrator;
//!
//! let definition = WorkflowDefinition::new("deploy")
//!     .add_node(DagNode::new("build"))
//!     .add_node(DagNode::new("test").depends_on(["build"]))
//!     .add_node(DagNode::new("ship").depends_on(["test"]));
//!
//! let (tx, rx) = flume::unbounded();
//! let mut orch = Orchestrator::new(definition, "run-1", tx).unwrap();
//! orch.start().unwrap();
//!
//! // The external executor now receives a NodeReady event for "build",
//! // dispatches it, and reports back:
//! orch.mark_node_running("build", "session-42").unwrap();
//! orch.mark_node_completed("build", true).unwrap();
//! # drop(rx);
//! ```
//!
//! ## Module Guide
//!
//! - [`definition`] - Immutable workflow descriptions (nodes, dependencies, retry policies)
//! - [`validation`] - Structural validation: duplicate ids, dangling references, cycles
//! - [`state`] - Per-run execution state and node status tracking
//! - [`retry`] - Pure backoff computation
//! - [`orchestrator`] - The readiness/retry/routing engine
//! - [`event_bus`] - Typed event fan-out to pluggable sinks
//! - [`manager`] - Arena of concurrent executions with async retry-timer drivers
//! - [`telemetry`] - Opt-in tracing subscriber setup for hosts and tests

pub mod definition;
pub mod event_bus;
pub mod manager;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod validation;
