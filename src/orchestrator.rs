//! The readiness/retry/routing engine.
//!
//! An [`Orchestrator`] binds one validated [`WorkflowDefinition`] to one
//! [`WorkflowExecution`] and advances it until a terminal status. It holds no
//! worker threads and performs no I/O: all external work happens in a separate
//! runner that consumes [`Event::NodeReady`] and reports back through
//! [`mark_node_running`](Orchestrator::mark_node_running) /
//! [`mark_node_completed`](Orchestrator::mark_node_completed). Every method
//! mutates state synchronously; a multi-threaded host must serialize calls per
//! execution (see [`crate::manager`]).
//!
//! Retry timers are driven explicitly: the orchestrator records deadlines and
//! the host calls [`process_retry_timers`](Orchestrator::process_retry_timers)
//! with a clock value, keeping the core deterministic under test.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::instrument;

use crate::definition::{DagNode, WorkflowDefinition};
use crate::event_bus::Event;
use crate::retry::retry_delay_ms;
use crate::state::{ExecutionStatus, NodeStatus, WorkflowExecution};
use crate::types::{ExecutionId, NodeId, SessionHandle};
use crate::validation::{ValidationError, validate};

/// Errors surfaced by orchestrator methods.
///
/// None of these corrupt run state: a rejected call leaves the execution
/// exactly as it was.
#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    #[error("definition failed validation with {} error(s)", errors.len())]
    #[diagnostic(code(taskloom::orchestrator::invalid_definition))]
    InvalidDefinition {
        #[related]
        errors: Vec<ValidationError>,
    },

    #[error("unknown node: {node_id}")]
    #[diagnostic(code(taskloom::orchestrator::unknown_node))]
    UnknownNode { node_id: NodeId },

    #[error("invalid transition for node {node_id}: expected {expected}, found {actual}")]
    #[diagnostic(
        code(taskloom::orchestrator::invalid_transition),
        help("mark_node_running requires a queued node; mark_node_completed requires a running node")
    )]
    InvalidTransition {
        node_id: NodeId,
        expected: NodeStatus,
        actual: NodeStatus,
    },

    #[error("execution already started (status: {status})")]
    #[diagnostic(code(taskloom::orchestrator::already_started))]
    AlreadyStarted { status: ExecutionStatus },

    #[error("execution is not running (status: {status})")]
    #[diagnostic(code(taskloom::orchestrator::not_running))]
    NotRunning { status: ExecutionStatus },

    #[error("execution is not paused (status: {status})")]
    #[diagnostic(code(taskloom::orchestrator::not_paused))]
    NotPaused { status: ExecutionStatus },

    #[error("execution reached terminal status {status}")]
    #[diagnostic(code(taskloom::orchestrator::terminal))]
    Terminal { status: ExecutionStatus },
}

/// A scheduled retry: the node re-enters the ready pool once `due_at` passes.
#[derive(Clone, Debug)]
struct RetryTimer {
    node_id: NodeId,
    due_at: DateTime<Utc>,
}

/// Completion report buffered while the execution is paused.
#[derive(Clone, Debug)]
enum BufferedReport {
    Running {
        node_id: NodeId,
        handle: SessionHandle,
    },
    Completed {
        node_id: NodeId,
        success: bool,
        error: Option<String>,
    },
}

/// DAG execution engine for one run.
#[derive(Debug)]
pub struct Orchestrator {
    definition: WorkflowDefinition,
    /// Node index by id, in definition order.
    index: FxHashMap<NodeId, usize>,
    execution: WorkflowExecution,
    /// Ids made eligible by conditional routing, independent of `depends_on`.
    unlocked: FxHashSet<NodeId>,
    retry_timers: Vec<RetryTimer>,
    buffered: Vec<BufferedReport>,
    paused_at: Option<DateTime<Utc>>,
    events: flume::Sender<Event>,
}

impl Orchestrator {
    /// Bind a definition to a fresh execution.
    ///
    /// Refuses any definition with validation errors, so an invalid graph
    /// never reaches [`start`](Self::start).
    pub fn new(
        definition: WorkflowDefinition,
        execution_id: impl Into<ExecutionId>,
        events: flume::Sender<Event>,
    ) -> Result<Self, OrchestratorError> {
        let errors = validate(&definition);
        if !errors.is_empty() {
            return Err(OrchestratorError::InvalidDefinition { errors });
        }
        let index = definition
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let execution = WorkflowExecution::new(execution_id, &definition);
        Ok(Self {
            definition,
            index,
            execution,
            unlocked: FxHashSet::default(),
            retry_timers: Vec::new(),
            buffered: Vec::new(),
            paused_at: None,
            events,
        })
    }

    /// The definition this run executes. Never mutated.
    #[must_use]
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Read-only view of the execution state.
    #[must_use]
    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    /// Owned snapshot of the execution state, suitable for persistence.
    #[must_use]
    pub fn snapshot(&self) -> WorkflowExecution {
        self.execution.clone()
    }

    /// Begin execution: the initial readiness pass emits one
    /// [`Event::NodeReady`] per node with no dependencies, in definition
    /// order.
    #[instrument(skip(self), fields(execution_id = %self.execution.id), err)]
    pub fn start(&mut self) -> Result<(), OrchestratorError> {
        match self.execution.status {
            ExecutionStatus::Idle => {}
            status if status.is_terminal() => {
                return Err(OrchestratorError::Terminal { status });
            }
            status => return Err(OrchestratorError::AlreadyStarted { status }),
        }
        self.execution.status = ExecutionStatus::Running;
        tracing::debug!(workflow_id = %self.execution.workflow_id, "execution started");
        self.advance();
        Ok(())
    }

    /// Record that the external executor has started a queued node.
    ///
    /// Reports for a cancelled run or an already-terminal node are silently
    /// ignored; a report for any other non-queued node is a caller error.
    #[instrument(skip(self, handle), fields(execution_id = %self.execution.id), err)]
    pub fn mark_node_running(
        &mut self,
        node_id: &str,
        handle: impl Into<SessionHandle>,
    ) -> Result<(), OrchestratorError> {
        if self.execution.status.is_terminal() {
            return Ok(());
        }
        if self.execution.status == ExecutionStatus::Paused {
            self.buffered.push(BufferedReport::Running {
                node_id: node_id.to_string(),
                handle: handle.into(),
            });
            return Ok(());
        }
        self.apply_running(node_id, handle.into())
    }

    /// Record a completion report from the external executor.
    ///
    /// Requires the node to be running. On success the node completes and its
    /// `on_success` routes unlock; on failure the retry policy is consulted
    /// first, then `on_failure` routes unlock. Duplicate or late reports for a
    /// terminal node (or a cancelled run) are a no-op; the external layer
    /// delivers at-least-once.
    #[instrument(skip(self), fields(execution_id = %self.execution.id), err)]
    pub fn mark_node_completed(
        &mut self,
        node_id: &str,
        success: bool,
    ) -> Result<(), OrchestratorError> {
        self.report_completion(node_id, success, None)
    }

    /// Like [`mark_node_completed`](Self::mark_node_completed) with
    /// `success = false`, recording the executor's error message on the node.
    #[instrument(skip(self, error), fields(execution_id = %self.execution.id), err)]
    pub fn mark_node_errored(
        &mut self,
        node_id: &str,
        error: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        self.report_completion(node_id, false, Some(error.into()))
    }

    /// Freeze readiness recomputation and retry-timer progression.
    ///
    /// Nodes already running finish externally; their reports are buffered and
    /// applied on [`resume`](Self::resume).
    pub fn pause(&mut self) -> Result<(), OrchestratorError> {
        match self.execution.status {
            ExecutionStatus::Running => {
                self.execution.status = ExecutionStatus::Paused;
                self.paused_at = Some(Utc::now());
                tracing::debug!(execution_id = %self.execution.id, "execution paused");
                Ok(())
            }
            status if status.is_terminal() => Err(OrchestratorError::Terminal { status }),
            status => Err(OrchestratorError::NotRunning { status }),
        }
    }

    /// Replay buffered reports, shift retry deadlines by the paused interval,
    /// and resume readiness computation.
    pub fn resume(&mut self) -> Result<(), OrchestratorError> {
        match self.execution.status {
            ExecutionStatus::Paused => {}
            status if status.is_terminal() => {
                return Err(OrchestratorError::Terminal { status });
            }
            status => return Err(OrchestratorError::NotPaused { status }),
        }

        if let Some(paused_at) = self.paused_at.take() {
            let paused_for = Utc::now() - paused_at;
            for timer in &mut self.retry_timers {
                timer.due_at += paused_for;
            }
        }
        self.execution.status = ExecutionStatus::Running;
        tracing::debug!(execution_id = %self.execution.id, "execution resumed");

        for report in std::mem::take(&mut self.buffered) {
            let result = match report {
                BufferedReport::Running { node_id, handle } => self.apply_running(&node_id, handle),
                BufferedReport::Completed {
                    node_id,
                    success,
                    error,
                } => self.apply_completion(&node_id, success, error),
            };
            if let Err(err) = result {
                tracing::warn!(error = %err, "dropping invalid buffered report");
            }
        }

        self.advance();
        Ok(())
    }

    /// Cancel the run. Irreversible and terminal.
    ///
    /// Pending, queued, and retrying nodes become skipped immediately; nodes
    /// already running are left to finish externally and their eventual
    /// reports are accepted but ignored. The terminal snapshot goes out as a
    /// [`Event::Progress`], since cancellation has no dedicated variant.
    /// Calling cancel on an already-terminal run is a no-op.
    #[instrument(skip(self), fields(execution_id = %self.execution.id))]
    pub fn cancel(&mut self) {
        if self.execution.status.is_terminal() {
            return;
        }
        self.retry_timers.clear();
        self.buffered.clear();
        self.paused_at = None;
        for state in self.execution.node_states.values_mut() {
            if matches!(
                state.status,
                NodeStatus::Pending | NodeStatus::Queued | NodeStatus::Retrying
            ) {
                state.status = NodeStatus::Skipped;
            }
        }
        self.execution.status = ExecutionStatus::Cancelled;
        self.execution.current_step_label = "cancelled".to_string();
        tracing::debug!("execution cancelled");
        self.emit(Event::Progress {
            execution: self.execution.clone(),
        });
    }

    /// Fire retry timers due at `now`, returning the fired nodes to the ready
    /// pool. Returns how many timers fired. A no-op while paused or terminal.
    pub fn process_retry_timers(&mut self, now: DateTime<Utc>) -> usize {
        if self.execution.status != ExecutionStatus::Running {
            return 0;
        }
        let mut fired = 0;
        let mut remaining = Vec::with_capacity(self.retry_timers.len());
        for timer in std::mem::take(&mut self.retry_timers) {
            if timer.due_at <= now {
                if let Some(state) = self.execution.node_states.get_mut(&timer.node_id) {
                    if state.status == NodeStatus::Retrying {
                        state.status = NodeStatus::Pending;
                        fired += 1;
                        tracing::debug!(node_id = %timer.node_id, "retry timer fired");
                    }
                }
            } else {
                remaining.push(timer);
            }
        }
        self.retry_timers = remaining;
        if fired > 0 {
            self.advance();
        }
        fired
    }

    /// Earliest pending retry deadline, so a host can sleep precisely.
    /// `None` while paused (timers are frozen) or when no retry is scheduled.
    #[must_use]
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        if self.execution.status != ExecutionStatus::Running {
            return None;
        }
        self.retry_timers.iter().map(|t| t.due_at).min()
    }

    fn apply_running(
        &mut self,
        node_id: &str,
        handle: SessionHandle,
    ) -> Result<(), OrchestratorError> {
        if !self.index.contains_key(node_id) {
            return Err(OrchestratorError::UnknownNode {
                node_id: node_id.to_string(),
            });
        }
        let state = self
            .execution
            .node_states
            .get_mut(node_id)
            .expect("indexed node has a state entry");
        if state.status.is_terminal() {
            // Late dispatch report after skip; ignore.
            return Ok(());
        }
        if state.status != NodeStatus::Queued {
            return Err(OrchestratorError::InvalidTransition {
                node_id: node_id.to_string(),
                expected: NodeStatus::Queued,
                actual: state.status,
            });
        }
        state.status = NodeStatus::Running;
        state.session_handle = Some(handle);
        state.started_at = Some(Utc::now());
        self.execution.running_node_ids.push(node_id.to_string());
        self.update_label();
        self.emit(Event::Progress {
            execution: self.execution.clone(),
        });
        Ok(())
    }

    fn report_completion(
        &mut self,
        node_id: &str,
        success: bool,
        error: Option<String>,
    ) -> Result<(), OrchestratorError> {
        if self.execution.status.is_terminal() {
            return Ok(());
        }
        if self.execution.status == ExecutionStatus::Paused {
            self.buffered.push(BufferedReport::Completed {
                node_id: node_id.to_string(),
                success,
                error,
            });
            return Ok(());
        }
        self.apply_completion(node_id, success, error)
    }

    fn apply_completion(
        &mut self,
        node_id: &str,
        success: bool,
        error: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let Some(&node_index) = self.index.get(node_id) else {
            return Err(OrchestratorError::UnknownNode {
                node_id: node_id.to_string(),
            });
        };
        let state = self
            .execution
            .node_states
            .get_mut(node_id)
            .expect("indexed node has a state entry");
        if state.status.is_terminal() {
            // Duplicate or late report; at-least-once delivery tolerance.
            return Ok(());
        }
        if state.status != NodeStatus::Running {
            return Err(OrchestratorError::InvalidTransition {
                node_id: node_id.to_string(),
                expected: NodeStatus::Running,
                actual: state.status,
            });
        }

        self.execution.running_node_ids.retain(|id| id != node_id);
        let node = self.definition.nodes[node_index].clone();

        if success {
            let state = self
                .execution
                .node_states
                .get_mut(node_id)
                .expect("indexed node has a state entry");
            state.status = NodeStatus::Completed;
            state.success = Some(true);
            state.completed_at = Some(Utc::now());
            self.execution.completed_nodes += 1;
            if let Some(next) = &node.conditional_next {
                self.unlock(&next.on_success);
            }
            tracing::debug!(node_id, "node completed");
            self.advance();
            return Ok(());
        }

        let state = self
            .execution
            .node_states
            .get_mut(node_id)
            .expect("indexed node has a state entry");
        if let Some(message) = error {
            state.error = Some(message);
        }

        let retry = node
            .retry_policy
            .as_ref()
            .filter(|policy| state.retry_count < policy.max_retries);
        if let Some(policy) = retry {
            let delay_ms = retry_delay_ms(policy, state.retry_count);
            state.retry_count += 1;
            state.status = NodeStatus::Retrying;
            let retry_count = state.retry_count;
            self.retry_timers.push(RetryTimer {
                node_id: node_id.to_string(),
                due_at: Utc::now() + ChronoDuration::milliseconds(delay_ms as i64),
            });
            tracing::debug!(node_id, retry_count, delay_ms, "node failure; retry scheduled");
            self.emit(Event::NodeRetry {
                node_id: node_id.to_string(),
                retry_count,
                delay_ms,
            });
            self.update_label();
            self.emit(Event::Progress {
                execution: self.execution.clone(),
            });
            return Ok(());
        }

        state.status = NodeStatus::Failed;
        state.success = Some(false);
        state.completed_at = Some(Utc::now());
        self.execution.failed_nodes += 1;
        if let Some(next) = &node.conditional_next {
            self.unlock(&next.on_failure);
        }
        tracing::debug!(node_id, "node failed; retries exhausted or no policy");
        self.advance();
        Ok(())
    }

    /// Add ids to the unlock set. An unlocked pending node becomes ready
    /// regardless of its own dependencies.
    fn unlock(&mut self, ids: &[NodeId]) {
        for id in ids {
            self.unlocked.insert(id.clone());
        }
    }

    /// One readiness pass plus terminal detection.
    ///
    /// All newly-ready nodes are collected in a single pass so that
    /// parallel-group members whose dependencies resolve together are released
    /// together. When nothing is in flight and nothing was released, no
    /// pending node can ever become ready: the remainder is skipped and the
    /// run terminates.
    fn advance(&mut self) {
        if self.execution.status != ExecutionStatus::Running {
            return;
        }

        let released = self.release_ready();

        let in_flight = self.execution.count_in_status(NodeStatus::Queued)
            + self.execution.count_in_status(NodeStatus::Running)
            + self.execution.count_in_status(NodeStatus::Retrying);

        if in_flight == 0 {
            debug_assert_eq!(released, 0);
            for state in self.execution.node_states.values_mut() {
                if state.status == NodeStatus::Pending {
                    state.status = NodeStatus::Skipped;
                }
            }
            if self.execution.failed_nodes > 0 {
                self.execution.status = ExecutionStatus::Failed;
                self.execution.current_step_label = format!(
                    "failed ({} of {} nodes)",
                    self.execution.failed_nodes, self.execution.total_nodes
                );
                tracing::debug!(failed = self.execution.failed_nodes, "execution failed");
                self.emit(Event::Failed {
                    execution: self.execution.clone(),
                });
            } else {
                self.execution.status = ExecutionStatus::Completed;
                self.execution.current_step_label = "all nodes completed".to_string();
                tracing::debug!(completed = self.execution.completed_nodes, "execution completed");
                self.emit(Event::Completed {
                    execution: self.execution.clone(),
                });
            }
            return;
        }

        self.update_label();
        self.emit(Event::Progress {
            execution: self.execution.clone(),
        });
    }

    /// Release every ready pending node, emitting `node:ready` in definition
    /// order. Returns the number released.
    fn release_ready(&mut self) -> usize {
        let mut ready: Vec<usize> = Vec::new();
        for (i, node) in self.definition.nodes.iter().enumerate() {
            let state = &self.execution.node_states[&node.id];
            if state.status != NodeStatus::Pending {
                continue;
            }
            if self.unlocked.contains(&node.id) || self.deps_satisfied(node) {
                ready.push(i);
            }
        }

        for &i in &ready {
            let node = self.definition.nodes[i].clone();
            let state = self
                .execution
                .node_states
                .get_mut(&node.id)
                .expect("definition node has a state entry");
            state.status = NodeStatus::Queued;
            tracing::debug!(node_id = %node.id, group = ?node.parallel_group, "node ready");
            self.emit(Event::NodeReady {
                node_id: node.id.clone(),
                node,
            });
        }
        ready.len()
    }

    /// Default-path readiness: every dependency completed with success.
    /// A failed dependency never unlocks dependents this way; only explicit
    /// `on_failure` routing does.
    fn deps_satisfied(&self, node: &DagNode) -> bool {
        node.depends_on.iter().all(|dep| {
            self.execution
                .node_states
                .get(dep)
                .is_some_and(|s| s.status == NodeStatus::Completed && s.success == Some(true))
        })
    }

    fn update_label(&mut self) {
        let execution = &mut self.execution;
        execution.current_step_label = if execution.running_node_ids.is_empty() {
            format!(
                "{}/{} nodes completed",
                execution.completed_nodes, execution.total_nodes
            )
        } else {
            format!("running {}", execution.running_node_ids.join(", "))
        };
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::debug!(execution_id = %self.execution.id, "event channel closed; event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DagNode, RetryPolicy, WorkflowDefinition};

    fn orchestrator(definition: WorkflowDefinition) -> (Orchestrator, flume::Receiver<Event>) {
        let (tx, rx) = flume::unbounded();
        (Orchestrator::new(definition, "run-1", tx).unwrap(), rx)
    }

    #[test]
    fn constructor_rejects_invalid_definition() {
        let cyclic = WorkflowDefinition::new("wf")
            .add_node(DagNode::new("a").depends_on(["b"]))
            .add_node(DagNode::new("b").depends_on(["a"]));
        let (tx, _rx) = flume::unbounded();
        let err = Orchestrator::new(cyclic, "run-1", tx).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidDefinition { ref errors } if errors.len() == 1
        ));
    }

    #[test]
    fn start_is_single_shot() {
        let (mut orch, _rx) =
            orchestrator(WorkflowDefinition::new("wf").add_node(DagNode::new("a")));
        orch.start().unwrap();
        assert!(matches!(
            orch.start(),
            Err(OrchestratorError::AlreadyStarted { .. })
        ));
    }

    #[test]
    fn empty_workflow_completes_immediately() {
        let (mut orch, rx) = orchestrator(WorkflowDefinition::new("wf"));
        orch.start().unwrap();
        assert_eq!(orch.execution().status, ExecutionStatus::Completed);
        let events: Vec<Event> = rx.try_iter().collect();
        assert!(matches!(events.as_slice(), [Event::Completed { .. }]));
    }

    #[test]
    fn mark_running_requires_queued() {
        let (mut orch, _rx) = orchestrator(
            WorkflowDefinition::new("wf")
                .add_node(DagNode::new("a"))
                .add_node(DagNode::new("b").depends_on(["a"])),
        );
        orch.start().unwrap();
        // "b" is still pending; dispatching it is a caller error.
        let err = orch.mark_node_running("b", "h").unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidTransition {
                expected: NodeStatus::Queued,
                actual: NodeStatus::Pending,
                ..
            }
        ));
        assert_eq!(
            orch.execution().node_status("b"),
            Some(NodeStatus::Pending),
            "rejected call must not mutate state"
        );
    }

    #[test]
    fn unknown_node_is_an_error() {
        let (mut orch, _rx) =
            orchestrator(WorkflowDefinition::new("wf").add_node(DagNode::new("a")));
        orch.start().unwrap();
        assert!(matches!(
            orch.mark_node_running("ghost", "h"),
            Err(OrchestratorError::UnknownNode { .. })
        ));
    }

    #[test]
    fn duplicate_completion_is_a_no_op() {
        let (mut orch, _rx) =
            orchestrator(WorkflowDefinition::new("wf").add_node(DagNode::new("a")));
        orch.start().unwrap();
        orch.mark_node_running("a", "h").unwrap();
        orch.mark_node_completed("a", true).unwrap();
        let before = orch.snapshot();
        orch.mark_node_completed("a", false).unwrap();
        assert_eq!(orch.snapshot(), before);
    }

    #[test]
    fn retry_schedules_timer_and_freezes_while_paused() {
        let (mut orch, _rx) = orchestrator(
            WorkflowDefinition::new("wf")
                .add_node(DagNode::new("a").with_retry(RetryPolicy::new(1, 100)))
                .add_node(DagNode::new("anchor")),
        );
        orch.start().unwrap();
        orch.mark_node_running("a", "h").unwrap();
        orch.mark_node_completed("a", false).unwrap();
        assert_eq!(orch.execution().node_status("a"), Some(NodeStatus::Retrying));
        let due = orch.next_retry_at().expect("retry scheduled");

        orch.pause().unwrap();
        assert_eq!(orch.next_retry_at(), None, "timers frozen while paused");
        assert_eq!(orch.process_retry_timers(due + ChronoDuration::hours(1)), 0);

        orch.resume().unwrap();
        let shifted = orch.next_retry_at().expect("retry still scheduled");
        assert!(shifted >= due, "deadline shifted by the paused interval");
    }

    #[test]
    fn errored_node_records_message() {
        let (mut orch, _rx) =
            orchestrator(WorkflowDefinition::new("wf").add_node(DagNode::new("a")));
        orch.start().unwrap();
        orch.mark_node_running("a", "h").unwrap();
        orch.mark_node_errored("a", "compile error").unwrap();
        let state = &orch.execution().node_states["a"];
        assert_eq!(state.status, NodeStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("compile error"));
    }
}
