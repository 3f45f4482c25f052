//! Hosting layer for concurrent executions.
//!
//! [`ExecutionManager`] is an arena of orchestrators keyed by execution id:
//! one [`Orchestrator`] per run, no process-wide state. It owns the shared
//! [`EventBus`], serializes calls into each orchestrator with a per-execution
//! mutex, and runs one async driver task per started execution that sleeps
//! until the next retry deadline and fires
//! [`process_retry_timers`](Orchestrator::process_retry_timers).
//!
//! # Usage
//!
//! ```no_run
//! use taskloom::definition::{DagNode, WorkflowDefinition};
//! use taskloom::event_bus::{EventBus, MemorySink};
//! use taskloom::manager::ExecutionManager;
//!
//! # async fn example() -> Result<(), taskloom::manager::ManagerError> {
//! let sink = MemorySink::new();
//! let manager = ExecutionManager::new(EventBus::with_sink(sink.clone()));
//!
//! let definition = WorkflowDefinition::new("deploy").add_node(DagNode::new("build"));
//! let execution_id = manager.create_execution(definition)?;
//! manager.start(&execution_id)?;
//!
//! // The external executor reacts to node:ready events captured by the sink:
//! manager.mark_node_running(&execution_id, "build", "session-7")?;
//! manager.mark_node_completed(&execution_id, "build", true)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::definition::WorkflowDefinition;
use crate::event_bus::EventBus;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::state::WorkflowExecution;
use crate::types::ExecutionId;

/// Errors from manager operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ManagerError {
    #[error("execution not found: {execution_id}")]
    #[diagnostic(code(taskloom::manager::execution_not_found))]
    ExecutionNotFound { execution_id: ExecutionId },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

struct ExecutionEntry {
    orchestrator: Arc<Mutex<Orchestrator>>,
    /// Wakes the driver task when state changes (new timer, terminal status).
    wake: Arc<Notify>,
    driver: Option<JoinHandle<()>>,
}

/// Arena of concurrent workflow executions sharing one event bus.
///
/// Must be created inside a tokio runtime: the event bus listener and the
/// per-execution retry drivers are spawned tasks.
pub struct ExecutionManager {
    event_bus: EventBus,
    executions: Mutex<FxHashMap<ExecutionId, ExecutionEntry>>,
}

impl Default for ExecutionManager {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

impl ExecutionManager {
    /// Create a manager and start the bus listener.
    #[must_use]
    pub fn new(event_bus: EventBus) -> Self {
        event_bus.listen_for_events();
        Self {
            event_bus,
            executions: Mutex::new(FxHashMap::default()),
        }
    }

    /// The shared event bus, e.g. to attach further sinks.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Register a new execution for `definition`, returning its generated id.
    /// Validation failures surface here, before anything runs.
    #[instrument(skip(self, definition), fields(workflow_id = %definition.id), err)]
    pub fn create_execution(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<ExecutionId, ManagerError> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let orchestrator = Orchestrator::new(
            definition,
            execution_id.clone(),
            self.event_bus.get_sender(),
        )?;
        let entry = ExecutionEntry {
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            wake: Arc::new(Notify::new()),
            driver: None,
        };
        self.executions.lock().insert(execution_id.clone(), entry);
        Ok(execution_id)
    }

    /// Start an execution and spawn its retry-timer driver.
    #[instrument(skip(self), err)]
    pub fn start(&self, execution_id: &str) -> Result<(), ManagerError> {
        let mut executions = self.executions.lock();
        let entry = executions
            .get_mut(execution_id)
            .ok_or_else(|| not_found(execution_id))?;
        entry.orchestrator.lock().start()?;
        if entry.driver.is_none() {
            entry.driver = Some(tokio::spawn(drive_retry_timers(
                Arc::clone(&entry.orchestrator),
                Arc::clone(&entry.wake),
            )));
        }
        Ok(())
    }

    pub fn mark_node_running(
        &self,
        execution_id: &str,
        node_id: &str,
        handle: impl Into<String>,
    ) -> Result<(), ManagerError> {
        let (orchestrator, wake) = self.entry(execution_id)?;
        orchestrator.lock().mark_node_running(node_id, handle)?;
        wake.notify_one();
        Ok(())
    }

    pub fn mark_node_completed(
        &self,
        execution_id: &str,
        node_id: &str,
        success: bool,
    ) -> Result<(), ManagerError> {
        let (orchestrator, wake) = self.entry(execution_id)?;
        orchestrator.lock().mark_node_completed(node_id, success)?;
        wake.notify_one();
        Ok(())
    }

    pub fn mark_node_errored(
        &self,
        execution_id: &str,
        node_id: &str,
        error: impl Into<String>,
    ) -> Result<(), ManagerError> {
        let (orchestrator, wake) = self.entry(execution_id)?;
        orchestrator.lock().mark_node_errored(node_id, error)?;
        wake.notify_one();
        Ok(())
    }

    pub fn pause(&self, execution_id: &str) -> Result<(), ManagerError> {
        let (orchestrator, wake) = self.entry(execution_id)?;
        orchestrator.lock().pause()?;
        wake.notify_one();
        Ok(())
    }

    pub fn resume(&self, execution_id: &str) -> Result<(), ManagerError> {
        let (orchestrator, wake) = self.entry(execution_id)?;
        orchestrator.lock().resume()?;
        wake.notify_one();
        Ok(())
    }

    pub fn cancel(&self, execution_id: &str) -> Result<(), ManagerError> {
        let (orchestrator, wake) = self.entry(execution_id)?;
        orchestrator.lock().cancel();
        wake.notify_one();
        Ok(())
    }

    /// Owned snapshot of an execution's state.
    pub fn execution_snapshot(
        &self,
        execution_id: &str,
    ) -> Result<WorkflowExecution, ManagerError> {
        let (orchestrator, _) = self.entry(execution_id)?;
        let snapshot = orchestrator.lock().snapshot();
        Ok(snapshot)
    }

    /// Ids of all registered executions.
    #[must_use]
    pub fn list_executions(&self) -> Vec<ExecutionId> {
        self.executions.lock().keys().cloned().collect()
    }

    /// Drop an execution from the arena, aborting its driver task.
    pub fn remove_execution(&self, execution_id: &str) -> Result<(), ManagerError> {
        let entry = self
            .executions
            .lock()
            .remove(execution_id)
            .ok_or_else(|| not_found(execution_id))?;
        if let Some(driver) = entry.driver {
            driver.abort();
        }
        Ok(())
    }

    fn entry(
        &self,
        execution_id: &str,
    ) -> Result<(Arc<Mutex<Orchestrator>>, Arc<Notify>), ManagerError> {
        let executions = self.executions.lock();
        let entry = executions
            .get(execution_id)
            .ok_or_else(|| not_found(execution_id))?;
        Ok((Arc::clone(&entry.orchestrator), Arc::clone(&entry.wake)))
    }
}

fn not_found(execution_id: &str) -> ManagerError {
    ManagerError::ExecutionNotFound {
        execution_id: execution_id.to_string(),
    }
}

/// Sleep until the earliest retry deadline and fire it; re-evaluate whenever
/// the manager signals a state change. Exits once the execution is terminal.
async fn drive_retry_timers(orchestrator: Arc<Mutex<Orchestrator>>, wake: Arc<Notify>) {
    loop {
        let (deadline, terminal) = {
            let orch = orchestrator.lock();
            (orch.next_retry_at(), orch.execution().status.is_terminal())
        };
        if terminal {
            break;
        }
        match deadline {
            Some(due) => {
                let sleep_for = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    () = tokio::time::sleep(sleep_for) => {
                        let fired = orchestrator.lock().process_retry_timers(Utc::now());
                        if fired > 0 {
                            tracing::debug!(fired, "retry timers fired");
                        }
                    }
                    () = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
}
