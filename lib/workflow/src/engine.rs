//! Execution engine.
//!
//! The [`Engine`] is the public entry point: it loads definitions from the
//! workflow store, launches one instance actor per execution and routes
//! task completions, control requests and status queries to them.
//!
//! Must be built and used within a tokio runtime.

use crate::config::EngineConfig;
use crate::definition::WorkflowDefinition;
use crate::error::{EngineError, StoreError};
use crate::execution::{ExecutionLogEntry, ExecutionOrigin, ExecutionSnapshot};
use crate::instance::{Instance, InstanceMessage, Launch, initial_context, initial_snapshot};
use crate::memory::{InMemoryTaskStore, RecordingNotificationSender};
use crate::monitor::{ExecutionMonitor, SnapshotReceiver};
use crate::rule_engine::{RuleEngine, RuleEngineHandle};
use crate::services::{
    Clock, NotificationSender, SystemClock, TaskCompletion, TaskStore, WorkflowStore,
};
use crate::validate::ValidationReport;
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use taskflow_core::{ExecutionId, WorkflowId};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Shared engine state. Instance actors hold a strong reference while they
/// run.
pub(crate) struct EngineInner {
    pub store: Arc<dyn WorkflowStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub notifier: Arc<dyn NotificationSender>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub rules: RuleEngineHandle,
    pub monitor: ExecutionMonitor,
    instances: RwLock<HashMap<ExecutionId, mpsc::UnboundedSender<InstanceMessage>>>,
}

impl EngineInner {
    /// Starts an instance actor and returns its id.
    ///
    /// Synchronous so that instance actors can launch children without
    /// awaiting.
    pub(crate) fn launch(self: &Arc<Self>, launch: Launch) -> ExecutionId {
        let id = launch.id;
        let (tx, rx) = mpsc::unbounded_channel();
        let started_at = self.clock.now();
        let snapshots = self.monitor.register(initial_snapshot(&launch, started_at));
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx.clone());

        let instance = Instance::new(launch, started_at, Arc::clone(self), tx, snapshots);
        tokio::spawn(instance.run(rx));
        id
    }

    /// Delivers a message to a running instance. Returns false when the
    /// instance is no longer running.
    pub(crate) fn send(&self, id: ExecutionId, message: InstanceMessage) -> bool {
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        instances
            .get(&id)
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Removes a finished instance from the registry.
    pub(crate) fn forget(&self, id: ExecutionId) {
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn running(&self) -> Vec<ExecutionId> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Routes a task completion to the execution it names, or to every
    /// running execution when it names none. Returns how many instances
    /// received it.
    fn deliver(&self, completion: &TaskCompletion) -> usize {
        let targets = match completion.execution_id {
            Some(id) => vec![id],
            None => self.running(),
        };
        targets
            .into_iter()
            .filter(|id| {
                self.send(
                    *id,
                    InstanceMessage::TaskCompleted {
                        task_id: completion.task_id.clone(),
                        outcome: completion.outcome.clone(),
                    },
                )
            })
            .count()
    }
}

/// Forwards task store completions to instance actors until the engine is
/// dropped.
fn spawn_task_listener(
    inner: Weak<EngineInner>,
    mut completions: broadcast::Receiver<TaskCompletion>,
) {
    tokio::spawn(async move {
        loop {
            match completions.recv().await {
                Ok(completion) => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    let delivered = inner.deliver(&completion);
                    debug!(task_id = %completion.task_id, delivered, "task completion routed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "task completion listener lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("task completion listener stopped");
    });
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    store: Arc<dyn WorkflowStore>,
    tasks: Option<Arc<dyn TaskStore>>,
    notifier: Option<Arc<dyn NotificationSender>>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Sets the task store. Defaults to an empty [`InMemoryTaskStore`].
    #[must_use]
    pub fn task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Sets the notification sender. Defaults to a
    /// [`RecordingNotificationSender`].
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSender>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Sets the clock. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine and starts its rule engine and task completion
    /// listener. Must be called within a tokio runtime.
    #[must_use]
    pub fn build(self) -> Engine {
        let tasks = self
            .tasks
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(RecordingNotificationSender::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let rules = RuleEngine::new(Arc::clone(&tasks), Arc::clone(&notifier)).spawn();
        // Subscribe before any instance can activate a task.
        let completions = tasks.subscribe();

        let inner = Arc::new(EngineInner {
            store: self.store,
            tasks,
            notifier,
            clock,
            config: self.config,
            rules,
            monitor: ExecutionMonitor::new(),
            instances: RwLock::new(HashMap::new()),
        });
        spawn_task_listener(Arc::downgrade(&inner), completions);

        Engine { inner }
    }
}

/// Handle to the execution engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts building an engine over a workflow store.
    #[must_use]
    pub fn builder(store: Arc<dyn WorkflowStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            tasks: None,
            notifier: None,
            clock: None,
            config: EngineConfig::default(),
        }
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns the workflow store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.inner.store
    }

    /// Returns the execution monitor.
    #[must_use]
    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.inner.monitor
    }

    /// Validates a definition, reporting every violation.
    ///
    /// # Errors
    ///
    /// Returns the full list of violations when the graph is invalid.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<(), ValidationReport> {
        definition.validate()
    }

    /// Starts an execution of an active workflow with an empty context.
    ///
    /// # Errors
    ///
    /// See [`Engine::execute_with`].
    pub async fn execute(&self, flow_id: WorkflowId) -> Result<ExecutionId, Report<EngineError>> {
        self.execute_with(flow_id, JsonValue::Null, ExecutionOrigin::Manual)
            .await
    }

    /// Starts an execution with an initial context.
    ///
    /// An object context is used as is; `null` becomes an empty object and
    /// any other value is stored under `input`.
    ///
    /// # Errors
    ///
    /// Fails when the workflow does not exist, is not active or does not
    /// validate, or when the store fails.
    #[instrument(skip(self, context), fields(%flow_id))]
    pub async fn execute_with(
        &self,
        flow_id: WorkflowId,
        context: JsonValue,
        origin: ExecutionOrigin,
    ) -> Result<ExecutionId, Report<EngineError>> {
        let definition = self.load(flow_id).await?;
        if !definition.is_triggerable() {
            return Err(EngineError::NotTriggerable {
                workflow_id: flow_id,
                status: definition.status,
            })?;
        }
        if let Err(report) = definition.validate() {
            warn!(%report, "refusing to execute an invalid definition");
            return Err(EngineError::InvalidDefinition {
                workflow_id: flow_id,
            })?;
        }

        let id = self.inner.launch(Launch {
            id: ExecutionId::new(),
            definition: Arc::new(definition),
            context: initial_context(context),
            origin,
            depth: 0,
            parent: None,
        });
        info!(execution_id = %id, "execution launched");
        Ok(id)
    }

    async fn load(&self, flow_id: WorkflowId) -> Result<WorkflowDefinition, Report<EngineError>> {
        let definition = self
            .inner
            .store
            .get(flow_id)
            .await
            .map_err(|error| match error {
                StoreError::NotFound { workflow_id } => EngineError::WorkflowNotFound { workflow_id },
                other => EngineError::Store {
                    message: other.to_string(),
                },
            })?;
        Ok(definition)
    }

    /// Requests cancellation. Already finished executions are left as they
    /// are.
    ///
    /// # Errors
    ///
    /// Fails when the execution is unknown.
    pub fn cancel(&self, execution_id: ExecutionId) -> Result<(), Report<EngineError>> {
        self.control(execution_id, InstanceMessage::Cancel)
    }

    /// Pauses a running execution. Messages arriving while paused are
    /// held until it resumes.
    ///
    /// # Errors
    ///
    /// Fails when the execution is unknown.
    pub fn pause(&self, execution_id: ExecutionId) -> Result<(), Report<EngineError>> {
        self.control(execution_id, InstanceMessage::Pause)
    }

    /// Resumes a paused execution.
    ///
    /// # Errors
    ///
    /// Fails when the execution is unknown.
    pub fn resume(&self, execution_id: ExecutionId) -> Result<(), Report<EngineError>> {
        self.control(execution_id, InstanceMessage::Resume)
    }

    fn control(
        &self,
        execution_id: ExecutionId,
        message: InstanceMessage,
    ) -> Result<(), Report<EngineError>> {
        let snapshot = self.status(execution_id)?;
        if snapshot.is_terminal() {
            debug!(%execution_id, status = %snapshot.status, "execution already finished");
            return Ok(());
        }
        // A false return means the actor finished in the meantime.
        self.inner.send(execution_id, message);
        Ok(())
    }

    /// Returns the latest snapshot of an execution.
    ///
    /// # Errors
    ///
    /// Fails when the execution is unknown.
    pub fn status(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Arc<ExecutionSnapshot>, Report<EngineError>> {
        let snapshot = self
            .inner
            .monitor
            .snapshot(execution_id)
            .ok_or(EngineError::ExecutionNotFound { execution_id })?;
        Ok(snapshot)
    }

    /// Returns the log entries with a sequence number above `since`.
    ///
    /// # Errors
    ///
    /// Fails when the execution is unknown.
    pub fn log_delta(
        &self,
        execution_id: ExecutionId,
        since: u64,
    ) -> Result<Vec<ExecutionLogEntry>, Report<EngineError>> {
        let entries = self
            .inner
            .monitor
            .log_delta(execution_id, since)
            .ok_or(EngineError::ExecutionNotFound { execution_id })?;
        Ok(entries)
    }

    /// Subscribes to snapshot updates of an execution.
    ///
    /// # Errors
    ///
    /// Fails when the execution is unknown.
    pub fn watch(&self, execution_id: ExecutionId) -> Result<SnapshotReceiver, Report<EngineError>> {
        let receiver = self
            .inner
            .monitor
            .watch(execution_id)
            .ok_or(EngineError::ExecutionNotFound { execution_id })?;
        Ok(receiver)
    }

    /// Waits until an execution reaches a terminal status.
    ///
    /// # Errors
    ///
    /// Fails when the execution is unknown.
    pub async fn wait_for_terminal(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Arc<ExecutionSnapshot>, Report<EngineError>> {
        let snapshot = self
            .inner
            .monitor
            .wait_for_terminal(execution_id)
            .await
            .ok_or(EngineError::ExecutionNotFound { execution_id })?;
        Ok(snapshot)
    }

    /// Delivers a task completion directly, for task systems that do not
    /// publish through [`TaskStore::subscribe`].
    ///
    /// # Errors
    ///
    /// Fails when the completion names an unknown execution.
    pub fn task_completed(&self, completion: TaskCompletion) -> Result<(), Report<EngineError>> {
        if let Some(execution_id) = completion.execution_id {
            self.status(execution_id)?;
        }
        let delivered = self.inner.deliver(&completion);
        debug!(task_id = %completion.task_id, delivered, "task completion delivered");
        Ok(())
    }

    /// Returns the ids of executions whose actors are still running.
    #[must_use]
    pub fn running(&self) -> Vec<ExecutionId> {
        self.inner.running()
    }
}
