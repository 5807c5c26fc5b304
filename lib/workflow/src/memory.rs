//! In-memory collaborators.
//!
//! These back the CLI and the tests. They are complete implementations of
//! the collaborator contracts, not mocks: the workflow store enforces
//! optimistic concurrency and the task store publishes completions.

use crate::definition::{WorkflowDefinition, WorkflowStatus, WorkflowSummary};
use crate::error::{ServiceError, StoreError};
use crate::rule::TaskPriority;
use crate::services::{
    Escalation, NewTask, NotificationSender, TaskCompletion, TaskInfo, TaskOutcome, TaskStatus,
    TaskStore, WorkflowStore,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use taskflow_core::{ExecutionId, TaskId, WorkflowId};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

/// A workflow store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    definitions: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
}

impl InMemoryWorkflowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError> {
        let mut definitions = self.definitions.write().await;
        if definitions.contains_key(&definition.id) {
            return Err(StoreError::AlreadyExists {
                workflow_id: definition.id,
            });
        }
        definitions.insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn get(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, StoreError> {
        self.definitions
            .read()
            .await
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::NotFound { workflow_id })
    }

    async fn update(
        &self,
        mut definition: WorkflowDefinition,
        expected_version: u64,
    ) -> Result<WorkflowDefinition, StoreError> {
        let workflow_id = definition.id;
        let mut definitions = self.definitions.write().await;
        let stored = definitions
            .get(&workflow_id)
            .ok_or(StoreError::NotFound { workflow_id })?;

        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                workflow_id,
                expected: expected_version,
                actual: stored.version,
            });
        }
        if definition.status == WorkflowStatus::Active && definition.validate().is_err() {
            return Err(StoreError::Rejected { workflow_id });
        }

        definition.version = stored.version + 1;
        definition.metadata.updated_at = chrono::Utc::now();
        definitions.insert(workflow_id, definition.clone());
        Ok(definition)
    }

    async fn delete(&self, workflow_id: WorkflowId) -> Result<(), StoreError> {
        self.definitions
            .write()
            .await
            .remove(&workflow_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound { workflow_id })
    }

    async fn list(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
        let definitions = self.definitions.read().await;
        let mut summaries: Vec<_> = definitions.values().map(WorkflowSummary::from).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }
}

#[derive(Debug, Default)]
struct TaskState {
    tasks: HashMap<TaskId, TaskInfo>,
    activations: Vec<(TaskId, ExecutionId)>,
    created: Vec<NewTask>,
    escalations: Vec<(TaskId, Escalation)>,
    next_created: u64,
}

/// Automatic completion behaviour for [`InMemoryTaskStore`].
#[derive(Debug, Clone, Default)]
pub struct AutoComplete {
    /// Tasks that report failure instead of success.
    pub failing: HashSet<TaskId>,
    /// Output reported for specific tasks; others succeed with `{}`.
    pub outputs: HashMap<TaskId, JsonValue>,
}

/// A task store backed by a map, publishing completions on a broadcast
/// channel.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    state: RwLock<TaskState>,
    completions: broadcast::Sender<TaskCompletion>,
    auto_complete: Option<AutoComplete>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    /// Creates a store where tasks complete only via [`Self::complete`].
    #[must_use]
    pub fn new() -> Self {
        let (completions, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(TaskState::default()),
            completions,
            auto_complete: None,
        }
    }

    /// Creates a store that completes every task as soon as it is activated.
    #[must_use]
    pub fn auto_completing(auto_complete: AutoComplete) -> Self {
        Self {
            auto_complete: Some(auto_complete),
            ..Self::new()
        }
    }

    /// Registers a task.
    pub async fn insert(&self, task_id: impl Into<TaskId>, title: impl Into<String>) {
        let task_id = task_id.into();
        self.state.write().await.tasks.insert(
            task_id.clone(),
            TaskInfo {
                task_id,
                title: title.into(),
                status: TaskStatus::Open,
                priority: TaskPriority::Normal,
                assignee: None,
            },
        );
    }

    /// Reports a task completion to subscribers.
    pub async fn complete(
        &self,
        task_id: impl Into<TaskId>,
        execution_id: Option<ExecutionId>,
        outcome: TaskOutcome,
    ) {
        let task_id = task_id.into();
        let status = match outcome {
            TaskOutcome::Success { .. } => TaskStatus::Done,
            TaskOutcome::Failure { .. } => TaskStatus::Failed,
        };
        if let Some(task) = self.state.write().await.tasks.get_mut(&task_id) {
            task.status = status;
        }
        // No subscribers is fine.
        let _ = self.completions.send(TaskCompletion {
            execution_id,
            task_id,
            outcome,
        });
    }

    /// Returns every `(task, execution)` activation so far.
    pub async fn activations(&self) -> Vec<(TaskId, ExecutionId)> {
        self.state.read().await.activations.clone()
    }

    /// Returns tasks created through [`TaskStore::create`].
    pub async fn created(&self) -> Vec<NewTask> {
        self.state.read().await.created.clone()
    }

    /// Returns escalations applied so far.
    pub async fn escalations(&self) -> Vec<(TaskId, Escalation)> {
        self.state.read().await.escalations.clone()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn resolve(&self, task_id: &TaskId) -> Result<TaskInfo, ServiceError> {
        self.state
            .read()
            .await
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| ServiceError::TaskNotFound {
                task_id: task_id.clone(),
            })
    }

    async fn activate(
        &self,
        task_id: &TaskId,
        execution_id: ExecutionId,
    ) -> Result<(), ServiceError> {
        {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .entry(task_id.clone())
                .or_insert_with(|| TaskInfo {
                    task_id: task_id.clone(),
                    title: task_id.to_string(),
                    status: TaskStatus::Open,
                    priority: TaskPriority::Normal,
                    assignee: None,
                });
            task.status = TaskStatus::InProgress;
            state.activations.push((task_id.clone(), execution_id));
        }
        debug!(%task_id, %execution_id, "task activated");

        if let Some(auto) = &self.auto_complete {
            let outcome = if auto.failing.contains(task_id) {
                TaskOutcome::failure(format!("task {task_id} failed"))
            } else {
                let output = auto
                    .outputs
                    .get(task_id)
                    .cloned()
                    .unwrap_or_else(|| JsonValue::Object(serde_json::Map::new()));
                TaskOutcome::success(output)
            };
            self.complete(task_id.clone(), Some(execution_id), outcome)
                .await;
        }
        Ok(())
    }

    async fn create(&self, task: NewTask) -> Result<TaskId, ServiceError> {
        let mut state = self.state.write().await;
        state.next_created += 1;
        let task_id = TaskId::new(format!("auto-{}", state.next_created));
        state.tasks.insert(
            task_id.clone(),
            TaskInfo {
                task_id: task_id.clone(),
                title: task.title.clone(),
                status: TaskStatus::Open,
                priority: task.priority,
                assignee: task.assignee.clone(),
            },
        );
        state.created.push(task);
        Ok(task_id)
    }

    async fn escalate(
        &self,
        task_id: &TaskId,
        escalation: Escalation,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ServiceError::TaskNotFound {
                task_id: task_id.clone(),
            })?;
        if let Some(priority) = escalation.priority {
            task.priority = priority;
        }
        if let Some(assignee) = &escalation.reassign_to {
            task.assignee = Some(assignee.clone());
        }
        state.escalations.push((task_id.clone(), escalation));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskCompletion> {
        self.completions.subscribe()
    }
}

/// A notification that was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub kind: String,
    pub recipients: Vec<String>,
    pub payload: JsonValue,
}

/// A notification sender that records every send.
#[derive(Debug, Default)]
pub struct RecordingNotificationSender {
    sent: RwLock<Vec<SentNotification>>,
}

impl RecordingNotificationSender {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything sent so far.
    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotificationSender {
    async fn send(
        &self,
        kind: &str,
        recipients: &[String],
        payload: JsonValue,
    ) -> Result<(), ServiceError> {
        debug!(kind, recipients = recipients.len(), "notification sent");
        self.sent.write().await.push(SentNotification {
            kind: kind.to_string(),
            recipients: recipients.to_vec(),
            payload,
        });
        Ok(())
    }
}
