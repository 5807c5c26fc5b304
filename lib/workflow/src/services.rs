//! Contracts for external collaborators.
//!
//! The engine never persists or delivers anything itself: definitions come
//! from a [`WorkflowStore`], tasks live in a [`TaskStore`], notifications go
//! through a [`NotificationSender`] and time comes from a [`Clock`].
//! In-memory implementations live in [`crate::memory`].

use crate::definition::{WorkflowDefinition, WorkflowSummary};
use crate::error::{ServiceError, StoreError};
use crate::rule::TaskPriority;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use taskflow_core::{ExecutionId, TaskId, WorkflowId};
use tokio::sync::broadcast;

/// Persistence for workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Stores a new definition.
    async fn create(&self, definition: WorkflowDefinition)
    -> Result<WorkflowDefinition, StoreError>;

    /// Loads a definition.
    async fn get(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, StoreError>;

    /// Replaces a definition if the stored version equals `expected_version`.
    ///
    /// Returns the stored definition with its version incremented.
    async fn update(
        &self,
        definition: WorkflowDefinition,
        expected_version: u64,
    ) -> Result<WorkflowDefinition, StoreError>;

    /// Removes a definition.
    async fn delete(&self, workflow_id: WorkflowId) -> Result<(), StoreError>;

    /// Lists stored definitions.
    async fn list(&self) -> Result<Vec<WorkflowSummary>, StoreError>;
}

/// Lifecycle status of an external task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Done,
    Failed,
}

/// What the task store knows about a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

/// A task to be created by an automation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub priority: TaskPriority,
    /// The execution whose rule created the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

/// A change requested by an escalation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reassign_to: Option<String>,
}

/// How a task finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The task succeeded; `output` is merged into the execution context.
    Success {
        #[serde(default)]
        output: JsonValue,
    },
    /// The task failed.
    Failure { reason: String },
}

impl TaskOutcome {
    /// A success carrying `output`.
    #[must_use]
    pub fn success(output: JsonValue) -> Self {
        Self::Success { output }
    }

    /// A failure with a reason.
    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }
}

/// A task completion signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompletion {
    /// The execution the task was activated for. `None` delivers the
    /// completion to every execution waiting on the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
}

/// The external task system.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Resolves a task id to its current information.
    async fn resolve(&self, task_id: &TaskId) -> Result<TaskInfo, ServiceError>;

    /// Tells the task system that an execution is now waiting on a task.
    async fn activate(&self, task_id: &TaskId, execution_id: ExecutionId)
    -> Result<(), ServiceError>;

    /// Creates a new task.
    async fn create(&self, task: NewTask) -> Result<TaskId, ServiceError>;

    /// Raises a task's priority or reassigns it.
    async fn escalate(&self, task_id: &TaskId, escalation: Escalation)
    -> Result<(), ServiceError>;

    /// Subscribes to task completions.
    fn subscribe(&self) -> broadcast::Receiver<TaskCompletion>;
}

/// Delivery of notifications. Sends are fire-and-forget for the engine.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Sends a notification.
    async fn send(
        &self,
        kind: &str,
        recipients: &[String],
        payload: JsonValue,
    ) -> Result<(), ServiceError>;
}

/// Current time and timers.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Completes after `duration` has elapsed.
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time with tokio timers.
///
/// Under a paused tokio runtime the timers follow tokio's virtual time while
/// [`Clock::now`] still reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
