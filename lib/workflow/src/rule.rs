//! Rule definitions.
//!
//! Rules are side-effect policies attached to a workflow definition. The rule
//! engine evaluates them against every execution log entry; this module only
//! holds the data.

use crate::condition::Condition;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use taskflow_core::{RuleId, TaskId};

/// The kind of a rule, derived from its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Automation,
    Validation,
    Notification,
    Escalation,
}

/// Rule priority. Higher priorities are evaluated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Priority of a task in the external task system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// What a validation rule does when it matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Marks the execution failed.
    Fail { reason: String },
    /// Appends a warning entry.
    Warn { message: String },
}

/// The action a rule performs, which also fixes its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Creates a new external task.
    Automation {
        /// Title of the new task.
        title: String,
        /// Optional assignee.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
        /// Priority of the new task.
        #[serde(default)]
        priority: TaskPriority,
    },
    /// Fails the execution or appends a warning.
    Validation(ValidationOutcome),
    /// Sends a notification.
    Notification {
        /// Notification type understood by the sender.
        notification_type: String,
        /// Recipients.
        #[serde(default)]
        recipients: Vec<String>,
        /// Payload template.
        #[serde(default)]
        template: JsonValue,
    },
    /// Raises a task's priority and/or reassigns it.
    Escalation {
        /// Task to escalate; defaults to the task of the entry's node.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskId>,
        /// New priority.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<TaskPriority>,
        /// New assignee.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reassign_to: Option<String>,
    },
}

impl RuleAction {
    /// Returns the rule kind this action belongs to.
    #[must_use]
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::Automation { .. } => RuleKind::Automation,
            Self::Validation(_) => RuleKind::Validation,
            Self::Notification { .. } => RuleKind::Notification,
            Self::Escalation { .. } => RuleKind::Escalation,
        }
    }
}

/// A rule attached to a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier.
    #[serde(default)]
    pub id: RuleId,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Condition evaluated against the log entry and execution context.
    pub condition: Condition,
    /// Action performed when the condition matches.
    pub action: RuleAction,
    /// Evaluation priority.
    #[serde(default)]
    pub priority: RulePriority,
    /// Disabled rules are skipped without evaluation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Creates an enabled rule with medium priority.
    #[must_use]
    pub fn new(name: impl Into<String>, condition: impl Into<Condition>, action: RuleAction) -> Self {
        Self {
            id: RuleId::new(),
            name: name.into(),
            condition: condition.into(),
            action,
            priority: RulePriority::Medium,
            enabled: true,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: RulePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns the rule kind.
    #[must_use]
    pub fn kind(&self) -> RuleKind {
        self.action.kind()
    }
}
