//! Workflow node types and configurations.
//!
//! Every node has an id unique within its definition, a human-readable name
//! and a kind-specific configuration. The seven kinds form a closed sum type,
//! so the engine dispatches with an exhaustive `match`.

use crate::condition::Condition;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use taskflow_core::{EdgeId, NodeId, TaskId, WorkflowId};

/// The kind of a workflow node, without its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    Task,
    Decision,
    Wait,
    Subprocess,
    Notification,
    End,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Task => "task",
            Self::Decision => "decision",
            Self::Wait => "wait",
            Self::Subprocess => "subprocess",
            Self::Notification => "notification",
            Self::End => "end",
        };
        f.write_str(name)
    }
}

/// Retry behaviour for a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after every retry.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Creates a policy with the default backoff curve.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_backoff_multiplier(),
        }
    }

    /// Sets the initial backoff.
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the delay to wait before attempt number `next_attempt`
    /// (2 for the first retry).
    #[must_use]
    pub fn backoff_before(&self, next_attempt: u32) -> Duration {
        let retries_so_far = next_attempt.saturating_sub(2);
        let factor = self.multiplier.max(1.0).powi(i32::try_from(retries_so_far).unwrap_or(i32::MAX));
        let millis = (self.initial_backoff_ms as f64 * factor).min(u64::MAX as f64);
        Duration::from_millis(millis as u64)
    }
}

/// One branch of a decision node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionBranch {
    /// Condition guarding this branch; `None` marks the else branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// The outgoing edge taken when this branch matches.
    pub edge: EdgeId,
}

impl DecisionBranch {
    /// Creates a guarded branch.
    #[must_use]
    pub fn when(condition: impl Into<Condition>, edge: impl Into<EdgeId>) -> Self {
        Self {
            condition: Some(condition.into()),
            edge: edge.into(),
        }
    }

    /// Creates the else branch.
    #[must_use]
    pub fn otherwise(edge: impl Into<EdgeId>) -> Self {
        Self {
            condition: None,
            edge: edge.into(),
        }
    }
}

/// Configuration for a node, varying by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Entry point of the flow.
    Start,
    /// Blocks until the external task reports completion.
    Task {
        /// The external task this node waits on.
        task: TaskId,
        /// Retry policy applied when the task reports failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
    },
    /// Picks exactly one outgoing edge.
    Decision {
        /// Ordered branches. When empty, the outgoing edges' own conditions
        /// are used in declaration order.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        branches: Vec<DecisionBranch>,
    },
    /// Suspends the branch for a fixed duration.
    Wait {
        /// Duration in milliseconds.
        duration_ms: u64,
    },
    /// Runs another workflow definition as a nested execution.
    Subprocess {
        /// The referenced definition.
        workflow: WorkflowId,
        /// When set, a failed child is recorded as a warning and the parent
        /// advances anyway.
        #[serde(default)]
        continue_on_error: bool,
    },
    /// Fire-and-forget notification.
    Notification {
        /// Notification type understood by the sender.
        notification_type: String,
        /// Recipients.
        #[serde(default)]
        recipients: Vec<String>,
        /// Payload template; `{{path}}` placeholders inside strings are
        /// filled from the execution context.
        #[serde(default)]
        template: JsonValue,
    },
    /// Marks its branch complete.
    End,
}

impl NodeConfig {
    /// Returns the kind of this configuration.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Start => NodeKind::Start,
            Self::Task { .. } => NodeKind::Task,
            Self::Decision { .. } => NodeKind::Decision,
            Self::Wait { .. } => NodeKind::Wait,
            Self::Subprocess { .. } => NodeKind::Subprocess,
            Self::Notification { .. } => NodeKind::Notification,
            Self::End => NodeKind::End,
        }
    }
}

/// A workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the definition.
    pub id: NodeId,
    /// Human-readable name.
    pub name: String,
    /// Kind-specific configuration.
    #[serde(flatten)]
    pub config: NodeConfig,
}

impl Node {
    /// Creates a node.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, name: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            config,
        }
    }

    /// Creates a start node.
    #[must_use]
    pub fn start(id: impl Into<NodeId>) -> Self {
        Self::new(id, "Start", NodeConfig::Start)
    }

    /// Creates an end node.
    #[must_use]
    pub fn end(id: impl Into<NodeId>, name: impl Into<String>) -> Self {
        Self::new(id, name, NodeConfig::End)
    }

    /// Creates a task node without a retry policy.
    #[must_use]
    pub fn task(id: impl Into<NodeId>, name: impl Into<String>, task: impl Into<TaskId>) -> Self {
        Self::new(
            id,
            name,
            NodeConfig::Task {
                task: task.into(),
                retry: None,
            },
        )
    }

    /// Creates a decision node with explicit branches.
    #[must_use]
    pub fn decision(
        id: impl Into<NodeId>,
        name: impl Into<String>,
        branches: Vec<DecisionBranch>,
    ) -> Self {
        Self::new(id, name, NodeConfig::Decision { branches })
    }

    /// Creates a wait node.
    #[must_use]
    pub fn wait(id: impl Into<NodeId>, name: impl Into<String>, duration: Duration) -> Self {
        Self::new(
            id,
            name,
            NodeConfig::Wait {
                duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            },
        )
    }

    /// Returns the kind of this node.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }

    /// Returns the task referenced by a task node.
    #[must_use]
    pub fn task_ref(&self) -> Option<&TaskId> {
        match &self.config {
            NodeConfig::Task { task, .. } => Some(task),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_follows_config() {
        assert_eq!(Node::start("s").kind(), NodeKind::Start);
        assert_eq!(Node::task("t", "Review", "review").kind(), NodeKind::Task);
        assert_eq!(Node::end("e", "Done").kind(), NodeKind::End);
    }

    #[test]
    fn node_json_uses_kind_tag() {
        let node = Node::task("review", "Review", "task-42");
        let json = serde_json::to_value(&node).expect("serialize");
        assert_eq!(json["kind"], "task");
        assert_eq!(json["task"], "task-42");

        let parsed: Node = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, node);
    }

    #[test]
    fn decision_branches_parse_with_else() {
        let json = serde_json::json!({
            "id": "d",
            "name": "Approved?",
            "kind": "decision",
            "branches": [
                { "condition": "approved", "edge": "yes" },
                { "edge": "no" }
            ]
        });
        let node: Node = serde_json::from_value(json).expect("deserialize");
        match node.config {
            NodeConfig::Decision { branches } => {
                assert_eq!(branches.len(), 2);
                assert!(branches[1].condition.is_none());
            }
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn retry_backoff_grows_exponentially() {
        let policy = RetryPolicy::new(4).with_initial_backoff(Duration::from_millis(100));
        assert_eq!(policy.backoff_before(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_before(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_before(4), Duration::from_millis(400));
    }
}
