//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `WorkflowError`: definition lifecycle problems
//! - `StoreError` / `ServiceError`: failures reported by collaborators
//! - `EngineError`: engine API failures, returned as `Report<EngineError>`
//! - `ExecutionFailure`: why an execution instance ended up `failed`

use crate::definition::WorkflowStatus;
use crate::validate::ValidationReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use taskflow_core::{ExecutionId, NodeId, TaskId, WorkflowId};

/// Errors from definition lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Invalid state transition.
    InvalidStateTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    /// The definition can no longer be edited.
    NotEditable {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    },
    /// The definition failed validation.
    Invalid {
        workflow_id: WorkflowId,
        report: ValidationReport,
    },
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStateTransition { from, to } => {
                write!(f, "invalid state transition from {from} to {to}")
            }
            Self::NotEditable {
                workflow_id,
                status,
            } => write!(f, "workflow {workflow_id} is {status} and cannot be edited"),
            Self::Invalid {
                workflow_id,
                report,
            } => write!(f, "workflow {workflow_id} is invalid: {report}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

/// Errors from the workflow store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Workflow not found.
    NotFound { workflow_id: WorkflowId },
    /// A workflow with this id already exists.
    AlreadyExists { workflow_id: WorkflowId },
    /// The caller's version is stale.
    VersionConflict {
        workflow_id: WorkflowId,
        expected: u64,
        actual: u64,
    },
    /// The update would store an invalid definition.
    Rejected { workflow_id: WorkflowId },
    /// The backing store failed.
    Unavailable { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { workflow_id } => write!(f, "workflow not found: {workflow_id}"),
            Self::AlreadyExists { workflow_id } => {
                write!(f, "workflow already exists: {workflow_id}")
            }
            Self::VersionConflict {
                workflow_id,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on workflow {workflow_id}: expected {expected}, found {actual}"
            ),
            Self::Rejected { workflow_id } => {
                write!(f, "update rejected for workflow {workflow_id}")
            }
            Self::Unavailable { message } => write!(f, "workflow store unavailable: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from task store and notification collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The referenced task does not exist.
    TaskNotFound { task_id: TaskId },
    /// The collaborator failed.
    Unavailable { message: String },
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskNotFound { task_id } => write!(f, "task not found: {task_id}"),
            Self::Unavailable { message } => write!(f, "collaborator unavailable: {message}"),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Errors returned by the execution engine API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The workflow does not exist.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// The workflow is not active.
    NotTriggerable {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    },
    /// The workflow failed validation.
    InvalidDefinition { workflow_id: WorkflowId },
    /// The execution does not exist.
    ExecutionNotFound { execution_id: ExecutionId },
    /// The workflow store failed.
    Store { message: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::NotTriggerable {
                workflow_id,
                status,
            } => write!(f, "workflow {workflow_id} is {status}, not active"),
            Self::InvalidDefinition { workflow_id } => {
                write!(f, "workflow {workflow_id} has an invalid graph")
            }
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::Store { message } => write!(f, "workflow store failed: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Why an execution instance failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// No decision branch matched and there was no else branch.
    UnmatchedDecision { node_id: NodeId },
    /// A task reported failure and its retries are exhausted.
    TaskFailure {
        node_id: NodeId,
        task_id: TaskId,
        attempts: u32,
        reason: String,
    },
    /// The instance exceeded its maximum duration.
    Timeout { max_duration_ms: u64 },
    /// A child execution failed.
    SubprocessFailure {
        node_id: NodeId,
        child: Option<ExecutionId>,
        reason: String,
    },
    /// A condition could not be evaluated.
    InvalidCondition {
        node_id: NodeId,
        condition: String,
        reason: String,
    },
    /// A single transition processed too many steps.
    StepLimitExceeded { limit: usize },
    /// Nothing is active but some joins are still waiting.
    JoinNeverSatisfied { nodes: Vec<NodeId> },
    /// A validation rule rejected the execution.
    RuleRejected { rule: String, reason: String },
    /// A collaborator call failed.
    Collaborator {
        node_id: Option<NodeId>,
        reason: String,
    },
}

impl ExecutionFailure {
    /// Returns the node the failure is attributed to, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::UnmatchedDecision { node_id }
            | Self::TaskFailure { node_id, .. }
            | Self::SubprocessFailure { node_id, .. }
            | Self::InvalidCondition { node_id, .. } => Some(node_id),
            Self::Collaborator { node_id, .. } => node_id.as_ref(),
            Self::JoinNeverSatisfied { nodes } => nodes.first(),
            Self::Timeout { .. } | Self::StepLimitExceeded { .. } | Self::RuleRejected { .. } => {
                None
            }
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmatchedDecision { node_id } => {
                write!(f, "UnmatchedDecisionError: no branch matched at {node_id}")
            }
            Self::TaskFailure {
                node_id,
                task_id,
                attempts,
                reason,
            } => write!(
                f,
                "TaskFailure: task {task_id} at {node_id} failed after {attempts} attempt(s): {reason}"
            ),
            Self::Timeout { max_duration_ms } => {
                write!(f, "TimeoutError: exceeded maximum duration of {max_duration_ms}ms")
            }
            Self::SubprocessFailure {
                node_id, reason, ..
            } => write!(f, "SubprocessFailure at {node_id}: {reason}"),
            Self::InvalidCondition {
                node_id,
                condition,
                reason,
            } => write!(f, "invalid condition '{condition}' at {node_id}: {reason}"),
            Self::StepLimitExceeded { limit } => {
                write!(f, "step limit of {limit} exceeded in a single transition")
            }
            Self::JoinNeverSatisfied { nodes } => {
                let names: Vec<_> = nodes.iter().map(NodeId::as_str).collect();
                write!(f, "joins can no longer be satisfied: {}", names.join(", "))
            }
            Self::RuleRejected { rule, reason } => {
                write!(f, "rejected by rule '{rule}': {reason}")
            }
            Self::Collaborator { reason, .. } => write!(f, "collaborator failed: {reason}"),
        }
    }
}

impl std::error::Error for ExecutionFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_error_display() {
        let err = WorkflowError::InvalidStateTransition {
            from: WorkflowStatus::Draft,
            to: WorkflowStatus::Paused,
        };
        assert_eq!(err.to_string(), "invalid state transition from draft to paused");
    }

    #[test]
    fn store_conflict_display() {
        let workflow_id = WorkflowId::new();
        let err = StoreError::VersionConflict {
            workflow_id,
            expected: 2,
            actual: 3,
        };
        assert!(err.to_string().contains("expected 2, found 3"));
    }

    #[test]
    fn unmatched_decision_names_error_kind() {
        let failure = ExecutionFailure::UnmatchedDecision {
            node_id: NodeId::from("d"),
        };
        assert!(failure.to_string().starts_with("UnmatchedDecisionError"));
        assert_eq!(failure.node_id().map(NodeId::as_str), Some("d"));
    }

    #[test]
    fn failure_serializes_with_kind_tag() {
        let failure = ExecutionFailure::Timeout {
            max_duration_ms: 500,
        };
        let json = serde_json::to_value(&failure).expect("serialize");
        assert_eq!(json["kind"], "timeout");
    }

    #[test]
    fn engine_error_display() {
        let execution_id = ExecutionId::new();
        let err = EngineError::ExecutionNotFound { execution_id };
        assert!(err.to_string().contains("execution not found"));
    }
}
