//! Task-flow orchestration engine.
//!
//! This crate provides the workflow model and its execution runtime:
//!
//! - **Definitions**: typed directed graphs of nodes and edges with triggers,
//!   rules and a draft/active/paused/completed/archived lifecycle
//! - **Graph Validator**: reports every structural violation of a definition
//! - **Conditions**: a small expression language for decisions, conditional
//!   edges and rules
//! - **Execution Engine**: one actor per execution instance, driven by
//!   messages (task completions, timers, child results, cancel)
//! - **Rule Engine**: priority-ordered side effects evaluated per log entry
//! - **Execution Monitor**: snapshots and log deltas of running instances
//! - **Collaborators**: store, task, notification and clock contracts with
//!   in-memory implementations

pub mod condition;
pub mod config;
pub mod definition;
pub mod edge;
pub mod engine;
pub mod error;
pub mod execution;
mod frontier;
pub mod graph;
mod instance;
pub mod memory;
pub mod monitor;
pub mod node;
pub mod rule;
pub mod rule_engine;
pub mod services;
pub mod template;
pub mod trigger;
pub mod validate;

pub use condition::{Condition, ConditionError};
pub use config::EngineConfig;
pub use definition::{
    ExecutionSettings, FlowType, WorkflowDefinition, WorkflowMetadata, WorkflowStatus,
    WorkflowSummary,
};
pub use edge::{Edge, EdgeKind};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, ExecutionFailure, ServiceError, StoreError, WorkflowError};
pub use execution::{
    ExecutionLog, ExecutionLogEntry, ExecutionOrigin, ExecutionSnapshot, ExecutionStatus,
    LogLevel, Occurrence,
};
pub use graph::WorkflowGraph;
pub use memory::{
    AutoComplete, InMemoryTaskStore, InMemoryWorkflowStore, RecordingNotificationSender,
};
pub use monitor::{ExecutionMonitor, SnapshotReceiver};
pub use node::{DecisionBranch, Node, NodeConfig, NodeKind, RetryPolicy};
pub use rule::{Rule, RuleAction, RuleKind, RulePriority, TaskPriority, ValidationOutcome};
pub use rule_engine::{RuleEngine, RuleOutcome};
pub use services::{
    Clock, NotificationSender, SystemClock, TaskCompletion, TaskOutcome, TaskStore,
    WorkflowStore,
};
pub use trigger::{Frequency, Recurrence, Trigger, TriggerConfig, TriggerKind};
pub use validate::{GraphViolation, ValidationReport};
