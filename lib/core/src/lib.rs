//! Core domain types and utilities for the taskflow orchestration engine.
//!
//! This crate provides the strongly-typed identifiers and the error-handling
//! foundation shared by the workflow and scheduler crates.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{EdgeId, ExecutionId, NodeId, ParseIdError, RuleId, TaskId, TriggerId, WorkflowId};
