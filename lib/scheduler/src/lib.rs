//! Trigger manager for taskflow workflows.
//!
//! This crate provides:
//!
//! - **Trigger Manager**: registration, lookup and reconciliation of
//!   triggers, with one background loop per active trigger
//! - **Schedules**: daily, weekly and monthly recurrences
//! - **Events**: an event bus contract and an in-process bus
//! - **Conditions**: polled predicates that fire on a false-to-true edge

pub mod config;
pub mod error;
pub mod event;
pub mod launcher;
pub mod manager;
pub mod predicate;
pub mod schedule;

pub use config::SchedulerConfig;
pub use error::{ScheduleError, TriggerError, TriggerEvaluationError};
pub use event::{EventBus, InMemoryEventBus};
pub use launcher::ExecutionLauncher;
pub use manager::{ReconcileResult, TriggerManager, TriggerRecord};
pub use predicate::{ConditionPredicate, StatePredicate};
pub use schedule::Schedule;
