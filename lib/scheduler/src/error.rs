//! Error types for the scheduler crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `TriggerError`: errors from trigger registry operations
//! - `ScheduleError`: invalid recurrences
//! - `TriggerEvaluationError`: a trigger could not be evaluated or fired

use taskflow_core::TriggerId;
use std::fmt;

/// Errors from trigger registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// Trigger not found.
    NotFound { id: TriggerId },
    /// Trigger already exists.
    AlreadyExists { id: TriggerId },
    /// Invalid trigger configuration.
    InvalidConfig { id: TriggerId, reason: String },
    /// The trigger is disabled.
    Disabled { id: TriggerId },
    /// The execution could not be launched.
    LaunchFailed { id: TriggerId, reason: String },
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "trigger not found: {id}"),
            Self::AlreadyExists { id } => write!(f, "trigger already exists: {id}"),
            Self::InvalidConfig { id, reason } => {
                write!(f, "invalid trigger config for {id}: {reason}")
            }
            Self::Disabled { id } => write!(f, "trigger is disabled: {id}"),
            Self::LaunchFailed { id, reason } => {
                write!(f, "trigger {id} failed to launch an execution: {reason}")
            }
        }
    }
}

impl std::error::Error for TriggerError {}

/// Errors from schedule operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Monthly day outside 1..=31.
    InvalidDay { day: u32 },
    /// No fire time could be computed.
    EvaluationFailed { reason: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDay { day } => {
                write!(f, "invalid day of month {day}: expected 1 to 31")
            }
            Self::EvaluationFailed { reason } => {
                write!(f, "schedule evaluation failed: {reason}")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// A trigger's schedule, predicate or launch failed while it was running.
///
/// Logged and counted; repeated failures auto-disable the trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvaluationError {
    pub trigger_id: TriggerId,
    pub reason: String,
}

impl fmt::Display for TriggerEvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TriggerEvaluationError: trigger {}: {}",
            self.trigger_id, self.reason
        )
    }
}

impl std::error::Error for TriggerEvaluationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_error_display() {
        let id = TriggerId::new();
        let err = TriggerError::NotFound { id };
        assert!(err.to_string().contains("trigger not found"));
    }

    #[test]
    fn schedule_error_display() {
        let err = ScheduleError::InvalidDay { day: 32 };
        assert!(err.to_string().contains("32"));
    }

    #[test]
    fn evaluation_error_names_its_kind() {
        let err = TriggerEvaluationError {
            trigger_id: TriggerId::new(),
            reason: "predicate failed".to_string(),
        };
        assert!(err.to_string().starts_with("TriggerEvaluationError"));
        assert!(err.to_string().contains("predicate failed"));
    }
}
