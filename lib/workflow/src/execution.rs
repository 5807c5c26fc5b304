//! Execution instance state exposed to callers.
//!
//! The instance actor owns the mutable state; everything here is what it
//! publishes: the status, the append-only log and the snapshot handed to the
//! execution monitor after every processed message.

use crate::error::ExecutionFailure;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use taskflow_core::{ExecutionId, NodeId, TriggerId, WorkflowId};

/// The overall state of an execution instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Instance is actively executing.
    Running,
    /// Instance is paused; messages are held until it resumes.
    Paused,
    /// Every live branch reached an end node.
    Completed,
    /// An unrecovered failure ended the instance.
    Failed,
    /// Instance was cancelled by a caller.
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One runtime visit to a node.
///
/// The visit counter increases each time the same node is activated again,
/// so loop iterations are distinct occurrences.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Occurrence {
    /// The node being visited.
    pub node_id: NodeId,
    /// 1 for the first visit, 2 for the second, and so on.
    pub visit: u32,
}

impl Occurrence {
    /// Creates an occurrence.
    #[must_use]
    pub fn new(node_id: NodeId, visit: u32) -> Self {
        Self { node_id, visit }
    }
}

impl fmt::Display for Occurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node_id, self.visit)
    }
}

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
        };
        f.write_str(name)
    }
}

/// One entry of an execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    /// Position in the log, starting at 1.
    pub seq: u64,
    /// When the entry was appended. Strictly increasing within a log.
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

/// An append-only execution log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionLog {
    entries: Vec<ExecutionLogEntry>,
}

impl ExecutionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry stamped at `now`.
    ///
    /// If `now` is not after the previous entry, the timestamp is moved one
    /// microsecond past it.
    pub fn append(
        &mut self,
        now: DateTime<Utc>,
        level: LogLevel,
        message: impl Into<String>,
        node_id: Option<NodeId>,
        data: Option<JsonValue>,
    ) -> &ExecutionLogEntry {
        let timestamp = match self.entries.last() {
            Some(last) if now <= last.timestamp => last.timestamp + TimeDelta::microseconds(1),
            _ => now,
        };
        let seq = self.entries.len() as u64 + 1;
        self.entries.push(ExecutionLogEntry {
            seq,
            timestamp,
            level,
            message: message.into(),
            node_id,
            data,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Returns all entries.
    #[must_use]
    pub fn entries(&self) -> &[ExecutionLogEntry] {
        &self.entries
    }

    /// Returns entries with a sequence number greater than `since`.
    #[must_use]
    pub fn since(&self, since: u64) -> &[ExecutionLogEntry] {
        let start = usize::try_from(since)
            .unwrap_or(usize::MAX)
            .min(self.entries.len());
        &self.entries[start..]
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What started an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOrigin {
    /// An explicit "execute now" call.
    Manual,
    /// A registered trigger fired.
    Trigger { trigger_id: TriggerId },
    /// A subprocess node of another execution.
    Subprocess {
        parent: ExecutionId,
        node_id: NodeId,
    },
}

/// A consistent, read-only view of an execution instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: ExecutionId,
    pub flow_id: WorkflowId,
    /// Version of the definition this instance is running against.
    pub flow_version: u64,
    pub origin: ExecutionOrigin,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Currently active node occurrences.
    pub active: Vec<Occurrence>,
    /// The execution context.
    pub context: JsonValue,
    /// 0 to 100.
    pub progress: u8,
    pub log: ExecutionLog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExecutionFailure>,
}

impl ExecutionSnapshot {
    /// Returns true once the instance can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the sequence number of the newest log entry.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.log.entries().last().map_or(0, |entry| entry.seq)
    }
}
