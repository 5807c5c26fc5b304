//! Execution monitor: the read-only view over execution instances.
//!
//! Every instance actor owns the sending half of a `watch` channel and
//! replaces the snapshot after each processed message. The monitor keeps
//! the receiving halves, so reads always see the latest committed snapshot
//! and never wait on an actor.

use crate::execution::{ExecutionLogEntry, ExecutionSnapshot};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use taskflow_core::ExecutionId;
use tokio::sync::watch;

/// Shared snapshot receiver for one execution.
pub type SnapshotReceiver = watch::Receiver<Arc<ExecutionSnapshot>>;

/// Registry of execution snapshots.
#[derive(Debug, Default)]
pub struct ExecutionMonitor {
    executions: RwLock<HashMap<ExecutionId, SnapshotReceiver>>,
}

impl ExecutionMonitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an execution and returns the sender its actor publishes on.
    pub fn register(&self, initial: ExecutionSnapshot) -> watch::Sender<Arc<ExecutionSnapshot>> {
        let id = initial.id;
        let (tx, rx) = watch::channel(Arc::new(initial));
        self.executions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, rx);
        tx
    }

    /// Returns the latest snapshot of an execution.
    #[must_use]
    pub fn snapshot(&self, id: ExecutionId) -> Option<Arc<ExecutionSnapshot>> {
        self.executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|rx| Arc::clone(&rx.borrow()))
    }

    /// Returns log entries with a sequence number greater than `since`.
    #[must_use]
    pub fn log_delta(&self, id: ExecutionId, since: u64) -> Option<Vec<ExecutionLogEntry>> {
        self.snapshot(id)
            .map(|snapshot| snapshot.log.since(since).to_vec())
    }

    /// Subscribes to snapshot changes of an execution.
    #[must_use]
    pub fn watch(&self, id: ExecutionId) -> Option<SnapshotReceiver> {
        self.executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Waits until an execution reaches a terminal status.
    ///
    /// Returns `None` for unknown executions, or when the actor stopped
    /// without publishing a terminal snapshot.
    pub async fn wait_for_terminal(&self, id: ExecutionId) -> Option<Arc<ExecutionSnapshot>> {
        let mut rx = self.watch(id)?;
        let snapshot = rx.wait_for(|snapshot| snapshot.is_terminal()).await.ok()?;
        Some(Arc::clone(&snapshot))
    }

    /// Returns the ids of every known execution.
    #[must_use]
    pub fn executions(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<_> = self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Forgets an execution.
    pub fn remove(&self, id: ExecutionId) -> bool {
        self.executions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionLog, ExecutionOrigin, ExecutionStatus, LogLevel};
    use chrono::Utc;
    use taskflow_core::WorkflowId;

    fn snapshot(id: ExecutionId) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id,
            flow_id: WorkflowId::new(),
            flow_version: 1,
            origin: ExecutionOrigin::Manual,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            active: Vec::new(),
            context: serde_json::json!({}),
            progress: 0,
            log: ExecutionLog::new(),
            failure: None,
        }
    }

    #[test]
    fn unknown_execution_has_no_snapshot() {
        let monitor = ExecutionMonitor::new();
        assert!(monitor.snapshot(ExecutionId::new()).is_none());
        assert!(monitor.log_delta(ExecutionId::new(), 0).is_none());
    }

    #[test]
    fn snapshot_reflects_latest_publish() {
        let monitor = ExecutionMonitor::new();
        let id = ExecutionId::new();
        let tx = monitor.register(snapshot(id));

        let mut next = snapshot(id);
        next.log.append(Utc::now(), LogLevel::Info, "one", None, None);
        next.log.append(Utc::now(), LogLevel::Info, "two", None, None);
        tx.send_replace(Arc::new(next));

        let latest = monitor.snapshot(id).expect("registered");
        assert_eq!(latest.log.len(), 2);
        let delta = monitor.log_delta(id, 1).expect("registered");
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].message, "two");
        assert_eq!(monitor.executions(), vec![id]);
    }

    #[tokio::test]
    async fn wait_for_terminal_resolves_on_final_snapshot() {
        let monitor = Arc::new(ExecutionMonitor::new());
        let id = ExecutionId::new();
        let tx = monitor.register(snapshot(id));

        let waiter = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.wait_for_terminal(id).await })
        };

        let mut done = snapshot(id);
        done.status = ExecutionStatus::Completed;
        tx.send_replace(Arc::new(done));

        let final_snapshot = waiter.await.expect("join").expect("terminal");
        assert_eq!(final_snapshot.status, ExecutionStatus::Completed);
    }
}
