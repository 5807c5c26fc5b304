//! Frontier of an execution instance.
//!
//! The frontier is the remaining-work view of a running instance:
//! - the active node occurrences and what each is suspended on
//! - per-node visit counters (so every loop iteration is a new occurrence)
//! - partially satisfied AND-joins
//! - the set of nodes that completed at least once (for progress)
//!
//! Arrivals are recorded per join input edge. A token is either live (the
//! source completed and took the edge) or skipped (the edge was not taken).
//! A join fires once every input has a token; it runs if any token is live
//! and is skipped otherwise.

use crate::execution::Occurrence;
use std::collections::{BTreeMap, HashMap, HashSet};
use taskflow_core::{EdgeId, ExecutionId, NodeId, TaskId};

/// What an active occurrence is suspended on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspension {
    /// Waiting for the external task to report completion.
    Task { task_id: TaskId, attempt: u32 },
    /// The task failed and a retry timer is pending.
    RetryBackoff { task_id: TaskId, attempt: u32 },
    /// Waiting for a timer.
    Timer,
    /// Waiting for a child execution.
    Subprocess { child: ExecutionId },
}

/// Result of recording an arrival at a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Other inputs have not arrived yet.
    Waiting,
    /// Every input arrived; `live` is false if all of them were skipped.
    Ready { live: bool },
}

#[derive(Debug, Clone, Default)]
struct JoinState {
    arrived: HashMap<EdgeId, bool>,
}

/// The frontier of a running instance.
#[derive(Debug, Clone, Default)]
pub struct Frontier {
    active: BTreeMap<Occurrence, Suspension>,
    visits: HashMap<NodeId, u32>,
    joins: HashMap<NodeId, JoinState>,
    completed: HashSet<NodeId>,
}

impl Frontier {
    /// Creates an empty frontier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the next occurrence of a node.
    pub fn next_occurrence(&mut self, node_id: &NodeId) -> Occurrence {
        let visit = self.visits.entry(node_id.clone()).or_insert(0);
        *visit += 1;
        Occurrence::new(node_id.clone(), *visit)
    }

    /// Records that an occurrence is now suspended.
    pub fn suspend(&mut self, occurrence: Occurrence, suspension: Suspension) {
        self.active.insert(occurrence, suspension);
    }

    /// Returns what an occurrence is suspended on, if it is active.
    #[must_use]
    pub fn suspension(&self, occurrence: &Occurrence) -> Option<&Suspension> {
        self.active.get(occurrence)
    }

    /// Finds the oldest occurrence waiting on `task_id`.
    #[must_use]
    pub fn waiting_on_task(&self, task_id: &TaskId) -> Option<(Occurrence, u32)> {
        self.active
            .iter()
            .find_map(|(occurrence, suspension)| match suspension {
                Suspension::Task {
                    task_id: waiting,
                    attempt,
                } if waiting == task_id => Some((occurrence.clone(), *attempt)),
                _ => None,
            })
    }

    /// Marks an occurrence complete.
    ///
    /// Returns false if the occurrence was not active.
    pub fn complete(&mut self, occurrence: &Occurrence) -> bool {
        let was_active = self.active.remove(occurrence).is_some();
        self.completed.insert(occurrence.node_id.clone());
        was_active
    }

    /// Records a token arriving at `node_id` over `edge`.
    ///
    /// `inputs` are the edges the node joins over. A node with at most one
    /// input is ready as soon as anything arrives.
    pub fn arrive(
        &mut self,
        node_id: &NodeId,
        edge: &EdgeId,
        live: bool,
        inputs: &[&EdgeId],
    ) -> JoinOutcome {
        if inputs.len() <= 1 {
            return JoinOutcome::Ready { live };
        }

        let state = self.joins.entry(node_id.clone()).or_default();
        let token = state.arrived.entry(edge.clone()).or_insert(false);
        *token |= live;

        if inputs.iter().all(|input| state.arrived.contains_key(*input)) {
            let live = state.arrived.values().any(|live| *live);
            self.joins.remove(node_id);
            JoinOutcome::Ready { live }
        } else {
            JoinOutcome::Waiting
        }
    }

    /// Forgets partial arrivals at every join matching `in_scope`.
    pub fn reset_joins(&mut self, in_scope: impl Fn(&NodeId) -> bool) {
        self.joins.retain(|node_id, _| !in_scope(node_id));
    }

    /// Returns the active occurrences in a stable order.
    #[must_use]
    pub fn active(&self) -> Vec<Occurrence> {
        self.active.keys().cloned().collect()
    }

    /// Returns true if nothing is active.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Returns joins that have some but not all of their inputs.
    #[must_use]
    pub fn pending_joins(&self) -> Vec<NodeId> {
        let mut pending: Vec<_> = self.joins.keys().cloned().collect();
        pending.sort();
        pending
    }

    /// Returns children of subprocess occurrences still running.
    #[must_use]
    pub fn running_children(&self) -> Vec<ExecutionId> {
        self.active
            .values()
            .filter_map(|suspension| match suspension {
                Suspension::Subprocess { child } => Some(*child),
                _ => None,
            })
            .collect()
    }

    /// Drops every active occurrence.
    pub fn clear_active(&mut self) {
        self.active.clear();
    }

    /// Returns the number of distinct nodes that completed.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}
