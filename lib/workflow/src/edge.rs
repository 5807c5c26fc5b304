//! Edge types for workflow graphs.
//!
//! Edges connect a source node to a target node. Their kind decides how the
//! engine treats them when the source occurrence advances:
//! - `default` and `parallel` edges are always followed
//! - `conditional` edges are followed only when their condition holds

use crate::condition::Condition;
use serde::{Deserialize, Serialize};
use taskflow_core::{EdgeId, NodeId};

/// How an edge participates in traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Always followed.
    #[default]
    Default,
    /// Followed only when its condition evaluates true.
    Conditional,
    /// Always followed; marks an intentional fan-out branch.
    Parallel,
}

/// An edge between two nodes of a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Identifier, unique within the definition.
    pub id: EdgeId,
    /// The node this edge leaves.
    pub source: NodeId,
    /// The node this edge enters.
    pub target: NodeId,
    /// Traversal kind.
    #[serde(default)]
    pub kind: EdgeKind,
    /// Condition, used only when `kind` is `conditional` (or when the edge
    /// leaves a decision node without explicit branches).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Edge {
    /// Creates a default edge.
    #[must_use]
    pub fn new(
        id: impl Into<EdgeId>,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Default,
            condition: None,
        }
    }

    /// Creates a conditional edge.
    #[must_use]
    pub fn conditional(
        id: impl Into<EdgeId>,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        condition: impl Into<Condition>,
    ) -> Self {
        Self {
            kind: EdgeKind::Conditional,
            condition: Some(condition.into()),
            ..Self::new(id, source, target)
        }
    }

    /// Creates a parallel edge.
    #[must_use]
    pub fn parallel(
        id: impl Into<EdgeId>,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
    ) -> Self {
        Self {
            kind: EdgeKind::Parallel,
            ..Self::new(id, source, target)
        }
    }
}
