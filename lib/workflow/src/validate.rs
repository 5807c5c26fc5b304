//! Structural validation of workflow definitions.
//!
//! Validation is pure: it looks only at the definition and collects every
//! violation rather than stopping at the first one.

use crate::condition::{Condition, ConditionError};
use crate::definition::WorkflowDefinition;
use crate::edge::EdgeKind;
use crate::graph::WorkflowGraph;
use crate::node::{DecisionBranch, NodeConfig, NodeKind};
use std::collections::HashSet;
use std::fmt;
use taskflow_core::{EdgeId, NodeId};

/// A single violated structural invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphViolation {
    /// The definition has no start node.
    MissingStart,
    /// The definition has more than one start node.
    MultipleStarts { nodes: Vec<NodeId> },
    /// Two nodes share an id.
    DuplicateNode { node_id: NodeId },
    /// Two edges share an id.
    DuplicateEdge { edge_id: EdgeId },
    /// An edge references a node that does not exist.
    DanglingEdge { edge_id: EdgeId, missing: NodeId },
    /// A node cannot be reached from the start node.
    Unreachable { node_id: NodeId },
    /// An end node has outgoing edges.
    EndHasOutgoing { node_id: NodeId },
    /// A reachable node other than an end has no outgoing edges.
    DeadEnd { node_id: NodeId },
    /// A decision node has fewer than two outgoing edges.
    DecisionTooFewEdges { node_id: NodeId, count: usize },
    /// A decision branch other than the last has no condition.
    DecisionMissingCondition { node_id: NodeId, edge_id: EdgeId },
    /// Two decision branches share the same condition text.
    DecisionDuplicateCondition { node_id: NodeId, condition: String },
    /// A decision branch names an edge that does not leave the node.
    DecisionUnknownEdge { node_id: NodeId, edge_id: EdgeId },
    /// A conditional edge has no condition.
    ConditionalEdgeWithoutCondition { edge_id: EdgeId },
    /// A condition does not parse.
    InvalidCondition { location: String, error: ConditionError },
}

impl fmt::Display for GraphViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingStart => write!(f, "no start node"),
            Self::MultipleStarts { nodes } => {
                let names: Vec<_> = nodes.iter().map(NodeId::as_str).collect();
                write!(f, "multiple start nodes: {}", names.join(", "))
            }
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id {node_id}"),
            Self::DuplicateEdge { edge_id } => write!(f, "duplicate edge id {edge_id}"),
            Self::DanglingEdge { edge_id, missing } => {
                write!(f, "edge {edge_id} references missing node {missing}")
            }
            Self::Unreachable { node_id } => {
                write!(f, "node {node_id} is not reachable from start")
            }
            Self::EndHasOutgoing { node_id } => {
                write!(f, "end node {node_id} has outgoing edges")
            }
            Self::DeadEnd { node_id } => {
                write!(f, "node {node_id} has no outgoing edges and is not an end node")
            }
            Self::DecisionTooFewEdges { node_id, count } => write!(
                f,
                "decision node {node_id} needs at least 2 outgoing edges, has {count}"
            ),
            Self::DecisionMissingCondition { node_id, edge_id } => write!(
                f,
                "decision node {node_id}: edge {edge_id} has no condition and is not the last branch"
            ),
            Self::DecisionDuplicateCondition { node_id, condition } => write!(
                f,
                "decision node {node_id}: condition '{condition}' is used more than once"
            ),
            Self::DecisionUnknownEdge { node_id, edge_id } => write!(
                f,
                "decision node {node_id}: branch edge {edge_id} does not leave this node"
            ),
            Self::ConditionalEdgeWithoutCondition { edge_id } => {
                write!(f, "conditional edge {edge_id} has no condition")
            }
            Self::InvalidCondition { location, error } => {
                write!(f, "invalid condition on {location}: {error}")
            }
        }
    }
}

/// Every violation found in a definition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationReport {
    violations: Vec<GraphViolation>,
}

impl ValidationReport {
    /// Returns the violations.
    #[must_use]
    pub fn violations(&self) -> &[GraphViolation] {
        &self.violations
    }

    /// Returns true if nothing was violated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Returns true if a matching violation was recorded.
    pub fn contains(&self, predicate: impl Fn(&GraphViolation) -> bool) -> bool {
        self.violations.iter().any(predicate)
    }

    fn push(&mut self, violation: GraphViolation) {
        self.violations.push(violation);
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} graph violation(s)", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n  - {violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationReport {}

/// Validates a definition.
///
/// # Errors
///
/// Returns a report listing every violated invariant.
pub fn validate(definition: &WorkflowDefinition) -> Result<(), ValidationReport> {
    let mut report = ValidationReport::default();
    let graph = WorkflowGraph::from_definition(definition);

    check_ids(definition, &mut report);
    check_start(definition, &mut report);

    for dangling in graph.dangling_edges() {
        report.push(GraphViolation::DanglingEdge {
            edge_id: dangling.edge.clone(),
            missing: dangling.missing.clone(),
        });
    }

    if graph.start().is_some() {
        let reachable = graph.reachable_from_start();
        for node in graph.nodes() {
            if !reachable.contains(&node.id) {
                report.push(GraphViolation::Unreachable {
                    node_id: node.id.clone(),
                });
            } else if node.kind() != NodeKind::End && graph.outgoing(&node.id).is_empty() {
                report.push(GraphViolation::DeadEnd {
                    node_id: node.id.clone(),
                });
            }
        }
    }

    for node in graph.nodes_of_kind(NodeKind::End) {
        if !graph.outgoing(&node.id).is_empty() {
            report.push(GraphViolation::EndHasOutgoing {
                node_id: node.id.clone(),
            });
        }
    }

    for node in graph.nodes() {
        if let NodeConfig::Decision { branches } = &node.config {
            check_decision(&graph, &node.id, branches, &mut report);
        }
    }

    for edge in &definition.edges {
        match (&edge.kind, &edge.condition) {
            (EdgeKind::Conditional, None) => {
                report.push(GraphViolation::ConditionalEdgeWithoutCondition {
                    edge_id: edge.id.clone(),
                });
            }
            (_, Some(condition)) => {
                check_condition(condition, format!("edge {}", edge.id), &mut report);
            }
            _ => {}
        }
    }

    for rule in &definition.rules {
        check_condition(&rule.condition, format!("rule '{}'", rule.name), &mut report);
    }

    if report.is_empty() {
        Ok(())
    } else {
        Err(report)
    }
}

fn check_ids(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let mut nodes = HashSet::new();
    for node in &definition.nodes {
        if !nodes.insert(&node.id) {
            report.push(GraphViolation::DuplicateNode {
                node_id: node.id.clone(),
            });
        }
    }

    let mut edges = HashSet::new();
    for edge in &definition.edges {
        if !edges.insert(&edge.id) {
            report.push(GraphViolation::DuplicateEdge {
                edge_id: edge.id.clone(),
            });
        }
    }
}

fn check_start(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let starts: Vec<_> = definition
        .nodes
        .iter()
        .filter(|node| node.kind() == NodeKind::Start)
        .map(|node| node.id.clone())
        .collect();

    match starts.len() {
        0 => report.push(GraphViolation::MissingStart),
        1 => {}
        _ => report.push(GraphViolation::MultipleStarts { nodes: starts }),
    }
}

fn check_decision(
    graph: &WorkflowGraph,
    node_id: &NodeId,
    branches: &[DecisionBranch],
    report: &mut ValidationReport,
) {
    let outgoing = graph.outgoing(node_id);
    if outgoing.len() < 2 {
        report.push(GraphViolation::DecisionTooFewEdges {
            node_id: node_id.clone(),
            count: outgoing.len(),
        });
    }

    // Explicit branches take precedence over edge conditions.
    let tagged: Vec<(EdgeId, Option<&Condition>)> = if branches.is_empty() {
        outgoing
            .iter()
            .map(|edge| (edge.id.clone(), edge.condition.as_ref()))
            .collect()
    } else {
        for branch in branches {
            if !outgoing.iter().any(|edge| edge.id == branch.edge) {
                report.push(GraphViolation::DecisionUnknownEdge {
                    node_id: node_id.clone(),
                    edge_id: branch.edge.clone(),
                });
            }
        }
        branches
            .iter()
            .map(|branch| (branch.edge.clone(), branch.condition.as_ref()))
            .collect()
    };

    let last = tagged.len().saturating_sub(1);
    let mut seen = HashSet::new();
    for (position, (edge_id, condition)) in tagged.into_iter().enumerate() {
        match condition {
            None if position != last => {
                report.push(GraphViolation::DecisionMissingCondition {
                    node_id: node_id.clone(),
                    edge_id,
                });
            }
            None => {}
            Some(condition) => {
                if !seen.insert(condition.as_str().trim().to_string()) {
                    report.push(GraphViolation::DecisionDuplicateCondition {
                        node_id: node_id.clone(),
                        condition: condition.to_string(),
                    });
                }
                if !branches.is_empty() {
                    check_condition(condition, format!("node {node_id}"), report);
                }
            }
        }
    }
}

fn check_condition(condition: &Condition, location: String, report: &mut ValidationReport) {
    if let Err(error) = condition.check() {
        report.push(GraphViolation::InvalidCondition { location, error });
    }
}
