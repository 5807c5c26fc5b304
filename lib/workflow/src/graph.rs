//! Workflow graph implementation using petgraph.
//!
//! The graph is built from a [`WorkflowDefinition`] and is the structure the
//! validator and the execution engine both work against:
//! - node lookup by id
//! - outgoing edges in declaration order
//! - reachability from the start node
//! - back edges (loop-closing edges found by a DFS from start)
//! - nodes that sit on a cycle
//!
//! Edges whose endpoints do not exist are not added to the graph; they are
//! kept aside so the validator can report them.

use crate::definition::WorkflowDefinition;
use crate::edge::Edge;
use crate::node::{Node, NodeKind};
use petgraph::Direction;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::algo::tarjan_scc;
use petgraph::visit::{Bfs, DfsEvent, EdgeRef, depth_first_search};
use std::collections::{HashMap, HashSet};
use taskflow_core::{EdgeId, NodeId};

/// An edge that references a node id not present in the definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingEdge {
    /// The offending edge.
    pub edge: EdgeId,
    /// The missing endpoint.
    pub missing: NodeId,
}

/// A workflow graph using petgraph's directed graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: DiGraph<Node, Edge>,
    node_index_map: HashMap<NodeId, NodeIndex>,
    edge_index_map: HashMap<EdgeId, EdgeIndex>,
    start: Option<NodeIndex>,
    back_edges: HashSet<EdgeIndex>,
    cycles: HashMap<NodeIndex, usize>,
    dangling: Vec<DanglingEdge>,
}

impl WorkflowGraph {
    /// Builds the graph for a definition.
    ///
    /// Duplicate node ids keep the first occurrence. Edges with missing
    /// endpoints are recorded in [`Self::dangling_edges`] instead of being
    /// added.
    #[must_use]
    pub fn from_definition(definition: &WorkflowDefinition) -> Self {
        let mut graph = DiGraph::with_capacity(definition.nodes.len(), definition.edges.len());
        let mut node_index_map = HashMap::new();

        for node in &definition.nodes {
            if node_index_map.contains_key(&node.id) {
                continue;
            }
            let index = graph.add_node(node.clone());
            node_index_map.insert(node.id.clone(), index);
        }

        let mut edge_index_map = HashMap::new();
        let mut dangling = Vec::new();
        for edge in &definition.edges {
            let source = node_index_map.get(&edge.source);
            let target = node_index_map.get(&edge.target);
            match (source, target) {
                (Some(&source), Some(&target)) => {
                    let index = graph.add_edge(source, target, edge.clone());
                    edge_index_map.entry(edge.id.clone()).or_insert(index);
                }
                (None, _) => dangling.push(DanglingEdge {
                    edge: edge.id.clone(),
                    missing: edge.source.clone(),
                }),
                (_, None) => dangling.push(DanglingEdge {
                    edge: edge.id.clone(),
                    missing: edge.target.clone(),
                }),
            }
        }

        let start = definition
            .start_node()
            .and_then(|node| node_index_map.get(&node.id).copied());

        let mut workflow_graph = Self {
            graph,
            node_index_map,
            edge_index_map,
            start,
            back_edges: HashSet::new(),
            cycles: HashMap::new(),
            dangling,
        };
        workflow_graph.back_edges = workflow_graph.find_back_edges();
        workflow_graph.cycles = workflow_graph.find_cycles();
        workflow_graph
    }

    /// Maps every node on a cycle to the index of its strongly connected
    /// component.
    fn find_cycles(&self) -> HashMap<NodeIndex, usize> {
        let mut cycles = HashMap::new();
        for (component_index, component) in tarjan_scc(&self.graph).into_iter().enumerate() {
            let looping = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&index| self.graph.contains_edge(index, index));
            if looping {
                cycles.extend(component.into_iter().map(|index| (index, component_index)));
            }
        }
        cycles
    }

    fn find_back_edges(&self) -> HashSet<EdgeIndex> {
        let Some(start) = self.start else {
            return HashSet::new();
        };

        let mut closing = HashSet::new();
        depth_first_search(&self.graph, Some(start), |event| {
            if let DfsEvent::BackEdge(source, target) = event {
                closing.insert((source, target));
            }
        });

        self.graph
            .edge_references()
            .filter(|edge| closing.contains(&(edge.source(), edge.target())))
            .map(|edge| edge.id())
            .collect()
    }

    /// Returns a node by its id.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(node_id)?;
        self.graph.node_weight(*index)
    }

    /// Returns an edge by its id.
    #[must_use]
    pub fn edge(&self, edge_id: &EdgeId) -> Option<&Edge> {
        let index = self.edge_index_map.get(edge_id)?;
        self.graph.edge_weight(*index)
    }

    /// Returns all nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns the start node, if the definition has exactly one.
    #[must_use]
    pub fn start(&self) -> Option<&Node> {
        self.start.and_then(|index| self.graph.node_weight(index))
    }

    /// Returns edges whose endpoints are missing.
    #[must_use]
    pub fn dangling_edges(&self) -> &[DanglingEdge] {
        &self.dangling
    }

    /// Returns the outgoing edges of a node in declaration order.
    #[must_use]
    pub fn outgoing(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.directed(node_id, Direction::Outgoing)
            .into_iter()
            .map(|(_, edge)| edge)
            .collect()
    }

    /// Returns the incoming edges of a node that are not back edges.
    ///
    /// These are the inputs an AND-join waits on.
    #[must_use]
    pub fn join_inputs(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.directed(node_id, Direction::Incoming)
            .into_iter()
            .filter(|(index, _)| !self.back_edges.contains(index))
            .map(|(_, edge)| edge)
            .collect()
    }

    /// Returns true if the edge closes a loop.
    #[must_use]
    pub fn is_back_edge(&self, edge_id: &EdgeId) -> bool {
        self.edge_index_map
            .get(edge_id)
            .is_some_and(|index| self.back_edges.contains(index))
    }

    /// Returns the cycle a node belongs to, if any.
    ///
    /// Nodes share a cycle id exactly when each can reach the other.
    #[must_use]
    pub fn cycle_of(&self, node_id: &NodeId) -> Option<usize> {
        self.node_index_map
            .get(node_id)
            .and_then(|index| self.cycles.get(index))
            .copied()
    }

    fn directed(&self, node_id: &NodeId, direction: Direction) -> Vec<(EdgeIndex, &Edge)> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(index, direction)
            .map(|edge| (edge.id(), edge.weight()))
            .collect();
        edges.sort_by_key(|(index, _)| index.index());
        edges
    }

    /// Returns the ids of every node reachable from start, start included.
    #[must_use]
    pub fn reachable_from_start(&self) -> HashSet<NodeId> {
        let mut reachable = HashSet::new();
        let Some(start) = self.start else {
            return reachable;
        };

        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(index) = bfs.next(&self.graph) {
            if let Some(node) = self.graph.node_weight(index) {
                reachable.insert(node.id.clone());
            }
        }
        reachable
    }

    /// Returns nodes of the given kind.
    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &Node> {
        self.graph.node_weights().filter(move |node| node.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DecisionBranch;

    fn approval() -> WorkflowDefinition {
        WorkflowDefinition::new("Approval")
            .with_node(Node::start("start"))
            .with_node(Node::task("review", "Review", "review-task"))
            .with_node(Node::decision(
                "approved",
                "Approved?",
                vec![
                    DecisionBranch::when("approved", "to-approved"),
                    DecisionBranch::otherwise("to-revise"),
                ],
            ))
            .with_node(Node::task("revise", "Revise", "revise-task"))
            .with_node(Node::end("done", "Approved"))
            .with_edge(Edge::new("e1", "start", "review"))
            .with_edge(Edge::new("e2", "review", "approved"))
            .with_edge(Edge::new("to-approved", "approved", "done"))
            .with_edge(Edge::new("to-revise", "approved", "revise"))
            .with_edge(Edge::new("back", "revise", "review"))
    }

    #[test]
    fn builds_nodes_and_edges() {
        let graph = WorkflowGraph::from_definition(&approval());
        assert_eq!(graph.node_count(), 5);
        assert_eq!(graph.edge_count(), 5);
        assert_eq!(graph.start().map(|n| n.id.as_str()), Some("start"));
        assert!(graph.dangling_edges().is_empty());
    }

    #[test]
    fn outgoing_edges_keep_declaration_order() {
        let graph = WorkflowGraph::from_definition(&approval());
        let ids: Vec<_> = graph
            .outgoing(&NodeId::from("approved"))
            .iter()
            .map(|e| e.id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["to-approved", "to-revise"]);
    }

    #[test]
    fn loop_closing_edge_is_a_back_edge() {
        let graph = WorkflowGraph::from_definition(&approval());
        assert!(graph.is_back_edge(&EdgeId::from("back")));
        assert!(!graph.is_back_edge(&EdgeId::from("e1")));

        let inputs = graph.join_inputs(&NodeId::from("review"));
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].id.as_str(), "e1");
    }

    #[test]
    fn loop_members_are_cyclic() {
        let graph = WorkflowGraph::from_definition(&approval());
        for id in ["review", "approved", "revise"] {
            assert!(graph.cycle_of(&NodeId::from(id)).is_some(), "{id} should be cyclic");
        }
        assert_eq!(graph.cycle_of(&NodeId::from("start")), None);

        let review = graph.cycle_of(&NodeId::from("review"));
        assert!(review.is_some());
        assert_eq!(graph.cycle_of(&NodeId::from("revise")), review);
        assert_eq!(graph.cycle_of(&NodeId::from("done")), None);
    }

    #[test]
    fn dangling_edges_are_reported() {
        let definition = approval().with_edge(Edge::new("ghost", "review", "nowhere"));
        let graph = WorkflowGraph::from_definition(&definition);
        assert_eq!(
            graph.dangling_edges(),
            &[DanglingEdge {
                edge: EdgeId::from("ghost"),
                missing: NodeId::from("nowhere"),
            }]
        );
    }

    #[test]
    fn reachability_excludes_islands() {
        let definition = approval().with_node(Node::task("island", "Island", "t"));
        let graph = WorkflowGraph::from_definition(&definition);
        let reachable = graph.reachable_from_start();
        assert_eq!(reachable.len(), 5);
        assert!(!reachable.contains(&NodeId::from("island")));
    }
}
