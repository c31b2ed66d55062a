//! # Diagrams - Layer Chains
//!
//! A network is a diagram: boxes (layers) connected by wires (activations).
//! The host traversal needs exactly two things from it, a forward order and
//! its reverse, and each layer must be visited once per pass.
//!
//! ## Key Concepts
//!
//! - **Node**: a layer with an input width and an output width
//! - **Edge**: a wire carrying `width` features per example
//! - **Diagram**: a directed acyclic chain of nodes with one entry and one exit
//!
//! Branching is rejected at wiring time: curvature operators are threaded
//! from each layer's output to its input, one value per wire.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::fmt;

use crate::error::CoreError;

/// A node in the diagram, parameterized by layer type.
#[derive(Debug, Clone)]
pub struct Node<O> {
    /// The layer this node evaluates
    pub op: O,
    /// Features consumed per example
    pub in_width: usize,
    /// Features produced per example
    pub out_width: usize,
}

impl<O> Node<O> {
    pub fn new(op: O, in_width: usize, out_width: usize) -> Self {
        Self {
            op,
            in_width,
            out_width,
        }
    }
}

/// A wire from one node's output to the next node's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub width: usize,
}

/// A chain of layers stored as a petgraph DAG.
#[derive(Debug, Clone)]
pub struct Diagram<O> {
    /// The underlying graph structure
    pub graph: DiGraph<Node<O>, Edge>,
    /// First node (where network input enters)
    input: Option<NodeIndex>,
    /// Last node (where network output leaves)
    output: Option<NodeIndex>,
}

impl<O> Diagram<O> {
    /// Create a new empty diagram.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            input: None,
            output: None,
        }
    }

    /// Add an unconnected node, returning its index.
    pub fn add_node(&mut self, node: Node<O>) -> NodeIndex {
        self.graph.add_node(node)
    }

    /// Append a node after the current output node.
    pub fn push(&mut self, node: Node<O>) -> Result<NodeIndex, CoreError> {
        if let Some(tail) = self.output {
            let tail_width = self.node(tail)?.out_width;
            if tail_width != node.in_width {
                return Err(CoreError::WidthMismatch {
                    expected: node.in_width,
                    got: tail_width,
                });
            }
        }

        let idx = self.add_node(node);
        match self.output {
            Some(tail) => self.connect(tail, idx)?,
            None => self.input = Some(idx),
        }
        self.output = Some(idx);
        Ok(idx)
    }

    /// Wire `from`'s output into `to`'s input.
    ///
    /// Returns an error if either node is missing, the widths differ, or
    /// either end is already wired.
    pub fn connect(&mut self, from: NodeIndex, to: NodeIndex) -> Result<(), CoreError> {
        let got = self.node(from)?.out_width;
        let expected = self.node(to)?.in_width;
        if got != expected {
            return Err(CoreError::WidthMismatch { expected, got });
        }

        if self
            .graph
            .neighbors_directed(from, Direction::Outgoing)
            .next()
            .is_some()
        {
            return Err(CoreError::Branching {
                node: from.index(),
                direction: "successor",
            });
        }
        if self
            .graph
            .neighbors_directed(to, Direction::Incoming)
            .next()
            .is_some()
        {
            return Err(CoreError::Branching {
                node: to.index(),
                direction: "predecessor",
            });
        }

        self.graph.add_edge(from, to, Edge { width: got });
        Ok(())
    }

    /// Look up a node.
    pub fn node(&self, idx: NodeIndex) -> Result<&Node<O>, CoreError> {
        self.graph
            .node_weight(idx)
            .ok_or(CoreError::InvalidNode { index: idx.index() })
    }

    /// Look up a node mutably.
    pub fn node_mut(&mut self, idx: NodeIndex) -> Result<&mut Node<O>, CoreError> {
        self.graph
            .node_weight_mut(idx)
            .ok_or(CoreError::InvalidNode { index: idx.index() })
    }

    /// Nodes ordered so every node comes after its predecessor.
    pub fn topological_order(&self) -> Result<Vec<NodeIndex>, CoreError> {
        toposort(&self.graph, None).map_err(|cycle| CoreError::Cycle {
            node: cycle.node_id().index(),
        })
    }

    /// The entry node, if any layer was pushed.
    pub fn input(&self) -> Option<NodeIndex> {
        self.input
    }

    /// The exit node, if any layer was pushed.
    pub fn output(&self) -> Option<NodeIndex> {
        self.output
    }

    /// Number of nodes in the diagram.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges in the diagram.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl<O> Default for Diagram<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: fmt::Debug> fmt::Display for Diagram<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Diagram({} nodes, {} edges)",
            self.node_count(),
            self.edge_count()
        )?;
        if let Ok(order) = self.topological_order() {
            for idx in order {
                let node = &self.graph[idx];
                writeln!(
                    f,
                    "  [{}] {:?}: {} -> {}",
                    idx.index(),
                    node.op,
                    node.in_width,
                    node.out_width
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum TestOp {
        Dense,
        Act,
    }

    #[test]
    fn test_create_diagram() {
        let diagram: Diagram<TestOp> = Diagram::new();
        assert_eq!(diagram.node_count(), 0);
        assert_eq!(diagram.edge_count(), 0);
        assert!(diagram.input().is_none());
    }

    #[test]
    fn test_push_chains_nodes() {
        let mut diagram = Diagram::new();
        let a = diagram.push(Node::new(TestOp::Dense, 4, 3)).unwrap();
        let b = diagram.push(Node::new(TestOp::Act, 3, 3)).unwrap();

        assert_eq!(diagram.edge_count(), 1);
        assert_eq!(diagram.input(), Some(a));
        assert_eq!(diagram.output(), Some(b));
        assert_eq!(diagram.topological_order().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_push_width_mismatch() {
        let mut diagram = Diagram::new();
        diagram.push(Node::new(TestOp::Dense, 4, 3)).unwrap();
        let result = diagram.push(Node::new(TestOp::Act, 5, 5));
        assert_eq!(
            result,
            Err(CoreError::WidthMismatch {
                expected: 5,
                got: 3
            })
        );
        assert_eq!(diagram.node_count(), 1);
    }

    #[test]
    fn test_connect_rejects_branching() {
        let mut diagram = Diagram::new();
        let a = diagram.add_node(Node::new(TestOp::Dense, 2, 2));
        let b = diagram.add_node(Node::new(TestOp::Act, 2, 2));
        let c = diagram.add_node(Node::new(TestOp::Act, 2, 2));

        diagram.connect(a, b).unwrap();
        assert!(matches!(
            diagram.connect(a, c),
            Err(CoreError::Branching {
                direction: "successor",
                ..
            })
        ));
        assert!(matches!(
            diagram.connect(c, b),
            Err(CoreError::Branching {
                direction: "predecessor",
                ..
            })
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let mut diagram = Diagram::new();
        let a = diagram.add_node(Node::new(TestOp::Act, 2, 2));
        let b = diagram.add_node(Node::new(TestOp::Act, 2, 2));
        diagram.connect(a, b).unwrap();
        diagram.connect(b, a).unwrap();

        assert!(matches!(
            diagram.topological_order(),
            Err(CoreError::Cycle { .. })
        ));
    }

    #[test]
    fn test_missing_node() {
        let diagram: Diagram<TestOp> = Diagram::new();
        assert!(matches!(
            diagram.node(NodeIndex::new(3)),
            Err(CoreError::InvalidNode { index: 3 })
        ));
    }
}
