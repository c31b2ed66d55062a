//! # Error Types
//!
//! Failures shared by every crate in the workspace: malformed batch
//! matrices handed to a curvature operator, and layer diagrams that cannot
//! be wired or traversed.

use thiserror::Error;

use crate::shape::MatShape;

/// Core errors for the Hessian backpropagation workspace.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// A mat-vec input was neither `(batch, dim)` nor `(batch, dim, k)`.
    #[error("Invalid rank {rank}: expected (batch, dim) or (batch, dim, k)")]
    InvalidRank { rank: usize },

    /// Two batch matrices that must agree do not.
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: MatShape, got: MatShape },

    /// Output width of one layer does not feed the next.
    #[error("Width mismatch: layer expects {expected} inputs, predecessor yields {got}")]
    WidthMismatch { expected: usize, got: usize },

    /// Referenced a node that is not part of the diagram.
    #[error("Node {index} not found in diagram")]
    InvalidNode { index: usize },

    /// A chain diagram was given a second predecessor or successor.
    #[error("Node {node} already has a {direction}; layer chains cannot branch")]
    Branching {
        node: usize,
        direction: &'static str,
    },

    /// The diagram has a cycle, so there is no traversal order.
    #[error("Diagram contains a cycle through node {node}")]
    Cycle { node: usize },

    /// The global tracing subscriber could not be installed.
    #[error("Failed to initialise tracing: {0}")]
    TracingInit(String),
}
