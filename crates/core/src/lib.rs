//! # Core - Shared Foundations for Hessian Backpropagation
//!
//! This crate provides the pieces every curvature crate builds on:
//!
//! - **Shapes**: batched matrices `(batch, dim, k)` and the rank-promotion
//!   adapter applied at every curvature-operator boundary
//! - **Errors**: shape and wiring failures
//! - **Diagrams**: layer chains on top of petgraph, giving the host
//!   traversal its forward and reverse orders
//! - **Telemetry**: tracing subscriber setup

pub mod diagram;
pub mod error;
pub mod shape;
pub mod telemetry;

// Re-export key types at crate root for convenience
pub use diagram::{Diagram, Edge, Node};
pub use error::CoreError;
pub use shape::{promote_to_batch_mat, MatShape};
