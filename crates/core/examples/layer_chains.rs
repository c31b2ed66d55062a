//! Layer chains and batch matrices
//!
//! Run with: cargo run -p hbp-core --example layer_chains
//!
//! This example demonstrates:
//! - Building a layer chain (width-checked wiring)
//! - Forward order and the reversed order a backward pass walks
//! - Promoting `(batch, dim)` inputs to `(batch, dim, 1)`

use hbp_core::{promote_to_batch_mat, CoreError, Diagram, MatShape, Node};
use ndarray::array;

#[derive(Debug, Clone)]
enum Op {
    Linear,
    Tanh,
}

fn main() {
    println!("=== Layer Chains ===\n");

    // -------------------------------------------------------------------------
    // 1. Wiring
    // -------------------------------------------------------------------------
    println!("1. Wiring");
    println!("---------");

    let mut diagram: Diagram<Op> = Diagram::new();
    diagram.push(Node::new(Op::Linear, 784, 128)).unwrap();
    diagram.push(Node::new(Op::Tanh, 128, 128)).unwrap();
    diagram.push(Node::new(Op::Linear, 128, 10)).unwrap();
    print!("{diagram}");

    match diagram.push(Node::new(Op::Linear, 64, 10)) {
        Err(CoreError::WidthMismatch { expected, got }) => {
            println!("Rejected: layer wants {expected} inputs, chain yields {got}");
        }
        other => println!("Unexpected: {other:?}"),
    }
    println!();

    // -------------------------------------------------------------------------
    // 2. Traversal orders
    // -------------------------------------------------------------------------
    println!("2. Traversal orders");
    println!("-------------------");

    let forward = diagram.topological_order().unwrap();
    let names: Vec<_> = forward
        .iter()
        .map(|&idx| format!("{:?}", diagram.graph[idx].op))
        .collect();
    println!("forward:  {}", names.join(" -> "));
    let backward: Vec<_> = names.iter().rev().cloned().collect();
    println!("backward: {}", backward.join(" -> "));
    println!();

    // -------------------------------------------------------------------------
    // 3. Batch matrices
    // -------------------------------------------------------------------------
    println!("3. Batch matrices");
    println!("-----------------");

    let vectors = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn();
    let mats = promote_to_batch_mat(&vectors).unwrap();
    println!(
        "{:?} -> {}",
        vectors.shape(),
        MatShape::of(&mats.view())
    );
}
