//! CG-Newton with GGN and positive-curvature Hessians
//!
//! Run with: cargo run -p hbp-curvmat --example curvature_training
//!
//! This example demonstrates:
//! - Curvature operators built layer by layer during backward
//! - How the curvature type changes what the operator reports
//! - CG-Newton training on a toy classification problem
//!
//! Set `HBP_LOG=debug` to see every operator being built.

use hbp_core::telemetry::init_tracing;
use hbp_curvmat::derivatives::{one_hot, CrossEntropyLoss, Linear};
use hbp_curvmat::network::{Layer, Sequential};
use hbp_curvmat::{CgNewton, CgNewtonConfig, Curvature, CurvatureExtension, CurvatureMatProd};
use ndarray::{array, Array3};

fn network() -> Sequential {
    let mut net = Sequential::new(2);
    net.push(Linear::random(2, 8, 1)).unwrap();
    net.push(Layer::Tanh).unwrap();
    net.push(Linear::random(8, 3, 2)).unwrap();
    net
}

fn main() {
    if let Err(e) = init_tracing() {
        eprintln!("tracing disabled: {e}");
    }

    println!("=== Curvature Backpropagation ===\n");

    let x = array![
        [1.0, 0.1],
        [0.8, -0.2],
        [0.0, 1.0],
        [0.2, 0.9],
        [-1.0, -0.8],
        [-0.7, -1.1]
    ];
    let t = one_hot(&[0, 0, 1, 1, 2, 2], 3).unwrap();

    // -------------------------------------------------------------------------
    // 1. One backward pass, four curvature types
    // -------------------------------------------------------------------------
    println!("1. Quadratic form vᵀCv w.r.t. the input");
    println!("---------------------------------------");

    let net = network();
    let record = net.forward_backward(&x, &CrossEntropyLoss, &t).unwrap();
    let v = Array3::from_elem((6, 2, 1), 1.0);
    for curv in Curvature::ALL {
        let ext = CurvatureExtension::new(curv);
        let curvature = net.curvature_pass(&record, &ext, &CrossEntropyLoss).unwrap();
        let cv = curvature.input.mat_prod(&v).unwrap();
        println!("  {:<9} {:+.6}", curv.as_str(), (&v * &cv).sum());
    }
    println!();

    // -------------------------------------------------------------------------
    // 2. Training
    // -------------------------------------------------------------------------
    println!("2. CG-Newton training");
    println!("---------------------");

    let config = CgNewtonConfig {
        lr: 0.5,
        alpha: 0.1,
        ..CgNewtonConfig::default()
    };
    for curv in [Curvature::Ggn, Curvature::PchAbs, Curvature::PchClip] {
        let optimizer = CgNewton::new(curv, &config).unwrap();
        let mut net = network();
        let mut last = 0.0;
        for step in 0..20 {
            let report = optimizer.step(&mut net, &CrossEntropyLoss, &x, &t).unwrap();
            if step == 0 {
                print!("  {:<9} {:.4}", curv.as_str(), report.loss);
            }
            last = report.loss;
        }
        println!(" -> {last:.4}");
    }
}
