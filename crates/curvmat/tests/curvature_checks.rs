//! Curvature operators checked against finite differences of gradients.
//!
//! With `Curvature::Hessian` every operator the backward pass produces must
//! agree with the numerical derivative of the corresponding first-order
//! gradient; the positive-curvature variants must never report negative
//! curvature.

use std::rc::Rc;

use approx::assert_abs_diff_eq;
use hbp_curvmat::derivatives::{one_hot, CrossEntropyLoss, Linear, LossDerivatives, MseLoss, ParamKind};
use hbp_curvmat::matprod::IdentityMatProd;
use hbp_curvmat::network::{Layer, Sequential};
use hbp_curvmat::{
    CmpBackprop, Curvature, CurvatureExtension, CurvatureMatProd, LayerContext, MatProdRef,
    ModuleExtension,
};
use ndarray::{array, Array1, Array2, Array3};

const H: f64 = 1e-5;

fn network() -> Sequential {
    let mut net = Sequential::new(3);
    net.push(Linear::random(3, 4, 11)).unwrap();
    net.push(Layer::Sigmoid).unwrap();
    net.push(Linear::random(4, 3, 12)).unwrap();
    net.push(Layer::Tanh).unwrap();
    net.push(Linear::random(3, 2, 13)).unwrap();
    net
}

fn batch() -> Array2<f64> {
    array![[0.3, -1.2, 0.8], [1.5, 0.2, -0.4], [-0.7, 0.9, 0.1]]
}

fn check_input_hessian(loss: &dyn LossDerivatives, target: &Array2<f64>) {
    let net = network();
    let x = batch();
    let record = net.forward_backward(&x, loss, target).unwrap();
    let ext = CurvatureExtension::new(Curvature::Hessian);
    let curvature = net.curvature_pass(&record, &ext, loss).unwrap();

    let (n, d) = x.dim();
    for b in 0..n {
        for i in 0..d {
            let mut e = Array3::zeros((n, d, 1));
            e[[b, i, 0]] = 1.0;
            let column = curvature.input.mat_prod(&e).unwrap();

            let mut xp = x.clone();
            xp[[b, i]] += H;
            let mut xm = x.clone();
            xm[[b, i]] -= H;
            let gp = net.forward_backward(&xp, loss, target).unwrap().grad_input;
            let gm = net.forward_backward(&xm, loss, target).unwrap().grad_input;
            let fd = (gp - gm) / (2.0 * H);

            for ((bb, j), expected) in fd.indexed_iter() {
                assert_abs_diff_eq!(column[[bb, j, 0]], *expected, epsilon = 1e-6);
            }
        }
    }
}

#[test]
fn input_hessian_matches_finite_differences_mse() {
    let target = array![[0.5, -0.5], [1.0, 0.0], [0.0, 0.25]];
    check_input_hessian(&MseLoss, &target);
}

#[test]
fn input_hessian_matches_finite_differences_cross_entropy() {
    let target = one_hot(&[1, 0, 1], 2).unwrap();
    check_input_hessian(&CrossEntropyLoss, &target);
}

#[test]
fn parameter_blocks_match_finite_differences() {
    let net = network();
    let x = batch();
    let target = one_hot(&[0, 1, 1], 2).unwrap();
    let loss = CrossEntropyLoss;
    let record = net.forward_backward(&x, &loss, &target).unwrap();
    let ext = CurvatureExtension::new(Curvature::Hessian);
    let curvature = net.curvature_pass(&record, &ext, &loss).unwrap();
    assert_eq!(curvature.params.len(), 6);

    for block in &curvature.params {
        let n = block.cmp.dim();
        for j in 0..n {
            let mut e = Array1::zeros(n);
            e[j] = 1.0;
            let column = block.cmp.apply_vec(&e).unwrap();

            let grad_at = |step: f64| -> Array1<f64> {
                let mut shifted = net.clone();
                shifted
                    .linear_mut(block.node)
                    .unwrap()
                    .update_param(block.kind, &e, -step)
                    .unwrap();
                let record = shifted.forward_backward(&x, &loss, &target).unwrap();
                record.gradient(block.node, block.kind).unwrap().clone()
            };
            let fd = (grad_at(H) - grad_at(-H)) / (2.0 * H);

            for (got, expected) in column.iter().zip(fd.iter()) {
                assert_abs_diff_eq!(*got, *expected, epsilon = 1e-6);
            }
        }
    }
}

#[test]
fn positive_curvature_variants_are_psd() {
    let net = network();
    let x = batch();
    let target = array![[2.0, -1.0], [-3.0, 0.5], [1.0, 4.0]];
    let record = net.forward_backward(&x, &MseLoss, &target).unwrap();

    for curv in [Curvature::Ggn, Curvature::PchAbs, Curvature::PchClip] {
        let ext = CurvatureExtension::new(curv);
        let curvature = net.curvature_pass(&record, &ext, &MseLoss).unwrap();

        for seed in 0..5 {
            let v = Array3::from_shape_fn((3, 3, 1), |(b, i, _)| {
                ((seed * 7 + b * 3 + i) as f64 * 1.3).sin()
            });
            let cv = curvature.input.mat_prod(&v).unwrap();
            assert!((&v * &cv).sum() >= -1e-12, "{curv}: input vᵀCv < 0");

            for block in &curvature.params {
                let w = Array1::from_shape_fn(block.cmp.dim(), |j| {
                    ((seed * 5 + j) as f64 * 0.7).cos()
                });
                let cw = block.cmp.apply_vec(&w).unwrap();
                assert!(w.dot(&cw) >= -1e-12, "{curv}: block vᵀCv < 0");
            }
        }
    }
}

#[test]
fn clipping_never_exceeds_absolute_value() {
    // PCH-clip drops what PCH-abs flips, so vᵀC_clip v <= vᵀC_abs v
    let net = network();
    let x = batch();
    let target = array![[2.0, -1.0], [-3.0, 0.5], [1.0, 4.0]];
    let record = net.forward_backward(&x, &MseLoss, &target).unwrap();

    let quad = |curv: Curvature| {
        let ext = CurvatureExtension::new(curv);
        let curvature = net.curvature_pass(&record, &ext, &MseLoss).unwrap();
        let v = Array3::from_shape_fn((3, 3, 1), |(b, i, _)| (b as f64 - i as f64) * 0.5 + 0.1);
        (&v * &curvature.input.mat_prod(&v).unwrap()).sum()
    };
    assert!(quad(Curvature::PchClip) <= quad(Curvature::PchAbs) + 1e-12);
    assert!(quad(Curvature::Ggn) <= quad(Curvature::PchClip) + 1e-12);
}

#[test]
fn linear_layer_scenario() {
    // J = diag(2, 3), zero Hessian, identity output curvature
    let layer = Linear::new(array![[2.0, 0.0], [0.0, 3.0]], array![0.0, 0.0]).unwrap();
    let x = array![[1.0, 1.0]];
    let z = layer.forward(&x);
    let ctx = LayerContext::new(x.clone(), z, Array2::zeros((1, 2)), Array2::zeros((1, 2)));

    for curv in Curvature::ALL {
        let ext = CurvatureExtension::new(curv);
        let cmp_out: MatProdRef = Rc::new(IdentityMatProd);
        let cmp_in = CmpBackprop::new(&layer)
            .backpropagate(&ext, &ctx, cmp_out)
            .unwrap();
        let out = cmp_in.apply(&array![[1.0, 1.0]].into_dyn()).unwrap();
        assert_eq!(out, array![[[4.0], [9.0]]]);
    }
}

#[test]
fn weight_block_dimension_follows_layer() {
    let net = network();
    let record = net
        .forward_backward(&batch(), &MseLoss, &Array2::zeros((3, 2)))
        .unwrap();
    let curvature = net
        .curvature_pass(&record, &CurvatureExtension::default(), &MseLoss)
        .unwrap();
    let dims: Vec<_> = curvature
        .params
        .iter()
        .map(|b| (b.kind, b.cmp.dim()))
        .collect();
    assert_eq!(
        dims,
        vec![
            (ParamKind::Weight, 12),
            (ParamKind::Bias, 4),
            (ParamKind::Weight, 12),
            (ParamKind::Bias, 3),
            (ParamKind::Weight, 6),
            (ParamKind::Bias, 2),
        ]
    );
}
