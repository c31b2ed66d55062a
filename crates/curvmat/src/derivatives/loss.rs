//! Loss functions: where the backward curvature pass starts.
//!
//! A loss supplies its value and gradient for the first-order pass, the
//! Hessian w.r.t. its input (the network output) as an operator that seeds
//! the curvature pass, and a per-example factorization `S Sᵀ = H` whose
//! columns can be transported backward with transpose-Jacobians.

use std::rc::Rc;

use hbp_core::MatShape;
use ndarray::{Array2, Array3, Axis};

use super::check_mat;
use crate::error::{CurvError, Result};
use crate::matprod::{CurvatureMatProd, MatProdRef};

/// Derivatives of a loss `L(z, t)` of network outputs `z` and targets `t`.
pub trait LossDerivatives {
    fn name(&self) -> &'static str;

    /// Scalar loss value.
    fn value(&self, input: &Array2<f64>, target: &Array2<f64>) -> Result<f64>;

    /// `∂L/∂z`, `(batch, dim)`.
    fn grad(&self, input: &Array2<f64>, target: &Array2<f64>) -> Result<Array2<f64>>;

    /// Is `∂²L/∂z²` positive semi-definite?
    fn hessian_is_psd(&self) -> bool;

    /// Operator multiplying by `∂²L/∂z²`.
    fn hessian_mat_prod(
        &self,
        input: &Array2<f64>,
        target: &Array2<f64>,
    ) -> Result<MatProdRef<'static>>;

    /// Factor `S` of shape `(batch, dim, dim)` with `S_b S_bᵀ = H_b`.
    fn sqrt_hessian(&self, input: &Array2<f64>, target: &Array2<f64>) -> Result<Array3<f64>>;
}

fn check_target(op: &'static str, input: &Array2<f64>, target: &Array2<f64>) -> Result<()> {
    if input.dim() != target.dim() {
        let (b, d) = input.dim();
        let (tb, td) = target.dim();
        return Err(CurvError::ShapeMismatch {
            op,
            expected: MatShape::new(b, d, 1),
            got: MatShape::new(tb, td, 1),
        });
    }
    Ok(())
}

/// One-hot encode class labels into `(labels.len(), classes)`.
pub fn one_hot(labels: &[usize], classes: usize) -> Result<Array2<f64>> {
    let mut encoded = Array2::zeros((labels.len(), classes));
    for (row, &label) in labels.iter().enumerate() {
        if label >= classes {
            return Err(CurvError::InvalidLabel { label, classes });
        }
        encoded[[row, label]] = 1.0;
    }
    Ok(encoded)
}

/// Mean squared error averaged over all `batch · dim` entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl MseLoss {
    fn factor(input: &Array2<f64>) -> f64 {
        2.0 / input.len() as f64
    }
}

impl LossDerivatives for MseLoss {
    fn name(&self) -> &'static str {
        "MseLoss"
    }

    fn value(&self, input: &Array2<f64>, target: &Array2<f64>) -> Result<f64> {
        check_target("MseLoss::value", input, target)?;
        let diff = input - target;
        Ok(diff.mapv(|d| d * d).sum() / input.len() as f64)
    }

    fn grad(&self, input: &Array2<f64>, target: &Array2<f64>) -> Result<Array2<f64>> {
        check_target("MseLoss::grad", input, target)?;
        Ok((input - target) * Self::factor(input))
    }

    fn hessian_is_psd(&self) -> bool {
        true
    }

    fn hessian_mat_prod(
        &self,
        input: &Array2<f64>,
        target: &Array2<f64>,
    ) -> Result<MatProdRef<'static>> {
        check_target("MseLoss::hessian_mat_prod", input, target)?;
        let (batch, dim) = input.dim();
        Ok(Rc::new(ScaledIdentity {
            batch,
            dim,
            factor: Self::factor(input),
        }))
    }

    fn sqrt_hessian(&self, input: &Array2<f64>, target: &Array2<f64>) -> Result<Array3<f64>> {
        check_target("MseLoss::sqrt_hessian", input, target)?;
        let (batch, dim) = input.dim();
        let scale = Self::factor(input).sqrt();
        Ok(Array3::from_shape_fn((batch, dim, dim), |(_, i, c)| {
            if i == c {
                scale
            } else {
                0.0
            }
        }))
    }
}

/// Softmax cross-entropy averaged over the batch; targets are class
/// probabilities (usually one-hot rows).
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Row-wise softmax, shifted by the row maximum.
    pub fn softmax(input: &Array2<f64>) -> Array2<f64> {
        let mut probs = input.to_owned();
        for mut row in probs.outer_iter_mut() {
            let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let total = row.sum();
            row.mapv_inplace(|v| v / total);
        }
        probs
    }
}

impl LossDerivatives for CrossEntropyLoss {
    fn name(&self) -> &'static str {
        "CrossEntropyLoss"
    }

    fn value(&self, input: &Array2<f64>, target: &Array2<f64>) -> Result<f64> {
        check_target("CrossEntropyLoss::value", input, target)?;
        let mut total = 0.0;
        for (z, t) in input.outer_iter().zip(target.outer_iter()) {
            let max = z.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            let log_norm = z.mapv(|v| (v - max).exp()).sum().ln() + max;
            total -= z
                .iter()
                .zip(t.iter())
                .map(|(zv, tv)| tv * (zv - log_norm))
                .sum::<f64>();
        }
        Ok(total / input.nrows() as f64)
    }

    fn grad(&self, input: &Array2<f64>, target: &Array2<f64>) -> Result<Array2<f64>> {
        check_target("CrossEntropyLoss::grad", input, target)?;
        Ok((Self::softmax(input) - target) / input.nrows() as f64)
    }

    fn hessian_is_psd(&self) -> bool {
        true
    }

    fn hessian_mat_prod(
        &self,
        input: &Array2<f64>,
        target: &Array2<f64>,
    ) -> Result<MatProdRef<'static>> {
        check_target("CrossEntropyLoss::hessian_mat_prod", input, target)?;
        Ok(Rc::new(SoftmaxHessian {
            probs: Self::softmax(input),
            scale: 1.0 / input.nrows() as f64,
        }))
    }

    fn sqrt_hessian(&self, input: &Array2<f64>, target: &Array2<f64>) -> Result<Array3<f64>> {
        check_target("CrossEntropyLoss::sqrt_hessian", input, target)?;
        let probs = Self::softmax(input);
        let (batch, dim) = probs.dim();
        let scale = (1.0 / batch as f64).sqrt();
        // column c: √p_c (e_c - p)
        Ok(Array3::from_shape_fn((batch, dim, dim), |(b, i, c)| {
            let indicator = if i == c { 1.0 } else { 0.0 };
            scale * probs[[b, c]].sqrt() * (indicator - probs[[b, i]])
        }))
    }
}

/// `factor · I` on `(batch, dim, k)`.
struct ScaledIdentity {
    batch: usize,
    dim: usize,
    factor: f64,
}

impl CurvatureMatProd for ScaledIdentity {
    fn mat_prod(&self, mat: &Array3<f64>) -> Result<Array3<f64>> {
        check_mat("MseLoss hessian", mat, self.batch, self.dim)?;
        Ok(mat * self.factor)
    }
}

/// `scale · (diag(p) - p pᵀ)` per example.
struct SoftmaxHessian {
    probs: Array2<f64>,
    scale: f64,
}

impl CurvatureMatProd for SoftmaxHessian {
    fn mat_prod(&self, mat: &Array3<f64>) -> Result<Array3<f64>> {
        let (batch, dim) = self.probs.dim();
        check_mat("CrossEntropyLoss hessian", mat, batch, dim)?;
        let p = self.probs.view().insert_axis(Axis(2));
        let pv = &p * mat;
        let p_dot_v = pv.sum_axis(Axis(1)).insert_axis(Axis(1));
        Ok((pv - &p * &p_dot_v) * self.scale)
    }
}
