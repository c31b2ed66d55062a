//! # Layer Derivatives
//!
//! The capability every layer supplies to the curvature backpropagation:
//! Jacobian and transpose-Jacobian products on batched matrices, and what
//! is known about the layer's own second derivative.
//!
//! All routines are evaluated at a [`LayerContext`], the forward input and
//! output and the backward gradients recorded for the layer during the
//! current pass.
//!
//! ## Conventions
//!
//! - activations are `(batch, dim)`
//! - matrices to multiply are `(batch, dim, k)`
//! - a Jacobian product maps `(batch, in, k)` to `(batch, out, k)`; the
//!   transpose goes the other way

mod elementwise;
mod linear;
mod loss;

pub use elementwise::{Elementwise, ReLU, Sigmoid, Tanh};
pub use linear::{Linear, ParamKind};
pub use loss::{one_hot, CrossEntropyLoss, LossDerivatives, MseLoss};

use hbp_core::{CoreError, MatShape};
use ndarray::{Array2, Array3};

use crate::error::{CurvError, Result};

/// Everything recorded about one layer during forward and backward.
#[derive(Debug, Clone)]
pub struct LayerContext {
    /// Layer input, `(batch, in)`
    pub input: Array2<f64>,
    /// Layer output, `(batch, out)`
    pub output: Array2<f64>,
    /// Loss gradient w.r.t. the input, `(batch, in)`
    pub grad_input: Array2<f64>,
    /// Loss gradient w.r.t. the output, `(batch, out)`
    pub grad_output: Array2<f64>,
}

impl LayerContext {
    pub fn new(
        input: Array2<f64>,
        output: Array2<f64>,
        grad_input: Array2<f64>,
        grad_output: Array2<f64>,
    ) -> Self {
        Self {
            input,
            output,
            grad_input,
            grad_output,
        }
    }

    /// Number of examples in the batch.
    pub fn batch_size(&self) -> usize {
        self.input.nrows()
    }

    pub fn in_dim(&self) -> usize {
        self.input.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.output.ncols()
    }
}

/// Derivative routines of a single layer.
pub trait Derivatives {
    /// Layer type, used to identify the layer in errors and logs.
    fn name(&self) -> &'static str;

    /// `J · mat`: `(batch, in, k)` to `(batch, out, k)`.
    fn jac_mat_prod(&self, ctx: &LayerContext, mat: &Array3<f64>) -> Result<Array3<f64>>;

    /// `Jᵀ · mat`: `(batch, out, k)` to `(batch, in, k)`.
    fn jac_t_mat_prod(&self, ctx: &LayerContext, mat: &Array3<f64>) -> Result<Array3<f64>>;

    /// Is the layer's second derivative identically zero?
    fn hessian_is_zero(&self) -> bool;

    /// Does each output depend on its own input only (elementwise layer)?
    fn hessian_is_diagonal(&self) -> bool;

    /// Residual `Σ_k ∂²z_k/∂x_i² · ∂L/∂z_k`, `(batch, in)`.
    fn hessian_diagonal(&self, _ctx: &LayerContext) -> Result<Array2<f64>> {
        Err(CurvError::NotImplemented {
            layer: self.name().to_string(),
            reason: "no diagonal Hessian available".to_string(),
        })
    }
}

/// Fail unless `mat` is `(batch, dim, _)`.
pub(crate) fn check_mat(
    op: &'static str,
    mat: &Array3<f64>,
    batch: usize,
    dim: usize,
) -> Result<()> {
    let got = MatShape::of(&mat.view());
    MatShape::new(batch, dim, got.cols)
        .expect(got)
        .map_err(|err| match err {
            CoreError::ShapeMismatch { expected, got } => {
                CurvError::ShapeMismatch { op, expected, got }
            }
            other => other.into(),
        })
}
