//! Fully connected layer `z = W x + b`.
//!
//! The layer is linear in both its input and its parameters, so its Hessian
//! vanishes and every curvature block it contributes is a pure
//! `Jᵀ · C · J` sandwich.

use hbp_core::MatShape;
use ndarray::{Array1, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{check_mat, Derivatives, LayerContext};
use crate::error::{CurvError, Result};

/// Learnable tensors of a [`Linear`] layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// `(out, in)` matrix, flattened row-major
    Weight,
    /// `(out,)` vector
    Bias,
}

impl ParamKind {
    pub const ALL: [ParamKind; 2] = [ParamKind::Weight, ParamKind::Bias];

    pub fn name(self) -> &'static str {
        match self {
            ParamKind::Weight => "weight",
            ParamKind::Bias => "bias",
        }
    }
}

/// A fully connected layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    /// Weight matrix `(out, in)`
    pub weight: Array2<f64>,
    /// Bias vector `(out,)`
    pub bias: Array1<f64>,
}

impl Linear {
    /// Build from explicit parameters.
    pub fn new(weight: Array2<f64>, bias: Array1<f64>) -> Result<Self> {
        let out = weight.nrows();
        if bias.len() != out {
            return Err(CurvError::ShapeMismatch {
                op: "Linear::new",
                expected: MatShape::new(1, out, 1),
                got: MatShape::new(1, bias.len(), 1),
            });
        }
        Ok(Self { weight, bias })
    }

    /// Xavier-uniform weights and zero bias, reproducible from `seed`.
    pub fn random(in_dim: usize, out_dim: usize, seed: u64) -> Self {
        let bound = (6.0 / (in_dim + out_dim) as f64).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let weight = Array2::from_shape_fn((out_dim, in_dim), |_| rng.gen_range(-bound..bound));
        Self {
            weight,
            bias: Array1::zeros(out_dim),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    /// `x Wᵀ + b` for a batch `x` of shape `(batch, in)`.
    pub fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.weight.t()) + &self.bias
    }

    /// Number of scalars in a parameter tensor.
    pub fn param_dim(&self, kind: ParamKind) -> usize {
        match kind {
            ParamKind::Weight => self.weight.len(),
            ParamKind::Bias => self.bias.len(),
        }
    }

    /// Parameter tensor flattened to a vector.
    pub fn param(&self, kind: ParamKind) -> Array1<f64> {
        match kind {
            ParamKind::Weight => self.weight.iter().copied().collect(),
            ParamKind::Bias => self.bias.clone(),
        }
    }

    /// `θ ← θ - step · direction` on the flattened parameter.
    pub fn update_param(
        &mut self,
        kind: ParamKind,
        direction: &Array1<f64>,
        step: f64,
    ) -> Result<()> {
        let n = self.param_dim(kind);
        if direction.len() != n {
            return Err(CurvError::ShapeMismatch {
                op: "Linear::update_param",
                expected: MatShape::new(1, n, 1),
                got: MatShape::new(1, direction.len(), 1),
            });
        }
        match kind {
            ParamKind::Weight => {
                for (w, d) in self.weight.iter_mut().zip(direction.iter()) {
                    *w -= step * d;
                }
            }
            ParamKind::Bias => self.bias.scaled_add(-step, direction),
        }
        Ok(())
    }

    /// Gradient of the loss w.r.t. a parameter, flattened.
    pub fn param_grad(&self, kind: ParamKind, ctx: &LayerContext) -> Array1<f64> {
        match kind {
            ParamKind::Weight => ctx
                .grad_output
                .t()
                .dot(&ctx.input)
                .iter()
                .copied()
                .collect(),
            ParamKind::Bias => ctx.grad_output.sum_axis(Axis(0)),
        }
    }

    /// `J_θ · mat`: `(n_params, k)` to `(batch, out, k)`.
    pub fn param_jac_mat_prod(
        &self,
        kind: ParamKind,
        ctx: &LayerContext,
        mat: &Array2<f64>,
    ) -> Result<Array3<f64>> {
        let (n, k) = mat.dim();
        let expected = self.param_dim(kind);
        if n != expected {
            return Err(CurvError::ShapeMismatch {
                op: "Linear::param_jac_mat_prod",
                expected: MatShape::new(1, expected, k),
                got: MatShape::new(1, n, k),
            });
        }

        let batch = ctx.batch_size();
        let out = self.out_dim();
        match kind {
            ParamKind::Weight => {
                let v = mat
                    .as_standard_layout()
                    .into_owned()
                    .into_shape((out, self.in_dim(), k))
                    .map_err(|_| CurvError::ShapeMismatch {
                        op: "Linear::param_jac_mat_prod",
                        expected: MatShape::new(out, self.in_dim(), k),
                        got: MatShape::new(1, n, k),
                    })?;
                let mut result = Array3::zeros((batch, out, k));
                for c in 0..k {
                    // dz_b = dW x_b for every example at once
                    result
                        .index_axis_mut(Axis(2), c)
                        .assign(&ctx.input.dot(&v.index_axis(Axis(2), c).t()));
                }
                Ok(result)
            }
            ParamKind::Bias => mat
                .broadcast((batch, out, k))
                .map(|b| b.to_owned())
                .ok_or(CurvError::ShapeMismatch {
                    op: "Linear::param_jac_mat_prod",
                    expected: MatShape::new(batch, out, k),
                    got: MatShape::new(1, n, k),
                }),
        }
    }

    /// `J_θᵀ · mat`: `(batch, out, k)` to `(n_params, k)`, summed over the batch.
    pub fn param_jac_t_mat_prod(
        &self,
        kind: ParamKind,
        ctx: &LayerContext,
        mat: &Array3<f64>,
    ) -> Result<Array2<f64>> {
        let out = self.out_dim();
        check_mat("Linear::param_jac_t_mat_prod", mat, ctx.batch_size(), out)?;
        let k = mat.dim().2;

        match kind {
            ParamKind::Weight => {
                let in_dim = self.in_dim();
                let mut result = Array3::zeros((out, in_dim, k));
                for c in 0..k {
                    result
                        .index_axis_mut(Axis(2), c)
                        .assign(&mat.index_axis(Axis(2), c).t().dot(&ctx.input));
                }
                result
                    .into_shape((out * in_dim, k))
                    .map_err(|_| CurvError::ShapeMismatch {
                        op: "Linear::param_jac_t_mat_prod",
                        expected: MatShape::new(1, out * in_dim, k),
                        got: MatShape::new(out, in_dim, k),
                    })
            }
            ParamKind::Bias => Ok(mat.sum_axis(Axis(0))),
        }
    }
}

impl Derivatives for Linear {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn jac_mat_prod(&self, ctx: &LayerContext, mat: &Array3<f64>) -> Result<Array3<f64>> {
        check_mat("Linear::jac_mat_prod", mat, ctx.batch_size(), self.in_dim())?;
        let (batch, _, k) = mat.dim();
        let mut result = Array3::zeros((batch, self.out_dim(), k));
        for (mut slot, m) in result.outer_iter_mut().zip(mat.outer_iter()) {
            slot.assign(&self.weight.dot(&m));
        }
        Ok(result)
    }

    fn jac_t_mat_prod(&self, ctx: &LayerContext, mat: &Array3<f64>) -> Result<Array3<f64>> {
        check_mat("Linear::jac_t_mat_prod", mat, ctx.batch_size(), self.out_dim())?;
        let (batch, _, k) = mat.dim();
        let mut result = Array3::zeros((batch, self.in_dim(), k));
        for (mut slot, m) in result.outer_iter_mut().zip(mat.outer_iter()) {
            slot.assign(&self.weight.t().dot(&m));
        }
        Ok(result)
    }

    fn hessian_is_zero(&self) -> bool {
        true
    }

    fn hessian_is_diagonal(&self) -> bool {
        true
    }
}
