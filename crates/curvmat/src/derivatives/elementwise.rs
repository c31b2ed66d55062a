//! Elementwise activations `z_i = φ(x_i)`.
//!
//! The Jacobian is `diag(φ'(x))` per example, so `J = Jᵀ`, and the only
//! second-order coupling is between an output and its own input: the
//! Hessian is diagonal with residual `φ''(x_i) · ∂L/∂z_i`.

use ndarray::{Array2, Array3, Axis, Zip};

use super::{check_mat, Derivatives, LayerContext};
use crate::error::Result;

/// Scalar activation with first and second derivatives.
///
/// Derivatives receive both the input `x` and the recorded output `y`, so
/// activations whose derivatives are cheaper in terms of `y` use it.
pub trait Elementwise {
    fn forward(&self, x: f64) -> f64;
    fn df(&self, x: f64, y: f64) -> f64;
    fn d2f(&self, x: f64, y: f64) -> f64;

    /// Apply to a whole batch.
    fn forward_batch(&self, x: &Array2<f64>) -> Array2<f64> {
        x.mapv(|v| self.forward(v))
    }
}

/// Rectified linear unit; piecewise linear, so its Hessian vanishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReLU;

impl Elementwise for ReLU {
    fn forward(&self, x: f64) -> f64 {
        x.max(0.0)
    }

    fn df(&self, x: f64, _y: f64) -> f64 {
        if x > 0.0 {
            1.0
        } else {
            0.0
        }
    }

    fn d2f(&self, _x: f64, _y: f64) -> f64 {
        0.0
    }
}

/// Logistic sigmoid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sigmoid;

impl Elementwise for Sigmoid {
    fn forward(&self, x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    fn df(&self, _x: f64, y: f64) -> f64 {
        y * (1.0 - y)
    }

    fn d2f(&self, _x: f64, y: f64) -> f64 {
        y * (1.0 - y) * (1.0 - 2.0 * y)
    }
}

/// Hyperbolic tangent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tanh;

impl Elementwise for Tanh {
    fn forward(&self, x: f64) -> f64 {
        x.tanh()
    }

    fn df(&self, _x: f64, y: f64) -> f64 {
        1.0 - y * y
    }

    fn d2f(&self, _x: f64, y: f64) -> f64 {
        -2.0 * y * (1.0 - y * y)
    }
}

/// `φ'(x) ⊙ mat`, broadcast over the `k` columns.
fn scale_by_derivative<E: Elementwise>(
    act: &E,
    op: &'static str,
    ctx: &LayerContext,
    mat: &Array3<f64>,
) -> Result<Array3<f64>> {
    check_mat(op, mat, ctx.batch_size(), ctx.in_dim())?;
    let deriv = Zip::from(&ctx.input)
        .and(&ctx.output)
        .map_collect(|&x, &y| act.df(x, y));
    Ok(mat * &deriv.insert_axis(Axis(2)))
}

fn residual_diagonal<E: Elementwise>(act: &E, ctx: &LayerContext) -> Array2<f64> {
    Zip::from(&ctx.input)
        .and(&ctx.output)
        .and(&ctx.grad_output)
        .map_collect(|&x, &y, &g| act.d2f(x, y) * g)
}

macro_rules! elementwise_derivatives {
    ($($layer:ident => hessian_is_zero: $zero:expr),* $(,)?) => {$(
        impl Derivatives for $layer {
            fn name(&self) -> &'static str {
                stringify!($layer)
            }

            fn jac_mat_prod(&self, ctx: &LayerContext, mat: &Array3<f64>) -> Result<Array3<f64>> {
                scale_by_derivative(self, concat!(stringify!($layer), "::jac_mat_prod"), ctx, mat)
            }

            fn jac_t_mat_prod(&self, ctx: &LayerContext, mat: &Array3<f64>) -> Result<Array3<f64>> {
                scale_by_derivative(self, concat!(stringify!($layer), "::jac_t_mat_prod"), ctx, mat)
            }

            fn hessian_is_zero(&self) -> bool {
                $zero
            }

            fn hessian_is_diagonal(&self) -> bool {
                true
            }

            fn hessian_diagonal(&self, ctx: &LayerContext) -> Result<Array2<f64>> {
                Ok(residual_diagonal(self, ctx))
            }
        }
    )*};
}

elementwise_derivatives! {
    ReLU => hessian_is_zero: true,
    Sigmoid => hessian_is_zero: false,
    Tanh => hessian_is_zero: false,
}
