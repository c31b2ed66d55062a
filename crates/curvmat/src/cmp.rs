//! # Curvature Matrix-Product Backpropagation
//!
//! Given the curvature operator at a layer's output, build the one at its
//! input:
//!
//! ```text
//! CMP_in(M) = Jᵀ · CMP_out(J · M) + R ⊙ M
//! ```
//!
//! where `J` is the layer Jacobian at the recorded context and `R` the
//! layer's diagonal residual after the curvature policy modified it. The
//! residual is left out when the layer's Hessian vanishes or the curvature
//! type drops it (GGN).
//!
//! Operators are built once per layer per pass and are pure afterwards.
//!
//! ## Example
//!
//! ```rust
//! use std::rc::Rc;
//! use hbp_curvmat::cmp::CmpBackprop;
//! use hbp_curvmat::derivatives::{Elementwise, LayerContext, Sigmoid};
//! use hbp_curvmat::extension::{CurvatureExtension, ModuleExtension};
//! use hbp_curvmat::matprod::{CurvatureMatProd, IdentityMatProd, MatProdRef};
//! use hbp_curvmat::Curvature;
//! use ndarray::array;
//!
//! let x = array![[0.5, -1.0]];
//! let y = Sigmoid.forward_batch(&x);
//! let g = array![[1.0, 1.0]];
//! let ctx = LayerContext::new(x, y, g.clone(), g);
//!
//! let ext = CurvatureExtension::new(Curvature::PchClip);
//! let cmp_out: MatProdRef = Rc::new(IdentityMatProd);
//! let cmp_in = CmpBackprop::new(&Sigmoid).backpropagate(&ext, &ctx, cmp_out).unwrap();
//!
//! let out = cmp_in.apply(&array![[1.0, 1.0]].into_dyn()).unwrap();
//! assert_eq!(out.dim(), (1, 2, 1));
//! ```

use std::rc::Rc;

use ndarray::{Array1, Array2, Array3, Axis};
use tracing::debug;

use crate::derivatives::{check_mat, Derivatives, LayerContext, Linear, LossDerivatives, ParamKind};
use crate::error::{CurvError, Result};
use crate::extension::{CurvatureExtension, ModuleExtension};
use crate::matprod::{CurvatureMatProd, MatProdRef};

/// `Jᵀ · CMP_out(J · M)`.
pub struct GgnMatProd<'a> {
    derivatives: &'a dyn Derivatives,
    ctx: &'a LayerContext,
    cmp_out: MatProdRef<'a>,
}

impl<'a> GgnMatProd<'a> {
    pub fn new(
        derivatives: &'a dyn Derivatives,
        ctx: &'a LayerContext,
        cmp_out: MatProdRef<'a>,
    ) -> Self {
        Self {
            derivatives,
            ctx,
            cmp_out,
        }
    }
}

impl CurvatureMatProd for GgnMatProd<'_> {
    fn mat_prod(&self, mat: &Array3<f64>) -> Result<Array3<f64>> {
        let jmat = self.derivatives.jac_mat_prod(self.ctx, mat)?;
        let curved = self.cmp_out.mat_prod(&jmat)?;
        self.derivatives.jac_t_mat_prod(self.ctx, &curved)
    }
}

/// `out[b, i, c] = R[b, i] · M[b, i, c]`.
#[derive(Debug, Clone)]
pub struct DiagonalResidual {
    residual: Array2<f64>,
}

impl DiagonalResidual {
    pub fn new(residual: Array2<f64>) -> Self {
        Self { residual }
    }

    /// The (already modified) residual, `(batch, dim)`.
    pub fn residual(&self) -> &Array2<f64> {
        &self.residual
    }
}

impl CurvatureMatProd for DiagonalResidual {
    fn mat_prod(&self, mat: &Array3<f64>) -> Result<Array3<f64>> {
        let (batch, dim) = self.residual.dim();
        check_mat("DiagonalResidual", mat, batch, dim)?;
        Ok(mat * &self.residual.view().insert_axis(Axis(2)))
    }
}

/// Curvature operator w.r.t. a layer's input.
pub struct CmpIn<'a> {
    ggn: GgnMatProd<'a>,
    residual: Option<DiagonalResidual>,
}

impl CmpIn<'_> {
    /// Whether a residual term is added to the GGN term.
    pub fn includes_residual(&self) -> bool {
        self.residual.is_some()
    }
}

impl CurvatureMatProd for CmpIn<'_> {
    fn mat_prod(&self, mat: &Array3<f64>) -> Result<Array3<f64>> {
        let mut out = self.ggn.mat_prod(mat)?;
        if let Some(residual) = &self.residual {
            out += &residual.mat_prod(mat)?;
        }
        Ok(out)
    }
}

/// Backpropagates curvature operators through one layer.
#[derive(Clone, Copy)]
pub struct CmpBackprop<'d> {
    derivatives: &'d dyn Derivatives,
}

impl<'d> CmpBackprop<'d> {
    pub fn new(derivatives: &'d dyn Derivatives) -> Self {
        Self { derivatives }
    }

    /// Does the layer contribute a residual under this extension?
    pub fn residual_required(&self, ext: &CurvatureExtension) -> bool {
        !(self.derivatives.hessian_is_zero() || !ext.curv_type().requires_residual())
    }

    /// Build the input operator of the layer.
    ///
    /// Fails with [`CurvError::NotImplemented`] when a residual is required
    /// and the layer Hessian is not diagonal.
    pub fn build<'a>(
        &self,
        ext: &CurvatureExtension,
        ctx: &'a LayerContext,
        cmp_out: MatProdRef<'a>,
    ) -> Result<CmpIn<'a>>
    where
        'd: 'a,
    {
        let curv_type = ext.curv_type();
        let required = self.residual_required(ext);
        let residual = if !required {
            None
        } else if self.derivatives.hessian_is_diagonal() {
            let raw = self.derivatives.hessian_diagonal(ctx)?;
            Some(DiagonalResidual::new(curv_type.modify_residual(raw)))
        } else {
            return Err(CurvError::NotImplemented {
                layer: self.derivatives.name().to_string(),
                reason: format!(
                    "curvature {curv_type} requires a residual, but the layer Hessian is not diagonal"
                ),
            });
        };

        debug!(
            layer = self.derivatives.name(),
            curvature = %curv_type,
            residual = required,
            "built input curvature operator"
        );

        Ok(CmpIn {
            ggn: GgnMatProd::new(self.derivatives, ctx, cmp_out),
            residual,
        })
    }
}

impl<'a, 'd: 'a> ModuleExtension<'a> for CmpBackprop<'d> {
    type Backproped = MatProdRef<'a>;

    fn backpropagate(
        &self,
        ext: &CurvatureExtension,
        ctx: &'a LayerContext,
        backproped: MatProdRef<'a>,
    ) -> Result<MatProdRef<'a>> {
        Ok(Rc::new(self.build(ext, ctx, backproped)?))
    }
}

/// Curvature block of one parameter of a linear layer, on `(n_params, k)`.
///
/// `J_θᵀ · CMP_out(J_θ · V)`. The layer is linear in θ, so with the exact
/// output curvature this is the exact diagonal block of the Hessian.
pub struct ParamCmp<'a> {
    layer: &'a Linear,
    kind: ParamKind,
    ctx: &'a LayerContext,
    cmp_out: MatProdRef<'a>,
}

impl<'a> ParamCmp<'a> {
    pub fn new(
        layer: &'a Linear,
        kind: ParamKind,
        ctx: &'a LayerContext,
        cmp_out: MatProdRef<'a>,
    ) -> Self {
        Self {
            layer,
            kind,
            ctx,
            cmp_out,
        }
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    /// Number of parameters in the block.
    pub fn dim(&self) -> usize {
        self.layer.param_dim(self.kind)
    }

    /// Multiply a `(n_params, k)` matrix.
    pub fn apply(&self, mat: &Array2<f64>) -> Result<Array2<f64>> {
        let jmat = self.layer.param_jac_mat_prod(self.kind, self.ctx, mat)?;
        let curved = self.cmp_out.mat_prod(&jmat)?;
        self.layer.param_jac_t_mat_prod(self.kind, self.ctx, &curved)
    }

    /// Multiply a single parameter-space vector.
    pub fn apply_vec(&self, v: &Array1<f64>) -> Result<Array1<f64>> {
        let out = self.apply(&v.view().insert_axis(Axis(1)).to_owned())?;
        Ok(out.index_axis(Axis(1), 0).to_owned())
    }
}

/// Seeds a curvature pass with the loss Hessian.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossCmp;

impl LossCmp {
    /// Hessian operator of `loss` w.r.t. the network output.
    ///
    /// Fails when the curvature type needs a PSD loss Hessian and the loss
    /// does not have one.
    pub fn backpropagate(
        &self,
        ext: &CurvatureExtension,
        loss: &dyn LossDerivatives,
        input: &Array2<f64>,
        target: &Array2<f64>,
    ) -> Result<MatProdRef<'static>> {
        ext.curv_type()
            .check_loss_hessian(loss.name(), loss.hessian_is_psd())?;
        debug!(loss = loss.name(), curvature = %ext.curv_type(), "seeded curvature pass");
        loss.hessian_mat_prod(input, target)
    }
}
