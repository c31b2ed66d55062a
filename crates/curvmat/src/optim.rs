//! # Optimization - CG-Newton
//!
//! Second-order training on top of the curvature pass: for every parameter
//! block `θ` the damped Newton system
//!
//! ```text
//! (C_θ + α I) d = ∇θ L
//! ```
//!
//! is solved matrix-free by conjugate gradients, using only products with
//! the block's curvature operator, and the parameters move by `θ ← θ - lr·d`.
//!
//! ## Example
//!
//! ```rust
//! use hbp_curvmat::config::HbpConfig;
//! use hbp_curvmat::derivatives::{Linear, MseLoss};
//! use hbp_curvmat::network::Sequential;
//! use hbp_curvmat::optim::CgNewton;
//! use ndarray::array;
//!
//! let mut net = Sequential::new(2);
//! net.push(Linear::random(2, 1, 3)).unwrap();
//!
//! let x = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
//! let t = array![[1.0], [-1.0], [0.0]];
//!
//! let config = HbpConfig::from_json_str(r#"{"cg_newton": {"lr": 0.5}}"#).unwrap();
//! let optimizer = CgNewton::from_config(&config).unwrap();
//! let first = optimizer.step(&mut net, &MseLoss, &x, &t).unwrap();
//! let second = optimizer.step(&mut net, &MseLoss, &x, &t).unwrap();
//! assert!(second.loss < first.loss);
//! ```

use hbp_core::{CoreError, MatShape};
use ndarray::{Array1, Array2};
use petgraph::graph::NodeIndex;
use tracing::{info, warn};

use crate::config::{CgNewtonConfig, HbpConfig};
use crate::curvature::Curvature;
use crate::derivatives::{LossDerivatives, ParamKind};
use crate::error::{CurvError, Result};
use crate::extension::CurvatureExtension;
use crate::network::Sequential;

/// Stopping rule of [`conjugate_gradient`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgOptions {
    pub max_iter: usize,
    /// Stop once `‖r‖ <= tol · ‖b‖`.
    pub tol: f64,
    /// Stop once `‖r‖ <= atol`.
    pub atol: f64,
}

impl Default for CgOptions {
    fn default() -> Self {
        Self {
            max_iter: 50,
            tol: 0.1,
            atol: 0.0,
        }
    }
}

impl From<&CgNewtonConfig> for CgOptions {
    fn from(config: &CgNewtonConfig) -> Self {
        Self {
            max_iter: config.cg_maxiter,
            tol: config.cg_tol,
            atol: config.cg_atol,
        }
    }
}

/// Outcome of a CG solve.
#[derive(Debug, Clone)]
pub struct CgResult {
    pub solution: Array1<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
    pub converged: bool,
}

/// Matrix-free conjugate gradients for `A x = b`.
///
/// `op` multiplies by `A`. Stops early, unconverged, when a search
/// direction has non-positive curvature `pᵀAp <= 0`.
///
/// ```text
/// x = x0, r = b - A x, p = r
/// loop:
///     α = rᵀr / pᵀAp
///     x += α p
///     r -= α A p
///     β = r'ᵀr' / rᵀr
///     p = r' + β p
/// ```
pub fn conjugate_gradient<F>(
    mut op: F,
    b: &Array1<f64>,
    x0: Option<&Array1<f64>>,
    options: CgOptions,
) -> Result<CgResult>
where
    F: FnMut(&Array1<f64>) -> Result<Array1<f64>>,
{
    let n = b.len();
    let mut apply = |v: &Array1<f64>| -> Result<Array1<f64>> {
        let av = op(v)?;
        if av.len() != n {
            return Err(CurvError::ShapeMismatch {
                op: "conjugate_gradient",
                expected: MatShape::new(1, n, 1),
                got: MatShape::new(1, av.len(), 1),
            });
        }
        Ok(av)
    };

    let (mut x, mut r) = match x0 {
        Some(x0) => (x0.clone(), b - &apply(x0)?),
        None => (Array1::zeros(n), b.clone()),
    };

    let threshold = (options.tol * b.dot(b).sqrt()).max(options.atol);
    let mut rs = r.dot(&r);
    if rs.sqrt() <= threshold {
        return Ok(CgResult {
            solution: x,
            iterations: 0,
            residual_norm: rs.sqrt(),
            converged: true,
        });
    }

    let mut p = r.clone();
    for iter in 0..options.max_iter {
        let ap = apply(&p)?;
        let p_ap = p.dot(&ap);
        if p_ap <= 0.0 {
            warn!(iteration = iter, curvature = p_ap, "CG hit non-positive curvature");
            return Ok(CgResult {
                solution: x,
                iterations: iter,
                residual_norm: rs.sqrt(),
                converged: false,
            });
        }

        let alpha = rs / p_ap;
        x.scaled_add(alpha, &p);
        r.scaled_add(-alpha, &ap);

        let rs_new = r.dot(&r);
        if rs_new.sqrt() <= threshold {
            return Ok(CgResult {
                solution: x,
                iterations: iter + 1,
                residual_norm: rs_new.sqrt(),
                converged: true,
            });
        }

        let beta = rs_new / rs;
        p = &r + &(p * beta);
        rs = rs_new;
    }

    warn!(
        max_iter = options.max_iter,
        residual = rs.sqrt(),
        "CG did not converge"
    );
    Ok(CgResult {
        solution: x,
        iterations: options.max_iter,
        residual_norm: rs.sqrt(),
        converged: false,
    })
}

/// CG statistics of one parameter block.
#[derive(Debug, Clone)]
pub struct BlockReport {
    pub node: NodeIndex,
    pub kind: ParamKind,
    pub iterations: usize,
    pub residual_norm: f64,
    pub converged: bool,
}

/// Summary of one [`CgNewton::step`].
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Loss before the update
    pub loss: f64,
    pub blocks: Vec<BlockReport>,
}

/// Block-diagonal damped Newton optimizer.
#[derive(Debug, Clone)]
pub struct CgNewton {
    ext: CurvatureExtension,
    lr: f64,
    alpha: f64,
    cg: CgOptions,
}

impl CgNewton {
    pub fn new(curvature: Curvature, config: &CgNewtonConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ext: CurvatureExtension::new(curvature),
            lr: config.lr,
            alpha: config.alpha,
            cg: CgOptions::from(config),
        })
    }

    pub fn from_config(config: &HbpConfig) -> Result<Self> {
        Self::new(config.curvature, &config.cg_newton)
    }

    pub fn curvature(&self) -> Curvature {
        self.ext.curv_type()
    }

    /// One update of every linear layer of `net` on the batch `(x, target)`.
    pub fn step(
        &self,
        net: &mut Sequential,
        loss: &dyn LossDerivatives,
        x: &Array2<f64>,
        target: &Array2<f64>,
    ) -> Result<StepReport> {
        let record = net.forward_backward(x, loss, target)?;

        let mut blocks = Vec::new();
        let mut updates = Vec::new();
        {
            let curvature = net.curvature_pass(&record, &self.ext, loss)?;
            for block in &curvature.params {
                let grad = record.gradient(block.node, block.kind).ok_or(CoreError::InvalidNode {
                    index: block.node.index(),
                })?;
                let damped = |v: &Array1<f64>| -> Result<Array1<f64>> {
                    let mut cv = block.cmp.apply_vec(v)?;
                    cv.scaled_add(self.alpha, v);
                    Ok(cv)
                };
                let solve = conjugate_gradient(damped, grad, None, self.cg)?;
                blocks.push(BlockReport {
                    node: block.node,
                    kind: block.kind,
                    iterations: solve.iterations,
                    residual_norm: solve.residual_norm,
                    converged: solve.converged,
                });
                updates.push((block.node, block.kind, solve.solution));
            }
        }

        for (node, kind, direction) in updates {
            net.linear_mut(node)?.update_param(kind, &direction, self.lr)?;
        }

        info!(
            loss = record.loss,
            curvature = %self.ext.curv_type(),
            blocks = blocks.len(),
            converged = blocks.iter().filter(|b| b.converged).count(),
            "CG-Newton step"
        );
        Ok(StepReport {
            loss: record.loss,
            blocks,
        })
    }
}
