//! # Curvature Mat-Vec Operators
//!
//! The value threaded backward through the network: multiplication by the
//! curvature matrix at one point of the graph, without ever materializing
//! the matrix.
//!
//! Implementations work on `(batch, dim, k)`. Callers go through
//! [`CurvatureMatProd::apply`], which also accepts `(batch, dim)` and
//! promotes it first; the result is always rank 3.

use std::rc::Rc;

use hbp_core::promote_to_batch_mat;
use ndarray::{Array3, ArrayD};

use crate::error::Result;

/// Multiplication by a curvature matrix, block-diagonal over the batch.
pub trait CurvatureMatProd {
    /// Multiply every `(dim, k)` block of a `(batch, dim, k)` batch.
    fn mat_prod(&self, mat: &Array3<f64>) -> Result<Array3<f64>>;

    /// Multiply a `(batch, dim)` or `(batch, dim, k)` input.
    fn apply(&self, mat: &ArrayD<f64>) -> Result<Array3<f64>> {
        let mat = promote_to_batch_mat(mat)?;
        self.mat_prod(&mat)
    }
}

/// Shared handle to an operator.
///
/// A layer's output curvature feeds both its input operator and its
/// parameter operators, hence the reference count.
pub type MatProdRef<'a> = Rc<dyn CurvatureMatProd + 'a>;

/// The identity curvature.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMatProd;

impl CurvatureMatProd for IdentityMatProd {
    fn mat_prod(&self, mat: &Array3<f64>) -> Result<Array3<f64>> {
        Ok(mat.clone())
    }
}

/// Wrap a closure as an operator.
pub struct FnMatProd<F>(F);

impl<F> FnMatProd<F>
where
    F: Fn(&Array3<f64>) -> Result<Array3<f64>>,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> CurvatureMatProd for FnMatProd<F>
where
    F: Fn(&Array3<f64>) -> Result<Array3<f64>>,
{
    fn mat_prod(&self, mat: &Array3<f64>) -> Result<Array3<f64>> {
        (self.0)(mat)
    }
}
