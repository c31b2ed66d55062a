//! # Shapes - Batched Matrices
//!
//! Curvature operators act on a batch of matrices: one `(dim, k)` block per
//! example, i.e. `k` vectors multiplied at once. Callers are allowed to pass
//! a single vector per example, `(batch, dim)`, which is promoted to
//! `(batch, dim, 1)` here, at the operator boundary, before any curvature
//! code sees it.

use std::fmt;

use ndarray::{Array3, ArrayD, ArrayView3, Axis, Ix2, Ix3};

use crate::error::CoreError;

/// Shape of a batch of matrices: `batch` examples of `dim × cols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatShape {
    /// Number of examples
    pub batch: usize,
    /// Feature dimension of each example
    pub dim: usize,
    /// Number of vectors multiplied simultaneously
    pub cols: usize,
}

impl MatShape {
    pub fn new(batch: usize, dim: usize, cols: usize) -> Self {
        Self { batch, dim, cols }
    }

    /// Shape of an existing batch matrix.
    pub fn of(mat: &ArrayView3<'_, f64>) -> Self {
        let (batch, dim, cols) = mat.dim();
        Self { batch, dim, cols }
    }

    /// Fail unless `got` equals `self`.
    pub fn expect(&self, got: MatShape) -> Result<(), CoreError> {
        if *self == got {
            Ok(())
        } else {
            Err(CoreError::ShapeMismatch {
                expected: *self,
                got,
            })
        }
    }
}

impl fmt::Display for MatShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} × {} × {}]", self.batch, self.dim, self.cols)
    }
}

impl From<(usize, usize, usize)> for MatShape {
    fn from((batch, dim, cols): (usize, usize, usize)) -> Self {
        Self::new(batch, dim, cols)
    }
}

/// Canonicalize a mat-vec input to rank 3.
///
/// `(batch, dim)` gains a trailing singleton axis; `(batch, dim, k)` is
/// returned as is. Any other rank is rejected.
pub fn promote_to_batch_mat(mat: &ArrayD<f64>) -> Result<Array3<f64>, CoreError> {
    let rank = mat.ndim();
    match rank {
        2 => {
            let vecs = mat
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|_| CoreError::InvalidRank { rank })?;
            Ok(vecs.insert_axis(Axis(2)).to_owned())
        }
        3 => mat
            .view()
            .into_dimensionality::<Ix3>()
            .map(|m| m.to_owned())
            .map_err(|_| CoreError::InvalidRank { rank }),
        _ => Err(CoreError::InvalidRank { rank }),
    }
}
