//! # Jacobian Transport
//!
//! Transport of matrices through transpose-Jacobians only.
//!
//! The plain sibling of [`crate::cmp::CmpBackprop`]: no curvature is
//! combined, each backproped matrix is simply multiplied by `Jᵀ`.

use ndarray::Array3;

use crate::derivatives::{Derivatives, LayerContext};
use crate::error::Result;
use crate::extension::{CurvatureExtension, ModuleExtension};

/// State carried by [`MatToJacMat`].
#[derive(Debug, Clone, PartialEq)]
pub enum Backproped {
    Single(Array3<f64>),
    /// Several tracked quantities (per class, per group); order is kept.
    List(Vec<Array3<f64>>),
}

impl Backproped {
    /// Number of matrices carried.
    pub fn len(&self) -> usize {
        match self {
            Backproped::Single(_) => 1,
            Backproped::List(mats) => mats.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into a list.
    pub fn into_vec(self) -> Vec<Array3<f64>> {
        match self {
            Backproped::Single(mat) => vec![mat],
            Backproped::List(mats) => mats,
        }
    }
}

impl From<Array3<f64>> for Backproped {
    fn from(mat: Array3<f64>) -> Self {
        Backproped::Single(mat)
    }
}

impl From<Vec<Array3<f64>>> for Backproped {
    fn from(mats: Vec<Array3<f64>>) -> Self {
        Backproped::List(mats)
    }
}

/// Applies `Jᵀ` to backproped matrices. Layers without derivatives are
/// transparent.
#[derive(Clone, Copy, Default)]
pub struct MatToJacMat<'d> {
    derivatives: Option<&'d dyn Derivatives>,
}

impl<'d> MatToJacMat<'d> {
    pub fn new(derivatives: Option<&'d dyn Derivatives>) -> Self {
        Self { derivatives }
    }
}

impl<'a> ModuleExtension<'a> for MatToJacMat<'_> {
    type Backproped = Backproped;

    fn backpropagate(
        &self,
        _ext: &CurvatureExtension,
        ctx: &'a LayerContext,
        backproped: Backproped,
    ) -> Result<Backproped> {
        let Some(derivatives) = self.derivatives else {
            return Ok(backproped);
        };
        match backproped {
            Backproped::Single(mat) => derivatives
                .jac_t_mat_prod(ctx, &mat)
                .map(Backproped::Single),
            Backproped::List(mats) => mats
                .iter()
                .map(|mat| derivatives.jac_t_mat_prod(ctx, mat))
                .collect::<Result<Vec<_>>>()
                .map(Backproped::List),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivatives::{Linear, Tanh};
    use crate::error::CurvError;
    use ndarray::{array, Array, Array2};

    fn linear_context() -> (Linear, LayerContext) {
        let layer = Linear::new(array![[1.0, 2.0], [0.0, -1.0], [3.0, 1.0]], array![0.0, 0.0, 0.0])
            .unwrap();
        let x = array![[1.0, 2.0], [-1.0, 0.5]];
        let z = layer.forward(&x);
        let ctx = LayerContext::new(x, z, Array2::zeros((2, 2)), Array2::zeros((2, 3)));
        (layer, ctx)
    }

    #[test]
    fn test_list_is_transported_in_order() {
        let (layer, ctx) = linear_context();
        let mats: Vec<Array3<f64>> = (0..3)
            .map(|n| Array::from_shape_fn((2, 3, 2), |(b, o, c)| (n * 7 + b + o * c) as f64))
            .collect();

        let out = MatToJacMat::new(Some(&layer as &dyn Derivatives))
            .backpropagate(&CurvatureExtension::default(), &ctx, Backproped::List(mats.clone()))
            .unwrap();

        let Backproped::List(out) = out else {
            panic!("list must stay a list");
        };
        assert_eq!(out.len(), 3);
        for (got, mat) in out.iter().zip(mats.iter()) {
            assert_eq!(got, &layer.jac_t_mat_prod(&ctx, mat).unwrap());
        }
    }

    #[test]
    fn test_single_matrix() {
        let (layer, ctx) = linear_context();
        let mat = Array::from_shape_fn((2, 3, 1), |(b, o, _)| (b + o) as f64);
        let out = MatToJacMat::new(Some(&layer as &dyn Derivatives))
            .backpropagate(&CurvatureExtension::default(), &ctx, mat.clone().into())
            .unwrap();
        assert_eq!(out, Backproped::Single(layer.jac_t_mat_prod(&ctx, &mat).unwrap()));
    }

    #[test]
    fn test_identity_layer_passes_through() {
        let (_, ctx) = linear_context();
        let state = Backproped::List(vec![Array3::ones((2, 3, 1)), Array3::zeros((2, 3, 2))]);
        let out = MatToJacMat::default()
            .backpropagate(&CurvatureExtension::default(), &ctx, state.clone())
            .unwrap();
        assert_eq!(out, state);
    }

    #[test]
    fn test_empty_list_stays_empty() {
        let (layer, ctx) = linear_context();
        let out = MatToJacMat::new(Some(&layer as &dyn Derivatives))
            .backpropagate(&CurvatureExtension::default(), &ctx, Backproped::List(Vec::new()))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_bad_element_fails_whole_list() {
        let x = array![[0.1, 0.2]];
        let ctx = LayerContext::new(x.clone(), x.mapv(f64::tanh), x.clone(), x);
        let state = Backproped::List(vec![Array3::ones((1, 2, 1)), Array3::ones((1, 5, 1))]);
        let result = MatToJacMat::new(Some(&Tanh as &dyn Derivatives)).backpropagate(
            &CurvatureExtension::default(),
            &ctx,
            state,
        );
        assert!(matches!(result, Err(CurvError::ShapeMismatch { .. })));
    }
}
