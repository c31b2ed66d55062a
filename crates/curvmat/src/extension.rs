//! # Module Extension Hooks
//!
//! The entry points a backward traversal calls once per layer. Each
//! extension receives the active [`CurvatureExtension`], the layer's
//! recorded [`LayerContext`] and the state handed down from the layer's
//! output, and returns the state for the layer's input.

use crate::curvature::Curvature;
use crate::derivatives::LayerContext;
use crate::error::Result;

/// The active curvature extension of a backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurvatureExtension {
    curv_type: Curvature,
}

impl CurvatureExtension {
    pub fn new(curv_type: Curvature) -> Self {
        Self { curv_type }
    }

    /// Curvature type selecting residual behaviour.
    pub fn curv_type(&self) -> Curvature {
        self.curv_type
    }
}

impl Default for CurvatureExtension {
    fn default() -> Self {
        Self::new(Curvature::Ggn)
    }
}

impl From<Curvature> for CurvatureExtension {
    fn from(curv_type: Curvature) -> Self {
        Self::new(curv_type)
    }
}

/// A per-layer backward hook.
///
/// `'a` is the lifetime of the recorded context; results may borrow it.
pub trait ModuleExtension<'a> {
    /// State threaded from a layer's output to its input.
    type Backproped;

    fn backpropagate(
        &self,
        ext: &CurvatureExtension,
        ctx: &'a LayerContext,
        backproped: Self::Backproped,
    ) -> Result<Self::Backproped>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curv_type_accessor() {
        let ext = CurvatureExtension::from(Curvature::PchClip);
        assert_eq!(ext.curv_type(), Curvature::PchClip);
        assert_eq!(CurvatureExtension::default().curv_type(), Curvature::Ggn);
    }
}
