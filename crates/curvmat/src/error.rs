//! Error types for curvature backpropagation.

use hbp_core::{CoreError, MatShape};
use thiserror::Error;

use crate::curvature::Curvature;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CurvError>;

/// Errors raised while building or applying curvature operators.
#[derive(Debug, Error)]
pub enum CurvError {
    /// The layer cannot provide what the curvature type asks for.
    ///
    /// Raised when a residual term is required but the layer's Hessian is
    /// not diagonal. Never downgraded to a zero residual.
    #[error("Not implemented for layer {layer}: {reason}")]
    NotImplemented { layer: String, reason: String },

    /// A curvature tag that is not one of the registered choices.
    #[error("Unknown curvature type '{name}' (choices: hessian, ggn, pch-abs, pch-clip)")]
    UnknownCurvature { name: String },

    /// The curvature type requires a PSD loss Hessian and the loss has none.
    #[error("Loss {loss} has no positive semi-definite Hessian, but curvature {curvature} requires one")]
    LossHessianNotPsd {
        loss: &'static str,
        curvature: Curvature,
    },

    /// A derivative routine received a matrix of the wrong shape.
    #[error("Shape mismatch in {op}: expected {expected}, got {got}")]
    ShapeMismatch {
        op: &'static str,
        expected: MatShape,
        got: MatShape,
    },

    /// A class label outside `0..classes`.
    #[error("Label {label} out of range for {classes} classes")]
    InvalidLabel { label: usize, classes: usize },

    /// A configuration value is out of range.
    #[error("Invalid configuration '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// Configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Shape or wiring failure from the core crate.
    #[error(transparent)]
    Core(#[from] CoreError),
}
