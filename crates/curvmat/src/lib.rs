//! # Curvmat - Backpropagation of Curvature Matrix Products
//!
//! Second-order information for layered networks without ever forming a
//! matrix: the curvature w.r.t. a layer's input is an *operator*, built from
//! the operator at the layer's output, the layer's Jacobian and its own
//! second derivative.
//!
//! ## Core Concepts
//!
//! - **The backward pass carries operators**: each layer turns `CMP_out`
//!   into `CMP_in = Jᵀ · CMP_out · J + R`
//! - **Curvature type is a policy**: exact Hessian, GGN, or a
//!   positive-curvature variant that modifies the residual `R`
//! - **Batched matrices**: operators act on `(batch, dim, k)`, `k` vectors
//!   per example at once
//!
//! ## Modules
//!
//! - [`curvature`]: the curvature policy
//! - [`derivatives`]: per-layer Jacobians and residuals, reference layers and losses
//! - [`matprod`]: the operator interface
//! - [`cmp`]: curvature backpropagation through one layer
//! - [`jacobian`]: plain transpose-Jacobian transport
//! - [`extension`]: the per-layer hook interface
//! - [`network`]: a sequential host driving the hooks
//! - [`optim`]: CG-Newton on the parameter blocks
//! - [`config`]: JSON configuration
//!
//! ## Example
//!
//! ```rust
//! use hbp_curvmat::derivatives::{one_hot, CrossEntropyLoss, Linear};
//! use hbp_curvmat::network::{Layer, Sequential};
//! use hbp_curvmat::{Curvature, CurvatureExtension};
//! use ndarray::array;
//!
//! let mut net = Sequential::new(2);
//! net.push(Linear::random(2, 4, 0)).unwrap();
//! net.push(Layer::Tanh).unwrap();
//! net.push(Linear::random(4, 3, 1)).unwrap();
//!
//! let x = array![[0.1, 0.2], [0.3, -0.4]];
//! let t = one_hot(&[2, 0], 3).unwrap();
//! let record = net.forward_backward(&x, &CrossEntropyLoss, &t).unwrap();
//!
//! let ext = CurvatureExtension::new(Curvature::PchClip);
//! let curvature = net.curvature_pass(&record, &ext, &CrossEntropyLoss).unwrap();
//! let block = &curvature.params[0];
//! let hv = block.cmp.apply_vec(&ndarray::Array1::ones(block.cmp.dim())).unwrap();
//! assert_eq!(hv.len(), 8);
//! ```

pub mod cmp;
pub mod config;
pub mod curvature;
pub mod derivatives;
pub mod error;
pub mod extension;
pub mod jacobian;
pub mod matprod;
pub mod network;
pub mod optim;

// Re-export key types
pub use cmp::{CmpBackprop, CmpIn, LossCmp, ParamCmp};
pub use config::{CgNewtonConfig, HbpConfig};
pub use curvature::Curvature;
pub use derivatives::{Derivatives, LayerContext, LossDerivatives};
pub use error::{CurvError, Result};
pub use extension::{CurvatureExtension, ModuleExtension};
pub use jacobian::{Backproped, MatToJacMat};
pub use matprod::{CurvatureMatProd, MatProdRef};
pub use network::{Layer, Sequential};
pub use optim::{conjugate_gradient, CgNewton, CgOptions};
