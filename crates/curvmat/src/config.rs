//! # Configuration
//!
//! Run configuration, read from JSON.
//!
//! ```json
//! {
//!   "curvature": "pch-abs",
//!   "cg_newton": { "lr": 0.1, "alpha": 0.02, "cg_maxiter": 50, "cg_tol": 0.1, "cg_atol": 0.0 }
//! }
//! ```
//!
//! Every field is optional. Curvature tags are resolved while parsing, so
//! an unknown tag fails here and never during a pass.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::curvature::Curvature;
use crate::error::{CurvError, Result};

/// Hyperparameters of the CG-Newton optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CgNewtonConfig {
    /// Step size applied to the Newton direction.
    pub lr: f64,
    /// Damping added to the curvature diagonal.
    pub alpha: f64,
    /// CG iteration cap per parameter block.
    #[serde(alias = "maxiter")]
    pub cg_maxiter: usize,
    /// Relative residual tolerance.
    #[serde(alias = "tol")]
    pub cg_tol: f64,
    /// Absolute residual tolerance.
    #[serde(alias = "atol")]
    pub cg_atol: f64,
}

impl Default for CgNewtonConfig {
    fn default() -> Self {
        Self {
            lr: 0.1,
            alpha: 0.02,
            cg_maxiter: 50,
            cg_tol: 0.1,
            cg_atol: 0.0,
        }
    }
}

impl CgNewtonConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(invalid("lr", format!("must be positive, got {}", self.lr)));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(invalid("alpha", format!("must be non-negative, got {}", self.alpha)));
        }
        if self.cg_maxiter == 0 {
            return Err(invalid("cg_maxiter", "must be at least 1".to_string()));
        }
        if self.cg_tol.is_nan() || self.cg_tol < 0.0 {
            return Err(invalid("cg_tol", format!("must be non-negative, got {}", self.cg_tol)));
        }
        if self.cg_atol.is_nan() || self.cg_atol < 0.0 {
            return Err(invalid("cg_atol", format!("must be non-negative, got {}", self.cg_atol)));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> CurvError {
    CurvError::InvalidConfig { field, reason }
}

/// Top-level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HbpConfig {
    pub curvature: Curvature,
    pub cg_newton: CgNewtonConfig,
}

impl Default for HbpConfig {
    fn default() -> Self {
        Self {
            curvature: Curvature::Ggn,
            cg_newton: CgNewtonConfig::default(),
        }
    }
}

impl HbpConfig {
    /// Parse and validate.
    pub fn from_json_str(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.cg_newton.validate()
    }
}
