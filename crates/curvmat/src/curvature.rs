//! # Curvature Policy
//!
//! A curvature type decides two things about every layer with a nonlinear
//! response: whether its residual (the diagonal Hessian term) enters the
//! backpropagated curvature at all, and how the raw residual is modified
//! before it does.
//!
//! | type | residual | modification | loss Hessian must be PSD |
//! |------|----------|--------------|--------------------------|
//! | `hessian` | yes | none | no |
//! | `ggn` | no | zero | yes |
//! | `pch-abs` | yes | `\|r\|` | yes |
//! | `pch-clip` | yes | `max(r, 0)` | yes |
//!
//! The set is closed: tags are resolved to a [`Curvature`] once, when the
//! configuration is read, and unknown tags fail there.

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{CurvError, Result};

/// Curvature matrix approximations supported by the backpropagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Curvature {
    /// Exact Hessian: residuals kept as they are.
    Hessian,
    /// Generalized Gauss-Newton: residuals dropped.
    Ggn,
    /// Positive-curvature Hessian, residual eigenvalues cast to `|r|`.
    PchAbs,
    /// Positive-curvature Hessian, negative residual eigenvalues clipped to zero.
    PchClip,
}

impl Curvature {
    /// Every registered curvature type.
    pub const ALL: [Curvature; 4] = [
        Curvature::Hessian,
        Curvature::Ggn,
        Curvature::PchAbs,
        Curvature::PchClip,
    ];

    /// Canonical tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Curvature::Hessian => "hessian",
            Curvature::Ggn => "ggn",
            Curvature::PchAbs => "pch-abs",
            Curvature::PchClip => "pch-clip",
        }
    }

    /// Do second-order effects of layers enter the curvature?
    pub fn requires_residual(self) -> bool {
        !matches!(self, Curvature::Ggn)
    }

    /// Must the loss Hessian be positive semi-definite?
    pub fn requires_psd_loss_hessian(self) -> bool {
        !matches!(self, Curvature::Hessian)
    }

    /// Apply the policy's elementwise transform to a raw residual.
    ///
    /// Takes the residual by value; NaNs pass through untouched.
    pub fn modify_residual(self, mut residual: Array2<f64>) -> Array2<f64> {
        match self {
            Curvature::Hessian => {}
            Curvature::Ggn => residual.fill(0.0),
            Curvature::PchAbs => residual.mapv_inplace(f64::abs),
            Curvature::PchClip => residual.mapv_inplace(|r| if r < 0.0 { 0.0 } else { r }),
        }
        residual
    }

    /// Reject a loss whose Hessian is not PSD when the type requires one.
    pub fn check_loss_hessian(self, loss: &'static str, loss_hessian_is_psd: bool) -> Result<()> {
        if self.requires_psd_loss_hessian() && !loss_hessian_is_psd {
            return Err(CurvError::LossHessianNotPsd {
                loss,
                curvature: self,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Curvature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Curvature {
    type Err = CurvError;

    /// Parse a tag. The legacy names `none`, `zero`, `abs` and `clip`
    /// (strategies for second-order module terms) are accepted as aliases.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hessian" | "none" => Ok(Curvature::Hessian),
            "ggn" | "zero" => Ok(Curvature::Ggn),
            "pch-abs" | "abs" => Ok(Curvature::PchAbs),
            "pch-clip" | "clip" => Ok(Curvature::PchClip),
            _ => Err(CurvError::UnknownCurvature { name: s.to_string() }),
        }
    }
}

impl TryFrom<String> for Curvature {
    type Error = CurvError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Curvature> for String {
    fn from(value: Curvature) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_requires_residual() {
        assert!(Curvature::Hessian.requires_residual());
        assert!(!Curvature::Ggn.requires_residual());
        assert!(Curvature::PchAbs.requires_residual());
        assert!(Curvature::PchClip.requires_residual());
    }

    #[test]
    fn test_requires_psd_loss_hessian() {
        assert!(!Curvature::Hessian.requires_psd_loss_hessian());
        for curv in [Curvature::Ggn, Curvature::PchAbs, Curvature::PchClip] {
            assert!(curv.requires_psd_loss_hessian());
        }
    }

    #[test]
    fn test_modify_residual() {
        let r = array![[0.5, -0.5], [-2.0, 3.0]];

        assert_eq!(Curvature::Hessian.modify_residual(r.clone()), r);
        assert_eq!(
            Curvature::Ggn.modify_residual(r.clone()),
            Array2::<f64>::zeros((2, 2))
        );
        assert_eq!(
            Curvature::PchAbs.modify_residual(r.clone()),
            array![[0.5, 0.5], [2.0, 3.0]]
        );
        assert_eq!(
            Curvature::PchClip.modify_residual(r.clone()),
            array![[0.5, 0.0], [0.0, 3.0]]
        );
    }

    #[test]
    fn test_clip_keeps_nan() {
        let r = Curvature::PchClip.modify_residual(array![[f64::NAN, -1.0]]);
        assert!(r[[0, 0]].is_nan());
        assert_eq!(r[[0, 1]], 0.0);
    }

    #[test]
    fn test_parse_tags_and_aliases() {
        for curv in Curvature::ALL {
            assert_eq!(curv.as_str().parse::<Curvature>().unwrap(), curv);
        }
        assert_eq!("zero".parse::<Curvature>().unwrap(), Curvature::Ggn);
        assert_eq!("abs".parse::<Curvature>().unwrap(), Curvature::PchAbs);
        assert_eq!("clip".parse::<Curvature>().unwrap(), Curvature::PchClip);
        assert_eq!(" Hessian ".parse::<Curvature>().unwrap(), Curvature::Hessian);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = "kfac".parse::<Curvature>().unwrap_err();
        assert!(matches!(err, CurvError::UnknownCurvature { ref name } if name == "kfac"));
    }

    #[test]
    fn test_check_loss_hessian() {
        assert!(Curvature::Hessian.check_loss_hessian("Odd", false).is_ok());
        assert!(Curvature::Ggn.check_loss_hessian("Mse", true).is_ok());
        assert!(matches!(
            Curvature::PchClip.check_loss_hessian("Odd", false),
            Err(CurvError::LossHessianNotPsd {
                curvature: Curvature::PchClip,
                ..
            })
        ));
    }

    #[test]
    fn test_serde_tags() {
        let json = serde_json::to_string(&Curvature::PchAbs).unwrap();
        assert_eq!(json, "\"pch-abs\"");
        let back: Curvature = serde_json::from_str("\"clip\"").unwrap();
        assert_eq!(back, Curvature::PchClip);
        assert!(serde_json::from_str::<Curvature>("\"diag\"").is_err());
    }
}
