//! Tolerance configuration (spec.md §3 "Tolerances", §6 "mode 0/1/2").

use nalgebra::DVector;

use crate::error::GsdaeError;

/// How tolerances were supplied on a driver call (spec.md §6, info input index 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToleranceMode {
    /// Library defaults.
    Default,
    /// A single scalar `(atol, rtol)` pair applied to every component.
    Scalar,
    /// Per-component `atoly`/`rtoly` vectors.
    PerComponent,
}

/// Tolerances in effect for one solver state.
#[derive(Debug, Clone)]
pub struct Tolerances {
    pub atolx: f64,
    pub rtolx: f64,
    pub atoly: DVector<f64>,
    pub rtoly: DVector<f64>,
    /// Residual accuracy tolerances; `ftol[0] == 0.0` disables the check
    /// (spec.md §3).
    pub ftol: DVector<f64>,
}

impl Tolerances {
    pub fn defaults(n: usize) -> Self {
        Tolerances {
            atolx: 1e-8,
            rtolx: 1e-8,
            atoly: DVector::from_element(n, 1e-8),
            rtoly: DVector::from_element(n, 1e-8),
            ftol: DVector::zeros(n),
        }
    }

    pub fn scalar(n: usize, atol: f64, rtol: f64) -> Self {
        Tolerances {
            atolx: atol,
            rtolx: rtol,
            atoly: DVector::from_element(n, atol),
            rtoly: DVector::from_element(n, rtol),
            ftol: DVector::zeros(n),
        }
    }

    pub fn per_component(
        atolx: f64,
        rtolx: f64,
        atoly: DVector<f64>,
        rtoly: DVector<f64>,
    ) -> Result<Self, GsdaeError> {
        if atoly.len() != rtoly.len() {
            return Err(GsdaeError::InvalidInput(
                "atoly and rtoly must have the same length".into(),
            ));
        }
        let n = atoly.len();
        Ok(Tolerances {
            atolx,
            rtolx,
            atoly,
            rtoly,
            ftol: DVector::zeros(n),
        })
    }

    pub fn with_ftol(mut self, ftol: DVector<f64>) -> Self {
        self.ftol = ftol;
        self
    }

    pub fn ftol_enabled(&self) -> bool {
        !self.ftol.is_empty() && self.ftol[0] != 0.0
    }

    /// Weighted scale for the x component: `atolx + rtolx * |x|`.
    pub fn scale_x(&self, x: f64) -> f64 {
        self.atolx + self.rtolx * x.abs()
    }

    /// Weighted scale vector for `y`: `atoly[i] + rtoly[i] * |y[i]|`.
    pub fn scale_y(&self, y: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(y.len(), |i, _| self.atoly[i] + self.rtoly[i] * y[i].abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ftol_disabled_when_first_entry_is_zero() {
        let tol = Tolerances::defaults(3);
        assert!(!tol.ftol_enabled());
    }

    #[test]
    fn ftol_enabled_when_first_entry_nonzero() {
        let tol = Tolerances::defaults(3).with_ftol(DVector::from_element(3, 1e-6));
        assert!(tol.ftol_enabled());
    }

    #[test]
    fn per_component_rejects_length_mismatch() {
        let result = Tolerances::per_component(
            1e-8,
            1e-8,
            DVector::from_element(2, 1e-8),
            DVector::from_element(3, 1e-8),
        );
        assert!(result.is_err());
    }
}
