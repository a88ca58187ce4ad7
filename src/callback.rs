//! User-supplied residual `F` and its analytic Jacobian `DF` (spec.md §1,
//! "deliberately out of scope: the user-supplied residual F and its
//! analytic Jacobian DF ... treated as interfaces the core consumes").
//!
//! Modeled as traits rather than raw function pointers, following the
//! teacher's `Callable`/`Jacobian`/`Op` pattern (`callable/ode.rs`,
//! `callable/unit.rs`, `op/sdirk.rs`) and 0-based indexing throughout
//! (REDESIGN FLAGS item 2).

use nalgebra::{DMatrix, DVector};

/// `F(x, y, y', ..., y^(o)) = 0`.
///
/// `y` is `(order()+1) x n()`: row `j` holds `y^(j)` (row 0 is `y` itself).
pub trait Residual {
    /// Spatial dimension `n`.
    fn n(&self) -> usize;
    /// DAE order `o` (number of derivatives above `y` itself).
    fn order(&self) -> usize;
    /// Evaluates `F(x, y) -> out` (`out` has length `n()`).
    fn eval(&self, x: f64, y: &DMatrix<f64>, out: &mut DVector<f64>);
}

/// The analytic Jacobian `DF` of a [`Residual`]: `dF/dx` and `dF/dy^(j)` for
/// every derivative order `j = 0..=order()`.
pub trait Jacobian: Residual {
    /// `dfx[i] = dF_i/dx`.
    fn eval_jacobian(
        &self,
        x: f64,
        y: &DMatrix<f64>,
        dfx: &mut DVector<f64>,
        // dfy[j] is the n x n matrix dF/dy^(j), for j = 0..=order()
        dfy: &mut [DMatrix<f64>],
    );
}

#[cfg(test)]
pub(crate) mod test_models {
    //! Small residuals used across module test suites, grounded in the
    //! teacher's `ode_solver/test_models` (closures wrapped in a tiny struct
    //! implementing the callback traits, rather than the teacher's
    //! higher-order-closure builder, since our callback surface is a trait).
    use super::*;

    /// The unit circle, order 1: `F(x, y0) = x^2 + y0^2 - 1`.
    pub struct UnitCircle;

    impl Residual for UnitCircle {
        fn n(&self) -> usize {
            1
        }
        fn order(&self) -> usize {
            1
        }
        fn eval(&self, x: f64, y: &DMatrix<f64>, out: &mut DVector<f64>) {
            let y0 = y[(0, 0)];
            out[0] = x * x + y0 * y0 - 1.0;
        }
    }

    impl Jacobian for UnitCircle {
        fn eval_jacobian(
            &self,
            x: f64,
            y: &DMatrix<f64>,
            dfx: &mut DVector<f64>,
            dfy: &mut [DMatrix<f64>],
        ) {
            let y0 = y[(0, 0)];
            dfx[0] = 2.0 * x;
            dfy[0][(0, 0)] = 2.0 * y0;
            dfy[1][(0, 0)] = 0.0;
        }
    }

    /// Purely algebraic, n=2, o=0: `F = (x^2 - y0; y0 - 2*y1)`.
    pub struct AlgebraicPair;

    impl Residual for AlgebraicPair {
        fn n(&self) -> usize {
            2
        }
        fn order(&self) -> usize {
            0
        }
        fn eval(&self, x: f64, y: &DMatrix<f64>, out: &mut DVector<f64>) {
            out[0] = x * x - y[(0, 0)];
            out[1] = y[(0, 0)] - 2.0 * y[(0, 1)];
        }
    }

    impl Jacobian for AlgebraicPair {
        fn eval_jacobian(
            &self,
            x: f64,
            _y: &DMatrix<f64>,
            dfx: &mut DVector<f64>,
            dfy: &mut [DMatrix<f64>],
        ) {
            dfx[0] = 2.0 * x;
            dfx[1] = 0.0;
            dfy[0][(0, 0)] = -1.0;
            dfy[0][(0, 1)] = 0.0;
            dfy[0][(1, 0)] = 1.0;
            dfy[0][(1, 1)] = -2.0;
        }
    }

    /// Rank drop at x=1: `F = (x^2+y0^2-1; (1-x^2)*y1)`.
    pub struct RankDrop;

    impl Residual for RankDrop {
        fn n(&self) -> usize {
            2
        }
        fn order(&self) -> usize {
            1
        }
        fn eval(&self, x: f64, y: &DMatrix<f64>, out: &mut DVector<f64>) {
            let (y0, y1) = (y[(0, 0)], y[(0, 1)]);
            out[0] = x * x + y0 * y0 - 1.0;
            out[1] = (1.0 - x * x) * y1;
        }
    }

    impl Jacobian for RankDrop {
        fn eval_jacobian(
            &self,
            x: f64,
            y: &DMatrix<f64>,
            dfx: &mut DVector<f64>,
            dfy: &mut [DMatrix<f64>],
        ) {
            let (y0, y1) = (y[(0, 0)], y[(0, 1)]);
            dfx[0] = 2.0 * x;
            dfx[1] = -2.0 * x * y1;
            dfy[0][(0, 0)] = 2.0 * y0;
            dfy[0][(0, 1)] = 0.0;
            dfy[0][(1, 0)] = 0.0;
            dfy[0][(1, 1)] = 1.0 - x * x;
            dfy[1][(0, 0)] = 0.0;
            dfy[1][(0, 1)] = 0.0;
            dfy[1][(1, 0)] = 0.0;
            dfy[1][(1, 1)] = 0.0;
        }
    }

    #[test]
    fn unit_circle_residual_vanishes_on_the_circle() {
        let f = UnitCircle;
        let y = DMatrix::from_row_slice(2, 1, &[1.0, 0.0]);
        let mut out = DVector::zeros(1);
        f.eval(0.0, &y, &mut out);
        assert!(out[0].abs() < 1e-12);
    }
}
