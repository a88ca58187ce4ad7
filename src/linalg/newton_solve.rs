//! The corrector's linear solve (spec.md §4.1): `min ||A x - b||` for the
//! `(n+1) x n` over-determined Newton system, using the row-pivoted Givens
//! QR factor of `A`.

use nalgebra::{DMatrix, DVector};

use super::givens::RowPivotedQr;

/// Solves `min ||A x - b||` given the row-pivoted QR factorization of `A`
/// (`A` is `(n+1) x n`), then scales the result by `ac` (spec.md §4.1's
/// Newton-step damping factor `ac = 2/(1+cj/cjold)`; callers with no old
/// coefficient to damp against pass `ac = 1.0`).
///
/// `qt.r` is `Q^T A`, upper-trapezoidal with a numerically-zero bottom row
/// once `A` has full column rank. Applying the same rotations to `b` gives
/// `u = Q^T b`; back-substitution over the leading `n x n` triangular block
/// of `R` against the leading `n` entries of `u` then yields the
/// least-squares solution (the "solve `R^T z = u` by forward substitution,
/// then `x = R^{-T}`" phrasing in spec.md §4.1 describes the same
/// computation against a transposed-storage convention for `R`; the
/// equations solved are identical).
pub fn least_squares_solve(qr: &RowPivotedQr, b: &DVector<f64>, ac: f64) -> DVector<f64> {
    let n = qr.r.ncols();
    let u = &qr.qt * b;
    back_substitute_upper(&qr.r, &u, n) * ac
}

/// Back-substitutes the leading `n x n` upper-triangular block of `r`
/// against the leading `n` entries of `u`.
fn back_substitute_upper(r: &DMatrix<f64>, u: &DVector<f64>, n: usize) -> DVector<f64> {
    let mut x = DVector::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut rhs = u[i];
        for j in (i + 1)..n {
            rhs -= r[(i, j)] * x[j];
        }
        x[i] = rhs / r[(i, i)];
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::row_pivoted_qr;

    #[test]
    fn solves_square_system_exactly() {
        let a = DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 1.0, 0.0, 3.0, 1.0, 1.0, 1.0, 4.0]);
        let x_expected = DVector::from_vec(vec![1.0, 2.0, -1.0]);
        let b = &a * &x_expected;
        let qr = row_pivoted_qr(&a);
        let x = least_squares_solve(&qr, &b, 1.0);
        for i in 0..3 {
            assert!((x[i] - x_expected[i]).abs() < 1e-9, "x[{i}]={}", x[i]);
        }
    }

    #[test]
    fn solves_overdetermined_system_in_least_squares_sense() {
        // a is 4x3, consistent system (b in range of a) so the residual is 0
        // and the Newton step recovers x exactly.
        let a = DMatrix::from_row_slice(
            4,
            3,
            &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0],
        );
        let x_expected = DVector::from_vec(vec![3.0, -2.0, 0.5]);
        let b = &a * &x_expected;
        let qr = row_pivoted_qr(&a);
        let x = least_squares_solve(&qr, &b, 1.0);
        for i in 0..3 {
            assert!((x[i] - x_expected[i]).abs() < 1e-9, "x[{i}]={}", x[i]);
        }
    }
}
