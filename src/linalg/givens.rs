//! Row-pivoted Givens QR on an `m x n` matrix, `m in {n, n+1}` (spec.md §4.1).

use nalgebra::DMatrix;

use super::givens_rotation;

/// Result of a row-pivoted Givens QR factorization.
///
/// `r` is `m x n`; its strict upper triangle (and diagonal) hold the
/// triangular factor, the sub-diagonal entries are numerically zero by
/// construction. `qt` is the `m x m` accumulation of every pivot swap and
/// Givens rotation applied, i.e. `qt * a_original = r`.
pub struct RowPivotedQr {
    pub r: DMatrix<f64>,
    pub qt: DMatrix<f64>,
    /// Row permutation applied during pivoting, as original-row-at-position.
    pub row_order: Vec<usize>,
    /// Condition estimate (spec.md §4.1): not a true condition number, but a
    /// cheap ratio used to guard against near-rank-deficient `DH` blocks.
    pub cond: f64,
}

/// Factors `a` (`m x n`, `m in {n, n+1}`) via row-pivoted Givens rotations.
///
/// At each column `i` the pivot row is the one maximizing `|a[i..m, i]|`;
/// rows are swapped in both the working matrix and the orthogonal
/// accumulator before the Givens rotations for that column are applied.
pub fn row_pivoted_qr(a: &DMatrix<f64>) -> RowPivotedQr {
    let m = a.nrows();
    let n = a.ncols();
    assert!(m == n || m == n + 1, "row_pivoted_qr expects m in {{n, n+1}}");

    let mut r = a.clone();
    let mut qt = DMatrix::<f64>::identity(m, m);
    let mut row_order: Vec<usize> = (0..m).collect();

    for i in 0..n {
        let mut pivot_row = i;
        let mut best = r[(i, i)].abs();
        for row in (i + 1)..m {
            let v = r[(row, i)].abs();
            if v > best {
                best = v;
                pivot_row = row;
            }
        }
        if pivot_row != i {
            r.swap_rows(i, pivot_row);
            qt.swap_rows(i, pivot_row);
            row_order.swap(i, pivot_row);
        }

        for row in (i + 1)..m {
            let b = r[(row, i)];
            if b == 0.0 {
                continue;
            }
            let a_ii = r[(i, i)];
            let (c, s) = givens_rotation(a_ii, b);
            apply_givens_to_rows(&mut r, i, row, c, s);
            apply_givens_to_rows(&mut qt, i, row, c, s);
        }
    }

    let cond = condition_estimate(&r, n);
    RowPivotedQr {
        r,
        qt,
        row_order,
        cond,
    }
}

/// Rotates rows `i` and `j` of `m` in place by `[[c, s], [-s, c]]`.
fn apply_givens_to_rows(m: &mut DMatrix<f64>, i: usize, j: usize, c: f64, s: f64) {
    let ncols = m.ncols();
    for col in 0..ncols {
        let top = m[(i, col)];
        let bot = m[(j, col)];
        m[(i, col)] = c * top + s * bot;
        m[(j, col)] = -s * top + c * bot;
    }
}

/// `cond = max_{j<i<=n} |R[j,i] / R[i,i]|`, or `|1/R[0,0]|` when `n == 1`.
fn condition_estimate(r: &DMatrix<f64>, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        let diag = r[(0, 0)];
        return if diag == 0.0 {
            f64::INFINITY
        } else {
            (1.0 / diag).abs()
        };
    }
    let mut cond: f64 = 0.0;
    for i in 0..n {
        let diag = r[(i, i)];
        if diag == 0.0 {
            return f64::INFINITY;
        }
        for j in 0..i {
            cond = cond.max((r[(j, i)] / diag).abs());
        }
    }
    cond
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(qr: &RowPivotedQr, original: &DMatrix<f64>) -> DMatrix<f64> {
        // qt * permuted(original) should equal r; check qt^T * r recovers the
        // row-permuted original instead, since qt is orthogonal.
        qr.qt.transpose() * qr.r.clone() - permuted(original, &qr.row_order)
    }

    fn permuted(a: &DMatrix<f64>, row_order: &[usize]) -> DMatrix<f64> {
        let mut out = a.clone();
        for (new_row, &orig_row) in row_order.iter().enumerate() {
            out.set_row(new_row, &a.row(orig_row));
        }
        out
    }

    #[test]
    fn factorization_reconstructs_the_matrix() {
        let a = DMatrix::from_row_slice(3, 3, &[2.0, 1.0, 0.0, 4.0, 3.0, 1.0, -2.0, 2.0, 5.0]);
        let qr = row_pivoted_qr(&a);
        let residual = reconstruct(&qr, &a);
        for v in residual.iter() {
            assert!(v.abs() < 1e-9, "residual {v}");
        }
    }

    #[test]
    fn r_is_upper_triangular() {
        let a = DMatrix::from_row_slice(4, 3, &[
            1.0, 2.0, 3.0, //
            4.0, 5.0, 6.0, //
            7.0, 8.0, 10.0, //
            0.5, -1.0, 2.0,
        ]);
        let qr = row_pivoted_qr(&a);
        for col in 0..3 {
            for row in (col + 1)..4 {
                assert!(
                    qr.r[(row, col)].abs() < 1e-9,
                    "expected ~0 at ({row},{col}), got {}",
                    qr.r[(row, col)]
                );
            }
        }
    }

    #[test]
    fn qt_is_orthogonal() {
        let a = DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 1.0, 1.0, 3.0, 0.0, 0.0, 1.0, 4.0]);
        let qr = row_pivoted_qr(&a);
        let should_be_identity = &qr.qt * qr.qt.transpose();
        for i in 0..3 {
            for j in 0..3 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((should_be_identity[(i, j)] - expect).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn condition_estimate_for_scalar_case() {
        let a = DMatrix::from_row_slice(1, 1, &[0.25]);
        let qr = row_pivoted_qr(&a);
        assert!((qr.cond - 4.0).abs() < 1e-9);
    }

    #[test]
    fn near_singular_matrix_has_large_condition_estimate() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1000.0, 0.0, 1e-8]);
        let qr = row_pivoted_qr(&a);
        assert!(qr.cond > 1e6);
    }
}
