//! Full-pivot rank-revealing QR used to determine the rank of `dF/dy^(o)`
//! (spec.md §4.1).

use nalgebra::DMatrix;

use super::{givens_rotation, RANK_EPS};
use crate::permutation::Permutation;

pub struct RankRevealingQr {
    /// The `n x n` upper-triangular factor, in pivoted row/column order.
    pub r: DMatrix<f64>,
    /// Row permutation chosen by pivoting.
    pub p: Permutation,
    /// Column permutation chosen by pivoting.
    pub q: Permutation,
    /// Largest `i` (1-based count, i.e. a count of rows/cols) such that
    /// `|A[p[i], q[i]]| >= RANK_EPS`.
    pub rank: usize,
}

/// Full-pivot rank-revealing QR of a square `n x n` matrix.
///
/// At step `i` the pivot is the entry of largest magnitude in the trailing
/// `(n-i) x (n-i)` block; rows and columns are swapped (permutations `p`,
/// `q` record this), then a Givens rotation zeroes the rest of the pivot
/// column below the diagonal. Numerical rank is the number of leading
/// pivots at or above [`RANK_EPS`].
pub fn full_pivot_rank_qr(a: &DMatrix<f64>) -> RankRevealingQr {
    let n = a.nrows();
    assert_eq!(n, a.ncols(), "full_pivot_rank_qr expects a square matrix");

    let mut r = a.clone();
    let mut p = Permutation::identity(n);
    let mut q = Permutation::identity(n);
    let mut rank = 0;

    for i in 0..n {
        let (mut best_row, mut best_col, mut best) = (i, i, 0.0f64);
        for row in i..n {
            for col in i..n {
                let v = r[(row, col)].abs();
                if v > best {
                    best = v;
                    best_row = row;
                    best_col = col;
                }
            }
        }

        if best_row != i {
            r.swap_rows(i, best_row);
            p.swap(i, best_row);
        }
        if best_col != i {
            r.swap_columns(i, best_col);
            q.swap(i, best_col);
        }

        if best >= RANK_EPS {
            rank = i + 1;
        } else {
            // Remaining trailing block is numerically zero: nothing left to
            // eliminate, and no further pivot can exceed RANK_EPS either.
            break;
        }

        for row in (i + 1)..n {
            let b = r[(row, i)];
            if b == 0.0 {
                continue;
            }
            let a_ii = r[(i, i)];
            let (c, s) = givens_rotation(a_ii, b);
            for col in i..n {
                let top = r[(i, col)];
                let bot = r[(row, col)];
                r[(i, col)] = c * top + s * bot;
                r[(row, col)] = -s * top + c * bot;
            }
        }
    }

    RankRevealingQr { r, p, q, rank }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_rank_matrix_has_full_rank() {
        let a = DMatrix::from_row_slice(3, 3, &[2.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 4.0]);
        let qr = full_pivot_rank_qr(&a);
        assert_eq!(qr.rank, 3);
    }

    #[test]
    fn rank_deficient_matrix_is_detected() {
        // third row = 2 * first row: rank 2
        let a = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 2.0, 3.0, 0.0, 1.0, -1.0, 2.0, 4.0, 6.0],
        );
        let qr = full_pivot_rank_qr(&a);
        assert_eq!(qr.rank, 2);
    }

    #[test]
    fn zero_matrix_has_rank_zero() {
        let a = DMatrix::<f64>::zeros(2, 2);
        let qr = full_pivot_rank_qr(&a);
        assert_eq!(qr.rank, 0);
    }

    #[test]
    fn permutations_stay_valid_bijections() {
        let a = DMatrix::from_row_slice(3, 3, &[0.0, 0.0, 5.0, 0.0, 3.0, 0.0, 7.0, 0.0, 0.0]);
        let qr = full_pivot_rank_qr(&a);
        assert_eq!(qr.rank, 3);
        let mut seen_p = vec![false; 3];
        let mut seen_q = vec![false; 3];
        for i in 0..3 {
            seen_p[qr.p.at(i)] = true;
            seen_q[qr.q.at(i)] = true;
        }
        assert!(seen_p.iter().all(|&b| b));
        assert!(seen_q.iter().all(|&b| b));
    }
}
