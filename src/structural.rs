//! The structural analyzer (spec.md §4.7): measures the rank of
//! `dF/dy^(o)`, probes a neighborhood of the current point for rank
//! stability, falls back to a lower effective order when the top block is
//! entirely singular, and solves for the tangent direction `(x', y')` used
//! by the singularity detector.

use nalgebra::{DMatrix, DVector};

use crate::callback::Jacobian;
use crate::error::GsdaeError;
use crate::linalg::{full_pivot_rank_qr, row_pivoted_qr};
use crate::permutation::Permutation;

/// Number of perturbed points probed around the current one, `2*(n+1)`
/// (spec.md §4.7.1): plus/minus a small step along each of `x` and every
/// component of `y^(o)`.
fn neighborhood_size(n: usize) -> usize {
    2 * (n + 1)
}

/// A user-supplied rank and pivot pair (spec.md §4.7 step 2 / §6 info
/// input index 4), letting a caller who already knows the structure of
/// `dF/dy^(o)` skip the measured-rank/order-drop computation entirely.
#[derive(Debug, Clone)]
pub struct DeclaredStructure {
    pub rank: usize,
    pub p: Permutation,
    pub q: Permutation,
}

pub struct Analysis {
    /// Measured rank of `dF/dy^(effective order)`.
    pub rank: usize,
    /// Effective order used for this step: `order` unless a fallback to
    /// `order - 1` was needed (`order_dropped`).
    pub order: usize,
    pub order_dropped: bool,
    pub p: Permutation,
    pub q: Permutation,
    /// `x'(s)` at the current point.
    pub taux: f64,
    /// `(order+1) x n`: row `j` is `y^(j)'(s)`. Rows below `order` are
    /// copies of the already-known `y^(j+1)` (a derivative level's tangent
    /// direction is, by definition, the next derivative level itself); only
    /// row `order` is solved for.
    pub tauy: DMatrix<f64>,
}

/// Evaluates `dF/dy^(o)`, `dF/dx` at `(x, y)` for a problem whose user
/// residual tracks `order` derivative levels, restricted to an effective
/// top level `top`.
fn jacobian_block<J: Jacobian>(
    f: &J,
    x: f64,
    y: &DMatrix<f64>,
) -> (DVector<f64>, Vec<DMatrix<f64>>) {
    let n = f.n();
    let order = f.order();
    let mut dfx = DVector::zeros(n);
    let mut dfy = vec![DMatrix::zeros(n, n); order + 1];
    f.eval_jacobian(x, y, &mut dfx, &mut dfy);
    (dfx, dfy)
}

/// Runs the structural analyzer at `(x, y)` (spec.md §4.7 steps 1-4),
/// measuring rank, probing the neighborhood, falling back to a reduced
/// order if needed, and solving for the tangent.
///
/// `prev_tau` carries the previous step's `(taux, tauy)` purely to pick a
/// sign for the new tangent consistent with the direction of travel; pass
/// `None` on the very first call (any sign is then as good as the other).
pub fn analyze<J: Jacobian>(
    f: &J,
    x: f64,
    y: &DMatrix<f64>,
    prev_tau: Option<(f64, &DMatrix<f64>)>,
    declared: Option<&DeclaredStructure>,
) -> Result<Analysis, GsdaeError> {
    let n = f.n();
    let order = f.order();

    let (dfx, dfy) = jacobian_block(f, x, y);
    let top_qr = full_pivot_rank_qr(&dfy[order]);

    let (effective_order, rank, p, q) = if let Some(decl) = declared {
        if top_qr.rank > decl.rank {
            return Err(GsdaeError::DeclaredRankTooLow);
        }
        (order, decl.rank, decl.p.clone(), decl.q.clone())
    } else if top_qr.rank < n && order > 0 {
        let lower_qr = full_pivot_rank_qr(&dfy[order - 1]);
        if lower_qr.rank == n {
            (order - 1, n, lower_qr.p, lower_qr.q)
        } else {
            (order, top_qr.rank, top_qr.p, top_qr.q)
        }
    } else {
        (order, top_qr.rank, top_qr.p, top_qr.q)
    };
    let order_dropped = effective_order != order;

    // At order 0 there is no lower derivative level to absorb a rank
    // deficiency into (spec.md §4.2's row layout collapses to exactly
    // `n` F-rows + 1 norm row, with no slack for missing unknowns), so
    // any rank below full is fatal here, not just total singularity.
    if effective_order == 0 && rank < n {
        return Err(GsdaeError::IllPosedOrderZero);
    }

    let stable = rank_is_stable_in_neighborhood(f, x, y, effective_order, rank);
    if !stable {
        return Err(if order_dropped {
            GsdaeError::OrderDropRankStillVaries
        } else {
            GsdaeError::RankVariesInNeighborhood
        });
    }

    let (taux, tauy) = solve_tangent(&dfx, &dfy, effective_order, y, prev_tau)?;

    Ok(Analysis {
        rank,
        order: effective_order,
        order_dropped,
        p,
        q,
        taux,
        tauy,
    })
}

/// Re-measures the rank of `dF/dy^(effective_order)` at `2*(n+1)` points
/// perturbed from `(x, y)` by a small step along each input direction, and
/// checks every measurement agrees with `rank` (spec.md §4.7.1).
fn rank_is_stable_in_neighborhood<J: Jacobian>(
    f: &J,
    x: f64,
    y: &DMatrix<f64>,
    effective_order: usize,
    rank: usize,
) -> bool {
    let n = f.n();
    let eps = f64::EPSILON.sqrt();
    let order = f.order();
    debug_assert_eq!(neighborhood_size(n), 2 * (n + 1));

    let mut check = |px: f64, py: &DMatrix<f64>| -> bool {
        let mut dfx = DVector::zeros(n);
        let mut dfy = vec![DMatrix::zeros(n, n); order + 1];
        f.eval_jacobian(px, py, &mut dfx, &mut dfy);
        full_pivot_rank_qr(&dfy[effective_order]).rank == rank
    };

    for sign in [1.0, -1.0] {
        let delta = sign * eps * x.abs().max(1.0);
        if !check(x + delta, y) {
            return false;
        }
    }
    for i in 0..n {
        for sign in [1.0, -1.0] {
            let mut py = y.clone();
            let delta = sign * eps * py[(effective_order, i)].abs().max(1.0);
            py[(effective_order, i)] += delta;
            if !check(x, &py) {
                return false;
            }
        }
    }
    true
}

/// Solves the bordered tangent system (spec.md §4.7.2): the lower
/// derivative levels' tangent components are already known (they are, by
/// definition, the next stored derivative level), leaving an `n x (n+1)`
/// system in `(tauy[order], taux)`. Its solution set is a 1-dimensional
/// affine line (a particular solution plus a multiple of the null
/// direction); the unit-speed constraint and continuity with `prev_tau`
/// pick a unique point on it.
fn solve_tangent(
    dfx: &DVector<f64>,
    dfy: &[DMatrix<f64>],
    effective_order: usize,
    y: &DMatrix<f64>,
    prev_tau: Option<(f64, &DMatrix<f64>)>,
) -> Result<(f64, DMatrix<f64>), GsdaeError> {
    let n = dfx.len();

    let mut rhs = DVector::zeros(n);
    for j in 0..effective_order {
        rhs -= &dfy[j] * y.row(j + 1).transpose();
    }

    let b = &dfy[effective_order];
    let bbt = b * b.transpose();
    let bbt_inv = bbt
        .try_inverse()
        .ok_or(GsdaeError::RankVariesInNeighborhood)?;
    let z = bbt_inv * &rhs;
    let particular_y = b.transpose() * &z; // length n, the tauy[effective_order] part
    let particular_x = dfx.dot(&z);

    let null_full = null_direction(dfx, b);
    let null_y: DVector<f64> = DVector::from_iterator(n, (0..n).map(|i| null_full[i]));
    let null_x = null_full[n];

    let known_sq: f64 = (0..effective_order)
        .map(|j| y.row(j + 1).iter().map(|v| v * v).sum::<f64>())
        .sum();
    let budget = (1.0 - known_sq).max(0.0);

    let p_sq = particular_x * particular_x + particular_y.dot(&particular_y);
    let p_dot_null = particular_x * null_x + particular_y.dot(&null_y);
    // c^2 + 2c*(p.null) + (p_sq - budget) = 0, since ||null|| == 1.
    let disc = (p_dot_null * p_dot_null - (p_sq - budget)).max(0.0);
    let sqrt_disc = disc.sqrt();
    let c1 = -p_dot_null + sqrt_disc;
    let c2 = -p_dot_null - sqrt_disc;

    let candidate = |c: f64| -> (f64, DVector<f64>) {
        (particular_x + c * null_x, particular_y.clone() + null_y.clone() * c)
    };
    let (cand1_x, cand1_y) = candidate(c1);
    let (cand2_x, cand2_y) = candidate(c2);

    let (taux, tauy_top) = match prev_tau {
        Some((prev_x, prev_tauy)) => {
            let prev_top_row = prev_tauy.nrows() - 1;
            let dot_with = |cx: f64, cy: &DVector<f64>| -> f64 {
                let mut d = prev_x * cx;
                for i in 0..n {
                    d += prev_tauy[(prev_top_row, i)] * cy[i];
                }
                d
            };
            let dot1 = dot_with(cand1_x, &cand1_y);
            let dot2 = dot_with(cand2_x, &cand2_y);
            if dot1 >= dot2 {
                (cand1_x, cand1_y)
            } else {
                (cand2_x, cand2_y)
            }
        }
        None => (cand1_x, cand1_y),
    };

    let mut tauy = DMatrix::zeros(effective_order + 1, n);
    for j in 0..effective_order {
        tauy.set_row(j, &y.row(j + 1));
    }
    tauy.set_row(effective_order, &tauy_top.transpose());

    Ok((taux, tauy))
}

/// The unit null direction of the `n x (n+1)` matrix `[b | dfx]`, obtained
/// as the last row of the orthogonal accumulator from a row-pivoted QR of
/// its transpose (an `(n+1) x n` matrix, fitting `row_pivoted_qr`'s
/// `m = ncols + 1` case): that row spans the orthogonal complement of the
/// transpose's column space, i.e. the null space of `[b | dfx]` itself.
fn null_direction(dfx: &DVector<f64>, b: &DMatrix<f64>) -> DVector<f64> {
    let n = dfx.len();
    let mut bt = DMatrix::zeros(n + 1, n);
    for i in 0..n {
        for j in 0..n {
            bt[(i, j)] = b[(j, i)];
        }
    }
    for j in 0..n {
        bt[(n, j)] = dfx[j];
    }
    let qr = row_pivoted_qr(&bt);
    let last_row = qr.qt.row(n);
    DVector::from_iterator(n + 1, last_row.iter().copied())
}
