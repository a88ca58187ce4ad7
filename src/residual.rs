//! The augmented residual packer `H` (spec.md §4.2).
//!
//! `H(c, c')` stacks three blocks: the permuted user residual `F`, the
//! arc-length chain-rule links between consecutive derivative levels (the
//! top link restricted to the first `rank` permuted columns), and the
//! unit-speed constraint `h*(x'^2 + sum y'^2 - 1)`.
//!
//! [`Layout`] is shared between this module and [`crate::jacobian`]
//! (REDESIGN FLAGS item 3): both the analytic and finite-difference
//! Jacobian paths walk the same row ranges this module computes, so they
//! cannot silently diverge in row ordering.

use nalgebra::{DMatrix, DVector};

use crate::permutation::Permutation;

/// Fixed row-range layout of `H` for a given `(n, o, rank)`.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub n: usize,
    pub o: usize,
    pub rank: usize,
}

impl Layout {
    pub fn new(n: usize, o: usize, rank: usize) -> Self {
        Layout { n, o, rank }
    }

    /// Total row count: `n` (F-rows) + `(o-1)*n + rank` (chain-rule links,
    /// when `o >= 1`) + `1` (unit-speed row). Collapses to `rank + 1` when
    /// `o == 0` (no chain-rule links exist without a derivative above `y`).
    pub fn len(&self) -> usize {
        if self.o == 0 {
            self.n + 1
        } else {
            self.n + (self.o - 1) * self.n + self.rank + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Row range occupied by the permuted `F` block.
    pub fn f_rows(&self) -> std::ops::Range<usize> {
        0..self.n
    }

    /// Row range of the chain-rule link producing derivative level
    /// `level` (`1 <= level <= o`) from level `level - 1`. Full `n` rows
    /// for `level < o`, restricted to `rank` rows for `level == o`.
    pub fn link_rows(&self, level: usize) -> std::ops::Range<usize> {
        debug_assert!(level >= 1 && level <= self.o);
        let start = self.n + (level - 1) * self.n;
        let width = if level == self.o { self.rank } else { self.n };
        start..(start + width)
    }

    /// The final unit-speed constraint row.
    pub fn norm_row(&self) -> usize {
        self.len() - 1
    }
}

/// Packs `H(c, c')` given the already-evaluated user residual `f_vals`
/// (`F(x, y)`, unpermuted, length `n`) and the current `(y, y')` at every
/// derivative level.
///
/// `h` is the signed step size; it rescales every row but the `F` block
/// (spec.md §4.2: "the multiplier h ... rescales the differential block so
/// the system is uniformly conditioned when h is small").
pub fn pack(
    layout: Layout,
    h: f64,
    p: &Permutation,
    q: &Permutation,
    f_vals: &DVector<f64>,
    dx: f64,
    y: &DMatrix<f64>,
    dy: &DMatrix<f64>,
) -> DVector<f64> {
    let mut out = DVector::zeros(layout.len());

    for (row, &orig) in layout.f_rows().zip(p.as_slice()) {
        out[row] = f_vals[orig];
    }

    for level in 1..=layout.o {
        let rows = layout.link_rows(level);
        let width = rows.len();
        for (k, row) in rows.enumerate() {
            let col = q.at(k);
            let _ = width;
            out[row] = h * (y[(level, col)] * dx - dy[(level - 1, col)]);
        }
    }

    let mut norm = dx * dx;
    for j in 0..=layout.o {
        for i in 0..layout.n {
            norm += dy[(j, i)] * dy[(j, i)];
        }
    }
    out[layout.norm_row()] = h * (norm - 1.0);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_length_matches_unknown_count_for_order_one() {
        // n=3, o=1: layout len should be n (F) + rank (restricted top link,
        // since o-1=0 gives no full-width links) + 1 = n + rank + 1.
        let layout = Layout::new(3, 1, 2);
        assert_eq!(layout.len(), 3 + 2 + 1);
    }

    #[test]
    fn layout_length_for_order_zero_is_rank_plus_one() {
        let layout = Layout::new(2, 0, 2);
        assert_eq!(layout.len(), 3);
    }

    #[test]
    fn f_rows_and_norm_row_do_not_overlap() {
        let layout = Layout::new(2, 2, 1);
        let f = layout.f_rows();
        let norm = layout.norm_row();
        assert!(!f.contains(&norm));
    }

    #[test]
    fn pack_places_permuted_f_block_first() {
        let layout = Layout::new(2, 0, 2);
        let p = Permutation::from_vec(vec![1, 0]);
        let q = Permutation::identity(2);
        let f_vals = DVector::from_vec(vec![10.0, 20.0]);
        let y = DMatrix::zeros(1, 2);
        let dy = DMatrix::zeros(1, 2);
        let out = pack(layout, 1.0, &p, &q, &f_vals, 0.0, &y, &dy);
        assert_eq!(out[0], 20.0);
        assert_eq!(out[1], 10.0);
    }
}
