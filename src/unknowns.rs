//! The corrector's unknown-vector layout, shared between [`crate::state`]
//! (packing/unpacking the solver's own `(cx, cy)`) and [`crate::jacobian`]
//! (perturbing the same layout for the finite-difference Jacobian), so the
//! two paths can never silently disagree on column order.

use crate::permutation::Permutation;

/// What a single entry of the corrector's unknown vector refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// `y^(level)[col]` (`col` is an original, unpermuted component index).
    Y { level: usize, col: usize },
    /// The scalar arc-length abscissa `x`.
    X,
}

/// Builds the ordered list of unknown slots for a problem of order `o`,
/// spatial dimension `n` and current algebraic rank `rank`, given the
/// column permutation `q`: top-derivative rank-restricted columns first,
/// then full lower-derivative blocks from `o-1` down to `0`, `x` last
/// (spec.md §4.4).
pub fn layout(n: usize, o: usize, rank: usize, q: &Permutation) -> Vec<Slot> {
    let mut slots = Vec::with_capacity(o * n + rank + 1);
    for i in 0..rank {
        slots.push(Slot::Y {
            level: o,
            col: q.at(i),
        });
    }
    if o > 0 {
        for level in (0..o).rev() {
            for i in 0..n {
                slots.push(Slot::Y {
                    level,
                    col: q.at(i),
                });
            }
        }
    }
    slots.push(Slot::X);
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_length_matches_unknown_count() {
        let q = Permutation::identity(3);
        let slots = layout(3, 2, 2, &q);
        assert_eq!(slots.len(), 2 * 3 + 2 + 1);
        assert_eq!(slots.last(), Some(&Slot::X));
    }

    #[test]
    fn layout_collapses_for_order_zero() {
        let q = Permutation::identity(2);
        let slots = layout(2, 0, 2, &q);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0], Slot::Y { level: 0, col: 0 });
        assert_eq!(slots[1], Slot::Y { level: 0, col: 1 });
        assert_eq!(slots[2], Slot::X);
    }
}
