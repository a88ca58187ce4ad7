//! The BDF predictor (spec.md §4.4): evaluates the modified
//! divided-difference table at the current point to produce a warm-start
//! for the corrector.

use nalgebra::DMatrix;

use crate::state::SolverState;

/// A predicted point and its arc-length derivative, both at full
/// `(order+1) x n` shape (the corrector later restricts the top row to the
/// rank-surviving columns).
pub struct Predicted {
    pub x: f64,
    pub y: DMatrix<f64>,
    pub dx: f64,
    pub dy: DMatrix<f64>,
}

/// `pc = sum_{l=0}^{k} phi[l]`, `dpc = sum_{l=0}^{k} gama[l] * phi[l]`
/// (spec.md §4.4): the predictor is just the divided-difference table
/// evaluated at the new point, its derivative the same table weighted by
/// the BDF `gama` coefficients set up by [`crate::controller::update`].
pub fn predict(state: &SolverState) -> Predicted {
    let mut x = 0.0;
    let mut dx = 0.0;
    let mut y = DMatrix::zeros(state.o + 1, state.n);
    let mut dy = DMatrix::zeros(state.o + 1, state.n);

    for l in 0..=state.k {
        let phi_x = state.phi_x(l);
        x += phi_x;
        dx += state.gama[l] * phi_x;
        for j in 0..=state.o {
            for i in 0..state.n {
                let v = state.phi_y(l, j, i);
                y[(j, i)] += v;
                dy[(j, i)] += state.gama[l] * v;
            }
        }
    }

    Predicted { x, y, dx, dy }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicting_with_only_the_constant_term_holds_the_point_fixed() {
        let mut state = SolverState::allocate(1, 1).unwrap();
        state.k = 0;
        state.cx = 2.0;
        state.cy[(0, 0)] = 3.0;
        state.cy[(1, 0)] = 0.5;
        let v = state.pack_augmented();
        state.phi[0] = v;
        state.gama[0] = 0.0;

        let predicted = predict(&state);
        assert_eq!(predicted.x, 2.0);
        assert_eq!(predicted.y[(0, 0)], 3.0);
        assert_eq!(predicted.y[(1, 0)], 0.5);
        assert_eq!(predicted.dx, 0.0);
    }
}
