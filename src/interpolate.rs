//! Dense output, endpoint interpolation and singularity localization
//! (spec.md §4.8; original names `interpolator`/`interpolators`/
//! `interpolatorx`/`interpolatorsing`).

use nalgebra::DMatrix;

use crate::callback::Residual;
use crate::state::SolverState;

/// Evaluates the divided-difference interpolating polynomial at an
/// arbitrary arc length `s_eval` between `cx`-at-`s` and the stored
/// history (spec.md §4.8 "interpolator(s)"): same Newton-form evaluation
/// as the predictor, but at a caller-chosen offset rather than the next
/// step's `h`.
pub fn interpolate(state: &SolverState, s_eval: f64) -> (f64, DMatrix<f64>) {
    let ds = s_eval - state.s;
    let mut x = 0.0;
    let mut y = DMatrix::zeros(state.o + 1, state.n);
    let mut term = 1.0;
    // Accumulated product of (ds - psi[0]) .. (ds - psi[l-1]), the Newton
    // divided-difference basis; psi[0] is implicitly 0 (the current point).
    for l in 0..=state.k {
        x += term * state.phi_x(l);
        for j in 0..=state.o {
            for i in 0..state.n {
                y[(j, i)] += term * state.phi_y(l, j, i);
            }
        }
        let node = if l == 0 { 0.0 } else { state.psi[l] };
        term *= ds - node;
        term /= state.psi[l + 1].max(f64::MIN_POSITIVE);
    }
    (x, y)
}

/// Newton iteration to find `s` such that `x(s) == xend` (spec.md §4.8
/// "interpolatorx", used by `CSDAE`). Converges quadratically near the
/// root since `x'(s)` (the tangent's `taux`) is available from the BDF
/// table's first divided difference, a cheap and accurate local slope.
pub fn interpolate_to_x(
    state: &SolverState,
    xend: f64,
    tol: f64,
    max_iterations: usize,
) -> Option<f64> {
    let mut s = state.s;
    for _ in 0..max_iterations {
        let (x, _) = interpolate(state, s);
        let residual = x - xend;
        if residual.abs() <= tol {
            return Some(s);
        }
        let slope = if state.k >= 1 {
            state.phi_x(1) / state.psi[1].max(f64::MIN_POSITIVE)
        } else {
            state.taux
        };
        if slope.abs() < 1e-14 {
            return None;
        }
        s -= residual / slope;
    }
    None
}

/// Localizes a transversal singularity (a sign change of `x'(s)`) between
/// `s_lo` and `s_hi` via Regula-Falsi on `x'(s)`, evaluated through a
/// central finite difference of [`interpolate`] (spec.md §4.8
/// "interpolatorsing"). When the previous accepted order `kold` is 1,
/// the solution is locally monotone in `x` by construction and no
/// localization is attempted: the endpoint itself is the singularity.
pub fn localize_singularity<F: Residual>(
    _f: &F,
    state: &SolverState,
    kold: usize,
    s_lo: f64,
    s_hi: f64,
    tol: f64,
    max_iterations: usize,
) -> Option<f64> {
    if kold == 1 {
        return Some(s_hi);
    }

    let xprime = |s: f64| -> f64 {
        let delta = (s_hi - s_lo).abs() * 1e-6 + 1e-12;
        let (x_plus, _) = interpolate(state, s + delta);
        let (x_minus, _) = interpolate(state, s - delta);
        (x_plus - x_minus) / (2.0 * delta)
    };

    let mut a = s_lo;
    let mut b = s_hi;
    let mut fa = xprime(a);
    let mut fb = xprime(b);
    if fa.signum() == fb.signum() {
        return None;
    }

    for _ in 0..max_iterations {
        let c = (a * fb - b * fa) / (fb - fa);
        let fc = xprime(c);
        if fc.abs() <= tol {
            return Some(c);
        }
        if fc.signum() == fa.signum() {
            a = c;
            fa = fc;
        } else {
            b = c;
            fb = fc;
        }
        if (b - a).abs() <= tol {
            return Some(c);
        }
    }
    Some((a + b) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::test_models::UnitCircle;

    #[test]
    fn interpolation_at_the_current_point_recovers_cx() {
        let mut state = SolverState::allocate(1, 1).unwrap();
        state.cx = 3.5;
        state.k = 0;
        let v = state.pack_augmented();
        state.phi[0] = v;
        let (x, _) = interpolate(&state, state.s);
        assert!((x - 3.5).abs() < 1e-12);
    }

    #[test]
    fn kold_one_skips_localization() {
        let state = SolverState::allocate(1, 1).unwrap();
        let f = UnitCircle;
        let s = localize_singularity(&f, &state, 1, 0.0, 1.0, 1e-10, 50);
        assert_eq!(s, Some(1.0));
    }
}
