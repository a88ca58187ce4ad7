//! The modified-Newton corrector (spec.md §4.5): fixed leading
//! coefficient `cj`, row-pivoted QR least-squares Newton step, and the
//! classic rate-of-convergence test that lets most iterations skip a
//! fresh Jacobian factorization.

use nalgebra::{DMatrix, DVector};

use crate::callback::Jacobian;
use crate::error::GsdaeError;
use crate::jacobian;
use crate::linalg::{least_squares_solve, row_pivoted_qr};
use crate::predictor::Predicted;
use crate::residual::{self, Layout};
use crate::state::SolverState;
use crate::unknowns;

/// A correction is accepted once the predicted convergence rate is below
/// this bound (spec.md §4.5, the DASSL-style "0.9" threshold).
pub const CONVERGENCE_RATE_BOUND: f64 = 0.9;
/// Safety factor applied to the convergence estimate against the nominal
/// error-test bound of `1.0` (spec.md §4.5, the "1/3" threshold).
pub const CONVERGENCE_SAFETY_FACTOR: f64 = 1.0 / 3.0;
/// Newton iterations attempted before the corrector gives up on this `h`.
pub const MAX_NEWTON_ITERATIONS: usize = 4;
/// Outer step-shrinking retries before the driver gives up on the step.
pub const MAX_STEP_RETRIES: usize = 20;
/// A cached iteration matrix is trusted as long as `cj` hasn't drifted
/// from the value it was built at by more than this fraction (spec.md
/// §4.5's "DH stays fixed across a few steps" modified-Newton rule).
const DH_REUSE_TOLERANCE: f64 = 0.3;

pub struct CorrectorOutcome {
    pub iterations: usize,
    pub final_residual_norm: f64,
    /// Weighted error estimate `ck * ||correction||_w` used by
    /// [`crate::controller::controlstep`].
    pub scaled_error: f64,
}

/// The Newton-step damping factor `ac = 2/(1+cj/cjold)` (spec.md §4.1):
/// compensates the step taken against a (possibly stale) iteration
/// matrix built at a different leading coefficient than the one in force
/// for this attempt. The first step of an integration has no `cjold` to
/// damp against, so it is left undamped.
fn newton_acceleration(cj: f64, cjold: f64) -> f64 {
    if cjold == 0.0 {
        1.0
    } else {
        2.0 / (1.0 + cj / cjold)
    }
}

/// Runs the modified-Newton corrector starting from `predicted`, mutating
/// `state.cx`/`state.cy` in place on success (spec.md §4.5).
///
/// `state.p`, `state.q`, `state.rank` and `state.o` must already reflect
/// this step's structural analysis (the caller applies
/// [`crate::structural::Analysis`] before calling this).
pub fn correct<F: Jacobian>(
    f: &F,
    state: &mut SolverState,
    predicted: &Predicted,
) -> Result<CorrectorOutcome, GsdaeError> {
    let layout = Layout::new(state.n, state.o, state.rank);
    let cj = state.cj;
    let h = state.h;
    let ac = newton_acceleration(state.cj, state.cjold);

    let anchor_x = predicted.x - predicted.dx / cj;
    let anchor_y = &predicted.y - predicted.dy.clone() / cj;

    let mut x = predicted.x;
    let mut y = predicted.y.clone();
    let mut dx = predicted.dx;
    let mut dy = predicted.dy.clone();

    let weights = unknown_weights(state, &layout);
    let predicted_norm = weighted_rms(&predicted_unknowns(predicted, state), &weights);

    // Reuse a cached iteration matrix from a previous step when `cj`
    // hasn't drifted far from the value it was assembled at; otherwise a
    // fresh one is built on the first iteration below.
    let mut dh = if state
        .dh
        .as_ref()
        .is_some_and(|_| (state.cj - state.dh_cj).abs() <= DH_REUSE_TOLERANCE * state.dh_cj.abs().max(1e-12))
    {
        state.dh.take()
    } else {
        None
    };
    let mut started_from_cache = dh.is_some();

    let mut d1: Option<f64> = None;
    let mut last_h = DVector::zeros(layout.len());
    let mut last_residual_norm = 0.0;
    let mut iteration = 0usize;

    loop {
        iteration += 1;

        let mut f_vals = DVector::zeros(f.n());
        f.eval(x, &y, &mut f_vals);
        state.stats.f_evaluations += 1;

        let h_vec = residual::pack(layout, h, &state.p, &state.q, &f_vals, dx, &y, &dy);
        last_residual_norm = weighted_rms(&h_vec, &weights);
        last_h = h_vec.clone();

        if dh.is_none() {
            let mut dfx = DVector::zeros(f.n());
            let mut dfy = vec![DMatrix::zeros(f.n(), f.n()); f.order() + 1];
            f.eval_jacobian(x, &y, &mut dfx, &mut dfy);
            state.stats.df_evaluations += 1;
            let assembled = jacobian::pack_analytic(
                layout, h, cj, &state.p, &state.q, dx, &y, &dy, &dfx, &dfy,
            );
            state.stats.qr_factorizations += 1;
            dh = Some(assembled);
            state.dh_cj = cj;
        }

        let qr = row_pivoted_qr(dh.as_ref().unwrap());
        if qr.cond > state.cdmax {
            state.dh = None;
            return Err(GsdaeError::IllConditioned);
        }
        let correction = least_squares_solve(&qr, &h_vec, ac);
        let d = weighted_rms(&correction, &weights);

        apply_correction(
            &mut x,
            &mut y,
            &correction,
            &unknowns::layout(state.n, state.o, state.rank, &state.q),
        );
        dx = cj * (x - anchor_x);
        dy = (&y - &anchor_y) * cj;

        // spec.md §4.5's two-branch acceptance test: iteration 1 accepts
        // unconditionally once the correction is already within machine
        // precision of the predicted point, or else against the
        // cross-step convergence estimator `state.factor` carried over
        // from the last corrector call that converged at iteration >= 2;
        // later iterations estimate a fresh convergence rate `rho` off
        // iteration 1's norm and replace `state.factor` with it.
        let accepted = if iteration == 1 {
            d1 = Some(d);
            d <= 100.0 * f64::EPSILON * predicted_norm || state.factor * d <= CONVERGENCE_SAFETY_FACTOR
        } else {
            let d1v = d1.unwrap_or(d).max(f64::MIN_POSITIVE);
            let rho = (d / d1v).powf(1.0 / (iteration as f64 - 1.0));
            if rho > CONVERGENCE_RATE_BOUND {
                state.stats.newton_failures += 1;
                state.dh = None;
                return Err(GsdaeError::CorrectorDiverged);
            }
            let factor = rho / (1.0 - rho).max(1e-12);
            let ok = factor * d <= CONVERGENCE_SAFETY_FACTOR;
            if ok {
                state.factor = factor;
            }
            ok
        };

        if accepted {
            // H above was packed before this iteration's correction was
            // applied; re-evaluate F at the converged point so the
            // optional residual-accuracy check (spec.md §4.5 last step)
            // looks at the point actually being accepted.
            if state.tol.ftol_enabled() {
                let mut final_f = DVector::zeros(f.n());
                f.eval(x, &y, &mut final_f);
                state.stats.f_evaluations += 1;
                for i in 0..final_f.len() {
                    if final_f[i].abs() > state.tol.ftol[i] {
                        state.stats.newton_failures += 1;
                        state.dh = None;
                        return Err(GsdaeError::AdvancedResidualTooLarge);
                    }
                }
            }

            state.cx = x;
            state.cy = y;
            state.dh = dh;
            let ck = (state.alfa[state.k] * state.sigma[state.k + 1]).abs();
            return Ok(CorrectorOutcome {
                iterations: iteration,
                final_residual_norm: last_residual_norm,
                scaled_error: ck * weighted_rms(&last_h, &weights),
            });
        }

        if iteration >= MAX_NEWTON_ITERATIONS {
            if started_from_cache {
                // The iteration matrix this attempt used was carried over
                // from an earlier step; re-evaluate it fresh at the
                // current iterate and give the corrector one more full
                // round before giving up on `h` (spec.md §4.5: a Newton
                // failure first checks DH staleness before shrinking h).
                started_from_cache = false;
                dh = None;
                iteration = 0;
                d1 = None;
                continue;
            }
            state.dh = None;
            state.stats.newton_failures += 1;
            return Err(GsdaeError::CorrectorDiverged);
        }
    }
}

/// Replaces `x`/`y` with `predicted - correction`, using the same unknown
/// layout the corrector's Jacobian is built against.
fn apply_correction(
    x: &mut f64,
    y: &mut DMatrix<f64>,
    correction: &DVector<f64>,
    slots: &[unknowns::Slot],
) {
    for (idx, slot) in slots.iter().enumerate() {
        match *slot {
            unknowns::Slot::Y { level, col } => y[(level, col)] -= correction[idx],
            unknowns::Slot::X => *x -= correction[idx],
        }
    }
}

/// Per-unknown tolerance scale, built once per corrector attempt from the
/// predicted point (spec.md §3 "weightvector").
fn unknown_weights(state: &SolverState, layout: &Layout) -> DVector<f64> {
    let slots = unknowns::layout(layout.n, layout.o, layout.rank, &state.q);
    let wy = state.tol.scale_y(&DVector::from_iterator(
        state.n,
        state.cy.row(0).iter().copied(),
    ));
    DVector::from_iterator(
        slots.len(),
        slots.iter().map(|slot| match *slot {
            unknowns::Slot::Y { col, .. } => wy[col],
            unknowns::Slot::X => state.tol.scale_x(state.cx),
        }),
    )
}

/// Packs the predicted `(x, y)` into the same unknown-vector layout as
/// a Newton correction, so `||predicted||_w` can be compared against the
/// first correction's norm (spec.md §4.5's `100*eps` unconditional-accept
/// test).
fn predicted_unknowns(predicted: &Predicted, state: &SolverState) -> DVector<f64> {
    let slots = unknowns::layout(state.n, state.o, state.rank, &state.q);
    DVector::from_iterator(
        slots.len(),
        slots.iter().map(|slot| match *slot {
            unknowns::Slot::Y { level, col } => predicted.y[(level, col)],
            unknowns::Slot::X => predicted.x,
        }),
    )
}

fn weighted_rms(v: &DVector<f64>, weights: &DVector<f64>) -> f64 {
    if v.len() != weights.len() {
        // The residual vector (H) and the unknown vector (u) have the same
        // length by construction (Layout::len() == unknown count), but the
        // final residual-accuracy check reuses this helper against H using
        // the unknown weights; fall back to an unweighted RMS if shapes
        // ever diverge rather than panic mid-step.
        return (v.dot(v) / v.len().max(1) as f64).sqrt();
    }
    let sumsq: f64 = v
        .iter()
        .zip(weights.iter())
        .map(|(vi, wi)| (vi / wi).powi(2))
        .sum();
    (sumsq / v.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::test_models::UnitCircle;
    use crate::controller::set_coefficients;

    #[test]
    fn corrector_converges_on_the_unit_circle() {
        let mut state = SolverState::allocate(1, 1).unwrap();
        state.h = 0.05;
        state.k = 1;
        state.cx = 0.0;
        state.cy[(0, 0)] = 1.0;
        state.cy[(1, 0)] = 0.0;
        set_coefficients(&mut state);

        let predicted = Predicted {
            x: 0.05,
            y: DMatrix::from_row_slice(2, 1, &[0.999, -0.05]),
            dx: state.cj * 0.05,
            dy: DMatrix::from_row_slice(2, 1, &[state.cj * (0.999 - 1.0), 0.0]),
        };

        let f = UnitCircle;
        let outcome = correct(&f, &mut state, &predicted);
        assert!(outcome.is_ok(), "corrector failed: {:?}", outcome.err());
        let residual = state.cx * state.cx + state.cy[(0, 0)] * state.cy[(0, 0)] - 1.0;
        assert!(residual.abs() < 1e-6, "residual={residual}");
    }

    #[test]
    fn newton_acceleration_is_undamped_on_the_first_step() {
        assert_eq!(newton_acceleration(10.0, 0.0), 1.0);
    }

    #[test]
    fn newton_acceleration_matches_the_spec_formula() {
        let ac = newton_acceleration(10.0, 5.0);
        assert!((ac - 2.0 / (1.0 + 10.0 / 5.0)).abs() < 1e-12);
    }

    #[test]
    fn dh_is_cached_across_corrector_calls_at_a_stable_cj() {
        let mut state = SolverState::allocate(1, 1).unwrap();
        state.h = 0.05;
        state.k = 1;
        state.cx = 0.0;
        state.cy[(0, 0)] = 1.0;
        state.cy[(1, 0)] = 0.0;
        set_coefficients(&mut state);

        let predicted = Predicted {
            x: 0.05,
            y: DMatrix::from_row_slice(2, 1, &[0.999, -0.05]),
            dx: state.cj * 0.05,
            dy: DMatrix::from_row_slice(2, 1, &[state.cj * (0.999 - 1.0), 0.0]),
        };
        let f = UnitCircle;
        correct(&f, &mut state, &predicted).unwrap();
        assert!(state.dh.is_some());
    }
}
