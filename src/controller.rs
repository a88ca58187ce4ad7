//! BDF coefficients, the divided-difference update, and the variable
//! step/order controller (spec.md §4.6; original names `coefficient`,
//! `update`, `controlstep`, `masterstep`).

use nalgebra::DVector;

use crate::state::{Phase, SolverState, MAX_ORDER};

/// Step-size growth is capped at this safety factor below the value that
/// would make the next error test land exactly on the boundary (a
/// standard BDF/DASSL conservatism, spec.md §4.6).
pub const GROWTH_SAFETY_FACTOR: f64 = 0.9;
/// Step size never more than doubles in one controller decision.
pub const MAX_GROWTH: f64 = 2.0;
/// Shrink factor applied to `h` on the first rejected attempt of a step.
pub const FIRST_REJECTION_SHRINK: f64 = 0.5;
/// Shrink factor applied on the second consecutive rejection.
pub const SECOND_REJECTION_SHRINK: f64 = 0.25;
/// From the third consecutive rejection on, the order is forced down to 1
/// in addition to shrinking `h` by this factor (spec.md §4.6: "three or
/// more failures in a row abandon the current order entirely").
pub const REPEATED_REJECTION_SHRINK: f64 = 0.25;

/// Recomputes `psi`, `alfa`, `beta`, `gama`, `sigma`, `alfas` and `cj` for
/// the step about to be attempted, given the current order `k` and step
/// size `h`. `psi` is persistent step-size history: `psi[l]` shifts in the
/// new step at the front, `psi_new[l] = psi_old[l-1] + h` (the classic BDF
/// `COEF` recurrence), so it must be called exactly once per attempt,
/// after `h`/`k` are set and before the predictor runs.
pub fn set_coefficients(state: &mut SolverState) {
    let k = state.k;
    let h = state.h;
    let old_psi = state.psi.clone();

    state.psi[1] = h;
    for l in 2..=(MAX_ORDER + 1) {
        state.psi[l] = old_psi[l - 1] + h;
    }

    for l in 1..=k {
        state.alfa[l] = h / state.psi[l];
    }

    let alfas: f64 = -(1..=k).map(|i| 1.0 / i as f64).sum::<f64>();
    state.cjold = state.cj;
    state.alfas = alfas;
    state.cj = -alfas / h;

    state.beta[1] = 1.0;
    state.gama[1] = 0.0;
    state.sigma[1] = 1.0;
    for l in 2..=(k + 1).min(MAX_ORDER + 1) {
        state.beta[l] = state.beta[l - 1] * old_psi[l - 1] / state.psi[l];
        state.gama[l] = state.gama[l - 1] + state.alfa[l - 1] / old_psi[l - 1].max(f64::MIN_POSITIVE);
        state.sigma[l] = l as f64 * state.sigma[l - 1] * state.alfa[l - 1];
    }
}

/// Folds a newly-accepted correction into the divided-difference table
/// (spec.md §4.6): `phi[k+1]` and `phi[k+2]` capture the step's own
/// correction (used for the next step's order-change error estimates),
/// then every lower order absorbs the next one up, highest first, the
/// standard modified-divided-difference update.
pub fn update(state: &mut SolverState, corrected: &DVector<f64>, predicted: &DVector<f64>) {
    let k = state.k;
    let delta = corrected - predicted;
    state.phi[k + 1] = delta.clone();
    if k + 2 <= MAX_ORDER + 1 {
        state.phi[k + 2] = delta;
    }
    for i in (0..=k).rev() {
        let higher = state.phi[i + 1].clone();
        state.phi[i] += higher;
    }
}

/// Weighted RMS norm of an augmented-vector-shaped quantity (spec.md §3
/// "weightnorm"): `sqrt(mean((v[i] / w[i])^2))` where `w` combines
/// `atolx`/`rtolx` for the `x` slot and `atoly`/`rtoly` per `y` component.
pub fn weighted_norm(state: &SolverState, v: &DVector<f64>) -> f64 {
    let wx = state.tol.scale_x(state.cx);
    let y0 = DVector::from_iterator(state.n, state.cy.row(0).iter().copied());
    let wy = state.tol.scale_y(&y0);
    let mut sumsq = (v[0] / wx).powi(2);
    let mut count = 1usize;
    for j in 0..=state.o {
        for i in 0..state.n {
            let idx = 1 + j * state.n + i;
            // Same tolerance scale applies at every derivative level.
            sumsq += (v[idx] / wy[i]).powi(2);
            count += 1;
        }
    }
    (sumsq / count as f64).sqrt()
}

pub struct ControlOutcome {
    pub accept: bool,
    pub new_h: f64,
    pub new_k: usize,
}

/// The accept/reject and step-size/order selection decision (spec.md
/// §4.6 `controlstep`), given the error estimate `err` already scaled by
/// `ck = |alfa[k]*sigma[k+1]|` the way the corrector hands it over.
///
/// Order selection minimizes `term_m = m * err_m` over the eligible
/// neighboring orders `m`, not the raw error estimates directly — a step
/// at a lower order that only modestly improves the error is not worth
/// taking, since it will need proportionally more of them to cover the
/// same arc length. Trying `k+1` is gated on `k+1 < ns` (the history
/// table must hold that many accepted steps already) and `kdiff != 1`
/// (an order just raised isn't raised again the very next step).
pub fn controlstep(state: &mut SolverState, err: f64) -> ControlOutcome {
    if err <= 1.0 {
        state.cfalhas = 0;
        let k = state.k;

        let erkm2 = if k > 2 {
            weighted_norm(state, &state.phi[k - 1].clone()) * state.sigma[k - 1]
        } else {
            f64::INFINITY
        };
        let erkm1 = if k > 1 {
            weighted_norm(state, &state.phi[k].clone()) * state.sigma[k]
        } else {
            f64::INFINITY
        };
        let erk = err;
        let erkp1_eligible = k < MAX_ORDER && k + 1 < state.ns && state.kdiff != 1;
        let erkp1 = if erkp1_eligible {
            weighted_norm(state, &state.phi[k + 2].clone()) * state.sigma[k + 1]
        } else {
            f64::INFINITY
        };

        let termkm2 = if k > 2 { (k - 2) as f64 * erkm2 } else { f64::INFINITY };
        let termkm1 = if k > 1 { (k - 1) as f64 * erkm1 } else { f64::INFINITY };
        let termk = k as f64 * erk;
        let termkp1 = if erkp1_eligible {
            (k + 1) as f64 * erkp1
        } else {
            f64::INFINITY
        };

        let mut new_k = k;
        let mut best_term = termk;
        let mut best_err = erk;
        if termkm1 < best_term {
            best_term = termkm1;
            best_err = erkm1;
            new_k = k - 1;
        }
        if termkm2 < best_term {
            best_term = termkm2;
            best_err = erkm2;
            new_k = k - 2;
        }
        if termkp1 < best_term {
            best_err = erkp1;
            new_k = k + 1;
        }

        // During startup there is no history yet to trust the order-change
        // estimates above k+1, so the controller instead doubles h and
        // raises the order every accepted step until something (a rejection,
        // or the measured estimates actually favoring a lower order) gives
        // evidence to stop.
        let evidence_to_reduce = new_k < k;
        let (new_h, final_k) = if state.ifase == Phase::Startup
            && k < MAX_ORDER
            && !evidence_to_reduce
        {
            state.kdiff = 1;
            (state.h * MAX_GROWTH, k + 1)
        } else {
            state.ifase = Phase::Steady;
            state.kdiff = new_k as i32 - k as i32;
            let factor =
                GROWTH_SAFETY_FACTOR * (1.0 / best_err.max(1e-16)).powf(1.0 / (new_k as f64 + 1.0));
            (state.h * factor.min(MAX_GROWTH).max(1e-2), new_k)
        };

        ControlOutcome {
            accept: true,
            new_h,
            new_k: final_k,
        }
    } else {
        let (new_h, new_k) = rejection_shrink(state);
        ControlOutcome {
            accept: false,
            new_h,
            new_k,
        }
    }
}

/// Shrinks `h` on a rejected step, escalating with consecutive failures
/// (spec.md §4.6): `0.5` on the first, `0.25` on the second, and from the
/// third failure on both `0.25` and a forced drop to order 1 (abandoning
/// the current order entirely). Shared by [`controlstep`]'s reject branch
/// and the driver's corrector-failure fallback, so both paths escalate
/// off the same `cfalhas` counter.
pub fn rejection_shrink(state: &mut SolverState) -> (f64, usize) {
    state.cfalhas += 1;
    let (shrink, new_k) = match state.cfalhas {
        1 => (FIRST_REJECTION_SHRINK, state.k),
        2 => (SECOND_REJECTION_SHRINK, state.k),
        _ => (REPEATED_REJECTION_SHRINK, 1),
    };
    (state.h * shrink, new_k)
}
