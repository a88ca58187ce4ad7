//! The `GSDAE`/`CSDAE` driver state machines (spec.md §6): first-call
//! bootstrap, the accepted-step loop, singularity detection and
//! acknowledgement, and terminal interpolation.

use nalgebra::DMatrix;

use crate::callback::Jacobian;
use crate::controller::{self, ControlOutcome};
use crate::corrector::{self, MAX_STEP_RETRIES};
use crate::error::GsdaeError;
use crate::interpolate;
use crate::predictor;
use crate::state::SolverState;
use crate::structural::{self, Analysis, DeclaredStructure};
use crate::statistics::Statistics;
use crate::error::Status;

/// Owns one solver state and its user residual, the handle REDESIGN
/// FLAGS item 1 replaces the original's process-wide singleton with.
pub struct Driver<F: Jacobian> {
    pub f: F,
    pub state: SolverState,
    singularity_ack: bool,
    declared: Option<DeclaredStructure>,
}

impl<F: Jacobian> Driver<F> {
    /// Allocates a driver for `f` and sets the initial point `(x0, y0)`
    /// (spec.md §6 "allocate" + first-call bootstrap): validates the
    /// residual there, runs the structural analyzer, and seeds the
    /// divided-difference table with a single point.
    pub fn new(f: F, x0: f64, y0: DMatrix<f64>) -> Result<Self, GsdaeError> {
        Self::new_inner(f, x0, y0, None)
    }

    /// Like [`Driver::new`], but skips the structural analyzer's own
    /// rank/order-drop computation in favor of a caller-supplied rank and
    /// pivot pair (spec.md §4.7 step 2 / §6 info input index 4). Fails
    /// with [`GsdaeError::DeclaredRankTooLow`] if the measured rank of
    /// `dF/dy^(o)` at `(x0, y0)` ever exceeds `declared.rank`.
    pub fn new_with_declared_rank(
        f: F,
        x0: f64,
        y0: DMatrix<f64>,
        declared: DeclaredStructure,
    ) -> Result<Self, GsdaeError> {
        Self::new_inner(f, x0, y0, Some(declared))
    }

    fn new_inner(
        f: F,
        x0: f64,
        y0: DMatrix<f64>,
        declared: Option<DeclaredStructure>,
    ) -> Result<Self, GsdaeError> {
        let n = f.n();
        let order = f.order();
        let mut state = SolverState::allocate(n, order)?;
        state.cx = x0;
        state.cy = y0.clone();

        let mut f_vals = nalgebra::DVector::zeros(n);
        f.eval(x0, &y0, &mut f_vals);
        let residual_ok = if state.tol.ftol_enabled() {
            (0..f_vals.len()).all(|i| f_vals[i].abs() <= state.tol.ftol[i])
        } else {
            f_vals.norm() <= state.tol.rtolx.max(1e-10) * (1.0 + y0.norm())
        };
        if !residual_ok {
            return Err(GsdaeError::InitialResidualTooLarge);
        }

        let analysis = structural::analyze(&f, x0, &y0, None, declared.as_ref())?;
        apply_analysis(&mut state, &analysis);

        state.phi[0] = state.pack_augmented();
        state.k = 1;
        state.ns = 0;
        state.ifase = crate::state::Phase::Startup;

        Ok(Driver {
            f,
            state,
            singularity_ack: true,
            declared,
        })
    }

    /// Must be called once after a call returns a transversal singularity
    /// status (spec.md §7, status codes 1/3/5) before integration can
    /// resume, or the next call fails with `-16`.
    pub fn acknowledge_singularity(&mut self) {
        self.singularity_ack = true;
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            s: self.state.s,
            ..self.state.stats
        }
    }

    /// Integrates to arc length `send` (spec.md §6 "GSDAE").
    pub fn gsdae(&mut self, send: f64) -> Result<Status, GsdaeError> {
        if !self.singularity_ack {
            return Err(GsdaeError::UnacknowledgedSingularity);
        }
        self.state.dir = if send >= self.state.s { 1.0 } else { -1.0 };

        loop {
            let prev_s = self.state.s;
            let prev_taux = self.state.taux;
            let remaining = send - self.state.s;
            if remaining.abs() <= self.state.tol.atolx.max(1e-12) {
                return Ok(self.finish(false, false));
            }
            self.state.h = self.state.h.min(remaining.abs()) * self.state.dir.signum();
            let step = self.attempt_accepted_step()?;

            if self.crosses_singularity(prev_taux) {
                self.singularity_ack = false;
                let s_sing = interpolate::localize_singularity(
                    &self.f,
                    &self.state,
                    self.state.kold,
                    prev_s,
                    self.state.s,
                    self.state.tol.atolx.max(1e-10),
                    50,
                )
                .unwrap_or(self.state.s);
                let (x, y) = interpolate::interpolate(&self.state, s_sing);
                self.state.s = s_sing;
                self.state.cx = x;
                self.state.cy = y;
                return Ok(self.finish(true, step.order_dropped));
            }

            if (self.state.s - send).abs() <= self.state.tol.atolx.max(1e-12)
                || (send > prev_s && self.state.s >= send)
                || (send < prev_s && self.state.s <= send)
            {
                if (self.state.s - send).abs() > 1e-12 {
                    let (x, y) = interpolate::interpolate(&self.state, send);
                    self.state.s = send;
                    self.state.cx = x;
                    self.state.cy = y;
                }
                return Ok(self.finish(false, step.order_dropped));
            }
        }
    }

    /// Integrates until `x(s) == xend` (spec.md §6 "CSDAE").
    pub fn csdae(&mut self, xend: f64) -> Result<Status, GsdaeError> {
        if !self.singularity_ack {
            return Err(GsdaeError::UnacknowledgedSingularity);
        }
        self.state.dir = (xend - self.state.cx).signum();
        if self.state.dir == 0.0 {
            self.state.dir = 1.0;
        }

        loop {
            let prev_taux = self.state.taux;
            let step = self.attempt_accepted_step()?;

            if self.crosses_singularity(prev_taux) {
                self.singularity_ack = false;
                return Ok(self.finish(true, step.order_dropped));
            }

            let reached = if self.state.dir > 0.0 {
                self.state.cx >= xend
            } else {
                self.state.cx <= xend
            };
            if reached {
                if let Some(s_end) = interpolate::interpolate_to_x(
                    &self.state,
                    xend,
                    self.state.tol.atolx.max(1e-10),
                    50,
                ) {
                    let (x, y) = interpolate::interpolate(&self.state, s_end);
                    self.state.s = s_end;
                    self.state.cx = x;
                    self.state.cy = y;
                }
                return Ok(self.finish(false, step.order_dropped));
            }
        }
    }

    fn crosses_singularity(&self, prev_taux: f64) -> bool {
        prev_taux.signum() != 0.0
            && self.state.taux.signum() != 0.0
            && prev_taux.signum() != self.state.taux.signum()
    }

    fn finish(&self, singular: bool, order_dropped: bool) -> Status {
        let rank_dropped = self.state.rank < self.state.n;
        match (singular, rank_dropped, order_dropped) {
            (false, false, false) => Status::Regular,
            (true, false, false) => Status::TransversalSingularity,
            (false, true, false) => Status::RegularRankDrop,
            (true, true, false) => Status::TransversalRankDrop,
            (false, _, true) => Status::RegularOrderDrop,
            (true, _, true) => Status::TransversalOrderDrop,
        }
    }

    /// Runs the predict/analyze/correct/control loop until one step is
    /// accepted, shrinking `h` (and, after repeated failures, the order)
    /// on every rejection (spec.md §4.6 "masterstep").
    fn attempt_accepted_step(&mut self) -> Result<Analysis, GsdaeError> {
        for _ in 0..MAX_STEP_RETRIES {
            if self.state.h.abs() < self.state.hmin {
                return Err(GsdaeError::StepTooSmall);
            }

            controller::set_coefficients(&mut self.state);
            let predicted = predictor::predict(&self.state);

            let analysis = structural::analyze(
                &self.f,
                predicted.x,
                &predicted.y,
                Some((self.state.taux, &self.state.tauy)),
                self.declared.as_ref(),
            )?;
            apply_analysis(&mut self.state, &analysis);

            match corrector::correct(&self.f, &mut self.state, &predicted) {
                Ok(outcome) => {
                    let corrected_aug = self.state.pack_augmented();
                    let predicted_vec = predicted_aug(&predicted);
                    controller::update(&mut self.state, &corrected_aug, &predicted_vec);
                    let control = controller::controlstep(&mut self.state, outcome.scaled_error);
                    if control.accept {
                        self.accept_step(&analysis, &control, &predicted);
                        self.state.stats.accepted_steps += 1;
                        return Ok(analysis);
                    } else {
                        self.state.stats.rejected_steps += 1;
                        self.state.h = control.new_h;
                        self.state.k = control.new_k;
                        self.state.cy = predicted.y.clone();
                        self.state.cx = predicted.x;
                    }
                }
                Err(GsdaeError::IllConditioned) => return Err(GsdaeError::IllConditioned),
                Err(_) => {
                    self.state.stats.rejected_steps += 1;
                    self.state.stats.restarts += 1;
                    let (new_h, new_k) = controller::rejection_shrink(&mut self.state);
                    self.state.h = new_h;
                    self.state.k = new_k;
                }
            }
        }
        Err(GsdaeError::CorrectorDiverged)
    }

    fn accept_step(&mut self, analysis: &Analysis, control: &ControlOutcome, _predicted: &predictor::Predicted) {
        self.state.hold = self.state.h;
        self.state.kold = self.state.k;
        self.state.s += self.state.h;
        self.state.ns += 1;
        self.state.h = control.new_h;
        self.state.k = control.new_k;

        if let Ok(next) = structural::analyze(
            &self.f,
            self.state.cx,
            &self.state.cy,
            Some((analysis.taux, &analysis.tauy)),
            self.declared.as_ref(),
        ) {
            self.state.taux = next.taux;
            self.state.tauy = next.tauy;
        }
    }
}

/// Applies a structural analysis result to the persistent solver state
/// (spec.md §4.7: the effective order, rank, pivots and tangent all carry
/// forward until the next analysis).
fn apply_analysis(state: &mut SolverState, analysis: &Analysis) {
    state.o = analysis.order;
    state.rank = analysis.rank;
    state.p = analysis.p.clone();
    state.q = analysis.q.clone();
    state.taux = analysis.taux;
    state.tauy = analysis.tauy.clone();
}

fn predicted_aug(predicted: &predictor::Predicted) -> nalgebra::DVector<f64> {
    let o = predicted.y.nrows() - 1;
    let n = predicted.y.ncols();
    let mut v = nalgebra::DVector::zeros(1 + (o + 1) * n);
    v[0] = predicted.x;
    let mut idx = 1;
    for j in 0..=o {
        for i in 0..n {
            v[idx] = predicted.y[(j, i)];
            idx += 1;
        }
    }
    v
}
