//! Arc-length continuation solver for index 0/1 differential-algebraic
//! equations: `F(x, y, y', ..., y^(o)) = 0` parametrized by arc length
//! `s` so the integrator can cross transversal singularities (points
//! where `x'(s)` changes sign) and detect rank drops of `∂F/∂y^(o)`.
//!
//! The public entry point is [`Driver`]: [`Driver::new`] bootstraps a
//! solver state at an initial point, then [`Driver::gsdae`] advances to
//! a target arc length and [`Driver::csdae`] advances to a target `x`.
//! Both return a [`Status`] on success and a [`GsdaeError`] variant
//! matching the negative status codes on failure.

pub mod callback;
pub mod controller;
pub mod corrector;
pub mod driver;
pub mod error;
pub mod interpolate;
pub mod jacobian;
pub mod linalg;
pub mod permutation;
pub mod predictor;
pub mod residual;
pub mod state;
pub mod statistics;
pub mod structural;
pub mod tolerances;
pub mod unknowns;

pub use callback::{Jacobian, Residual};
pub use driver::Driver;
pub use error::{GsdaeError, GsdaeResult, Status};
pub use state::SolverState;
pub use statistics::Statistics;
pub use tolerances::{ToleranceMode, Tolerances};
