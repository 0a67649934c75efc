//! The constrained fit itself.
//!
//! Responsibilities:
//!
//! - assign global indices to all free parameters (measured block first)
//! - run the Lagrange-multiplier Newton iteration with adaptive step damping
//! - propagate the measurement covariance into the fitted-parameter
//!   covariance after convergence

pub mod fitter;
pub(crate) mod workspace;

pub use fitter::{FitOptions, FitReport, KinematicFitter, NCON_MAX, NPAR_MAX, NUNM_MAX};
