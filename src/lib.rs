//! `kinfit`: constrained least-squares kinematic fitting.
//!
//! Given a collection of fit objects (each owning measured and/or unmeasured
//! parameters) and a set of equality constraints relating them, the fitter:
//!
//! - minimizes the chi-square distance to the measurements subject to the
//!   constraints being exactly satisfied (Lagrange-multiplier Newton steps)
//! - propagates the measurement covariance into a fitted-parameter covariance
//! - converts the final chi-square into a fit probability
//!
//! The crate is a library on purpose:
//!
//! - fit objects and constraints are trait implementations, so domain
//!   parameterizations (jets, tracks, beams, ...) stay outside the core
//! - the solver is deterministic and single-threaded; one fitter instance owns
//!   its linear-algebra workspace and reuses it across repeated fits

pub mod constraints;
pub mod error;
pub mod fit;
pub mod math;
pub mod objects;
pub mod trace;

pub use constraints::{Constraint, LinearConstraint, LinearTerm};
pub use error::{ErrorCode, FitError};
pub use fit::{FitOptions, FitReport, KinematicFitter};
pub use objects::{FitObject, VectorFitObject};
pub use trace::{FitTracer, HistoryTracer, LogTracer, TraceRecord};
