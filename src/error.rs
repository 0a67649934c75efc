//! Error reporting for the fitter.
//!
//! Two kinds of conditions are distinguished:
//!
//! - [`ErrorCode`]: the outcome taxonomy of a fit. Non-convergence and
//!   in-loop singularities terminate the iteration but still leave the best
//!   available parameter estimate in the fit objects, so they are *not*
//!   surfaced as Rust errors — `fit()` returns the probability and the code
//!   stays queryable.
//! - [`FitError`]: hard failures where no usable result exists (capacity
//!   bounds at setup, a rejected restore of the last accepted point, or a
//!   singular system during error propagation).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome code of the most recent fit.
///
/// `StepCut` and `Stepping` are transient: they describe the decision taken
/// at the end of an iteration and are only observable through a tracer. All
/// other codes are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Converged normally.
    Converged,
    /// Iteration cap exceeded without convergence.
    IterationLimit,
    /// Chi-square exceeded the runaway threshold.
    ChiSquareRunaway,
    /// A step was rejected with the damping factor already at its floor.
    StepFloorReached,
    /// Transient: the step was rejected, retrying from the last accepted
    /// point with a smaller damping factor.
    StepCut,
    /// Transient: the step was accepted, damping factor raised towards 1.
    Stepping,
    /// The reduced constraint-space system was singular during the main loop.
    SingularReducedSystem,
    /// The unmeasured-parameter system was singular during the main loop.
    SingularUnmeasuredSystem,
    /// The reduced constraint-space system was singular during error
    /// propagation; the fit result stands but the covariance is invalid.
    SingularErrorPropagation,
}

impl ErrorCode {
    /// Numeric code, stable across versions.
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::Converged => 0,
            ErrorCode::IterationLimit => 1,
            ErrorCode::ChiSquareRunaway => 2,
            ErrorCode::StepFloorReached => 3,
            ErrorCode::StepCut => 4,
            ErrorCode::Stepping => 5,
            ErrorCode::SingularReducedSystem => 7,
            ErrorCode::SingularUnmeasuredSystem => 8,
            ErrorCode::SingularErrorPropagation => 9,
        }
    }

    /// True for the per-iteration damping-adjustment states.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorCode::StepCut | ErrorCode::Stepping)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Hard failures of a fit; see the module docs for the split between these
/// and [`ErrorCode`].
#[derive(Debug, Clone, Error)]
pub enum FitError {
    #[error("{npar} free parameters exceed the capacity bound of {max}")]
    TooManyParameters { npar: usize, max: usize },

    #[error("{nunm} unmeasured parameters exceed the capacity bound of {max}")]
    TooManyUnmeasured { nunm: usize, max: usize },

    #[error("{ncon} constraints exceed the capacity bound of {max}")]
    TooManyConstraints { ncon: usize, max: usize },

    #[error("fit objects rejected the restored parameters after a step cut")]
    RestoredStateRejected,

    #[error("reduced constraint-space system is singular during error propagation")]
    SingularErrorPropagation,

    #[error("unmeasured covariance block is singular during error propagation")]
    SingularUnmeasuredBlock,
}
