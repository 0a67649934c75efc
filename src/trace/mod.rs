//! Observers for the fit iteration.
//!
//! A tracer is attached to the fitter and receives the full fitter state at
//! three points: once before the first iteration, after every iteration, and
//! once after termination. Tracers are purely observational; the algorithm
//! never depends on them.
//!
//! Two implementations are provided:
//!
//! - [`LogTracer`] emits one line per iteration through the `log` facade
//! - [`HistoryTracer`] records per-iteration snapshots for later inspection
//!   (convergence studies, tests)

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::ErrorCode;
use crate::fit::KinematicFitter;

/// Hooks invoked by the fitter with its current state.
pub trait FitTracer {
    /// Called once after initialization, before the first iteration.
    fn initialize(&mut self, fitter: &KinematicFitter);

    /// Called after every iteration, once the step decision is made.
    fn step(&mut self, fitter: &KinematicFitter);

    /// Called once after the fit has terminated and the probability is set.
    fn finish(&mut self, fitter: &KinematicFitter);
}

/// One per-iteration snapshot kept by [`HistoryTracer`].
#[derive(Debug, Clone, Copy)]
pub struct TraceRecord {
    pub iteration: usize,
    pub chi2: f64,
    pub step_size: f64,
    pub error_code: ErrorCode,
}

/// Tracer that forwards every iteration to `log::debug!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl FitTracer for LogTracer {
    fn initialize(&mut self, fitter: &KinematicFitter) {
        log::debug!(
            "[fit] start | {} measured, {} unmeasured, {} constraints",
            fitter.num_measured(),
            fitter.num_unmeasured(),
            fitter.num_constraints()
        );
    }

    fn step(&mut self, fitter: &KinematicFitter) {
        log::debug!(
            "[fit] iter {:>4} | chi2 {:>13.6e} | step {:>5.3} | code {}",
            fitter.iterations(),
            fitter.chi2(),
            fitter.step_size(),
            fitter.error_code()
        );
    }

    fn finish(&mut self, fitter: &KinematicFitter) {
        log::debug!(
            "[fit] done in {} iterations | chi2 {:.6e} | prob {:.6e} | code {}",
            fitter.iterations(),
            fitter.chi2(),
            fitter.probability(),
            fitter.error_code()
        );
    }
}

/// Tracer that keeps a snapshot of every iteration.
///
/// Clones share the same record storage, so keep a clone around to read the
/// history after the boxed tracer has been handed to the fitter.
#[derive(Debug, Clone, Default)]
pub struct HistoryTracer {
    records: Rc<RefCell<Vec<TraceRecord>>>,
}

impl HistoryTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records collected so far.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.borrow().clone()
    }
}

impl FitTracer for HistoryTracer {
    fn initialize(&mut self, _fitter: &KinematicFitter) {
        self.records.borrow_mut().clear();
    }

    fn step(&mut self, fitter: &KinematicFitter) {
        self.records.borrow_mut().push(TraceRecord {
            iteration: fitter.iterations(),
            chi2: fitter.chi2(),
            step_size: fitter.step_size(),
            error_code: fitter.error_code(),
        });
    }

    fn finish(&mut self, _fitter: &KinematicFitter) {}
}
