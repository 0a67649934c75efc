//! Reusable linear-algebra buffers for the fit.
//!
//! Every vector and matrix the iteration touches lives here, sized once from
//! the problem dimensions. Repeated fits on the same fitter reuse the
//! allocations; a dimension change swaps the whole workspace.

use nalgebra::{DMatrix, DVector};

/// Problem dimensions established by `initialize()`.
///
/// `npar = nmea + nunm`; the measured block occupies global indices
/// `0..nmea`, the unmeasured block `nmea..npar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dimensions {
    pub npar: usize,
    pub nmea: usize,
    pub nunm: usize,
    pub ncon: usize,
}

/// The full set of working buffers.
///
/// Layout of the composite quantities:
///
/// ```text
/// etaxi = [ eta (nmea) | xi (nunm) ]        parameter vector
/// fetaxi = [ Feta (ncon x nmea) | Fxi (ncon x nunm) ]   constraint Jacobian
/// v, vnew: npar x npar, measured block top-left
/// ```
#[derive(Debug, Clone)]
pub(crate) struct FitWorkspace {
    pub dims: Dimensions,

    /// Current parameter vector, measured block first.
    pub etaxi: DVector<f64>,
    /// Snapshot of the last accepted parameter vector.
    pub etasv: DVector<f64>,
    /// Measured values, one per measured parameter.
    pub y: DVector<f64>,
    /// `y - eta`.
    pub y_eta: DVector<f64>,
    /// `Vinv * (y - eta)`, for the chi-square.
    pub vinv_y_eta: DVector<f64>,

    /// Constraint values at the start of the iteration.
    pub f: DVector<f64>,
    /// Linearized residual `f + Feta * (y - eta)`.
    pub r: DVector<f64>,
    /// Lagrange multipliers.
    pub lambda: DVector<f64>,
    /// `Fxi * dxi`, multiplier correction right-hand side.
    pub fxi_dxi: DVector<f64>,
    /// Shift of the unmeasured parameters.
    pub dxi: DVector<f64>,
    /// `Feta^T * lambda`, measured-update right-hand side.
    pub feta_t_lambda: DVector<f64>,

    /// Constraint Jacobian.
    pub fetaxi: DMatrix<f64>,
    /// Global measurement covariance, assembled from the fit objects.
    pub v: DMatrix<f64>,
    /// Inverse of the measured block of `v`.
    pub vinv: DMatrix<f64>,
    /// Fitted-parameter covariance (valid after error propagation).
    pub vnew: DMatrix<f64>,
    /// `Feta * Vetaeta`.
    pub feta_v: DMatrix<f64>,
    /// Reduced constraint-space matrix.
    pub s: DMatrix<f64>,
    pub sinv: DMatrix<f64>,
    pub sinv_fxi: DMatrix<f64>,
    pub sinv_feta: DMatrix<f64>,
    /// `Fxi^T * Sinv * Fxi`, the unmeasured-parameter system.
    pub w1: DMatrix<f64>,
    /// `Feta^T * Sinv * Feta` (error propagation).
    pub g: DMatrix<f64>,
    /// `Feta^T * Sinv * Fxi` (error propagation).
    pub h: DMatrix<f64>,
    /// `H * U` (error propagation).
    pub hu: DMatrix<f64>,
    /// `I - G * Vetaeta` (error propagation).
    pub igv: DMatrix<f64>,

    /// Scratch row handed to constraints when filling the Jacobian.
    pub grad_row: Vec<f64>,
}

impl FitWorkspace {
    pub fn new(dims: Dimensions) -> Self {
        let Dimensions {
            npar,
            nmea,
            nunm,
            ncon,
        } = dims;
        Self {
            dims,
            etaxi: DVector::zeros(npar),
            etasv: DVector::zeros(npar),
            y: DVector::zeros(nmea),
            y_eta: DVector::zeros(nmea),
            vinv_y_eta: DVector::zeros(nmea),
            f: DVector::zeros(ncon),
            r: DVector::zeros(ncon),
            lambda: DVector::zeros(ncon),
            fxi_dxi: DVector::zeros(ncon),
            dxi: DVector::zeros(nunm),
            feta_t_lambda: DVector::zeros(nmea),
            fetaxi: DMatrix::zeros(ncon, npar),
            v: DMatrix::zeros(npar, npar),
            vinv: DMatrix::zeros(nmea, nmea),
            vnew: DMatrix::zeros(npar, npar),
            feta_v: DMatrix::zeros(ncon, nmea),
            s: DMatrix::zeros(ncon, ncon),
            sinv: DMatrix::zeros(ncon, ncon),
            sinv_fxi: DMatrix::zeros(ncon, nunm),
            sinv_feta: DMatrix::zeros(ncon, nmea),
            w1: DMatrix::zeros(nunm, nunm),
            g: DMatrix::zeros(nmea, nmea),
            h: DMatrix::zeros(nmea, nunm),
            hu: DMatrix::zeros(nmea, nunm),
            igv: DMatrix::zeros(nmea, nmea),
            grad_row: vec![0.0; npar],
        }
    }

    /// Make the workspace match `dims`, reusing the current allocations when
    /// nothing changed.
    pub fn ensure(&mut self, dims: Dimensions) {
        if self.dims != dims {
            *self = Self::new(dims);
        }
    }
}
