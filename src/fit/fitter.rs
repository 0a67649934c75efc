//! The Lagrange-multiplier Newton fitter.
//!
//! Each iteration linearizes the constraints at the current point, solves the
//! reduced constraint-space system for the Lagrange multipliers and the
//! unmeasured-parameter shift, updates all parameters, and re-evaluates the
//! chi-square. Divergent steps are retried from the last accepted point with
//! a smaller damping factor. After termination the measurement covariance is
//! propagated into a fitted-parameter covariance.
//!
//! The notation follows the usual kinematic-fit conventions:
//!
//! ```text
//! eta    measured parameters          y       measured values
//! xi     unmeasured parameters        lambda  Lagrange multipliers
//! Feta   d(constraints)/d(eta)        Fxi     d(constraints)/d(xi)
//! S      Feta V Feta^T (+ Fxi Fxi^T)  V       measurement covariance
//! ```

use nalgebra::Cholesky;
use serde::{Deserialize, Serialize};

use crate::constraints::Constraint;
use crate::error::{ErrorCode, FitError};
use crate::fit::workspace::{Dimensions, FitWorkspace};
use crate::math::prob::chi_squared_prob;
use crate::objects::FitObject;
use crate::trace::FitTracer;

/// Capacity bound on free parameters.
pub const NPAR_MAX: usize = 50;
/// Capacity bound on constraints.
pub const NCON_MAX: usize = 20;
/// Capacity bound on unmeasured parameters.
pub const NUNM_MAX: usize = 10;

/// Tuning knobs of the iteration.
///
/// The defaults are the tolerances the algorithm was validated with; change
/// them only deliberately. The exact-convergence tolerance assumes parameters
/// and constraint values of order unity (GeV, radians, ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FitOptions {
    /// Iteration cap; exceeding it terminates with
    /// [`ErrorCode::IterationLimit`].
    pub max_iterations: usize,
    /// Floor of the damping factor for unmeasured-parameter steps.
    pub step_floor: f64,
    /// Chi-square treated as a runaway once past the first iterations.
    pub chi2_runaway: f64,
    /// Convergence: largest accepted change of the constraint penalty.
    pub chik_tol: f64,
    /// Convergence: largest accepted relative change of the measurement
    /// chi-square.
    pub chit_rel_tol: f64,
    /// Largest constraint-penalty share of the measurement chi-square that
    /// still counts as converged (also gates the bad-step test).
    pub chik_to_chit_max: f64,
    /// Growth factor of the constraint penalty that marks a step as bad.
    pub chik_growth_max: f64,
    /// Exact criterion: tolerance on constraint values and per-parameter
    /// changes.
    pub exact_tol: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            step_floor: 0.05,
            chi2_runaway: 10_000.0,
            chik_tol: 1e-3,
            chit_rel_tol: 1e-4,
            chik_to_chit_max: 1e-2,
            chik_growth_max: 1.05,
            exact_tol: 1e-6,
        }
    }
}

/// Serializable summary of a finished fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    pub error_code: ErrorCode,
    pub chi2: f64,
    pub probability: f64,
    pub iterations: usize,
    pub num_measured: usize,
    pub num_unmeasured: usize,
    pub num_constraints: usize,
    pub dof: i64,
    pub cov_valid: bool,
}

/// The constrained least-squares fitter.
///
/// Owns the fit objects, the constraints and the linear-algebra workspace.
/// [`fit`](KinematicFitter::fit) runs to completion synchronously; the
/// workspace is reused across repeated fits and reallocated only when the
/// problem dimensions change.
pub struct KinematicFitter {
    options: FitOptions,
    objects: Vec<Box<dyn FitObject>>,
    constraints: Vec<Box<dyn Constraint>>,
    tracer: Option<Box<dyn FitTracer>>,
    ws: FitWorkspace,

    code: ErrorCode,
    iterations: usize,
    chi2: f64,
    probability: f64,
    step_size: f64,
    cov: Vec<f64>,
    cov_dim: usize,
    cov_valid: bool,
}

impl KinematicFitter {
    pub fn new() -> Self {
        Self::with_options(FitOptions::default())
    }

    pub fn with_options(options: FitOptions) -> Self {
        Self {
            options,
            objects: Vec::new(),
            constraints: Vec::new(),
            tracer: None,
            ws: FitWorkspace::new(Dimensions::default()),
            code: ErrorCode::Converged,
            iterations: 0,
            chi2: 0.0,
            probability: 0.0,
            step_size: 1.0,
            cov: Vec::new(),
            cov_dim: 0,
            cov_valid: false,
        }
    }

    /// Append a fit object; returns its insertion index, which constraints
    /// use to address it.
    pub fn add_object(&mut self, object: Box<dyn FitObject>) -> usize {
        self.objects.push(object);
        self.objects.len() - 1
    }

    /// Append a constraint; returns its insertion index.
    pub fn add_constraint(&mut self, constraint: Box<dyn Constraint>) -> usize {
        self.constraints.push(constraint);
        self.constraints.len() - 1
    }

    /// Install an observer receiving the fitter state at every iteration.
    pub fn set_tracer(&mut self, tracer: Box<dyn FitTracer>) {
        self.tracer = Some(tracer);
    }

    /// Remove the current tracer, returning it.
    pub fn take_tracer(&mut self) -> Option<Box<dyn FitTracer>> {
        self.tracer.take()
    }

    pub fn objects(&self) -> &[Box<dyn FitObject>] {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut [Box<dyn FitObject>] {
        &mut self.objects
    }

    pub fn constraints(&self) -> &[Box<dyn Constraint>] {
        &self.constraints
    }

    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    /// Outcome code of the most recent fit (0 = converged).
    pub fn error_code(&self) -> ErrorCode {
        self.code
    }

    /// Chi-square of the most recent fit.
    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    /// Fit probability; 0.5 when the fit has no degrees of freedom.
    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Iterations taken by the most recent fit.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Current damping factor for unmeasured-parameter steps.
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn num_parameters(&self) -> usize {
        self.ws.dims.npar
    }

    pub fn num_measured(&self) -> usize {
        self.ws.dims.nmea
    }

    pub fn num_unmeasured(&self) -> usize {
        self.ws.dims.nunm
    }

    pub fn num_constraints(&self) -> usize {
        self.ws.dims.ncon
    }

    /// Degrees of freedom: constraints minus unmeasured parameters.
    pub fn dof(&self) -> i64 {
        self.ws.dims.ncon as i64 - self.ws.dims.nunm as i64
    }

    /// Fitted-parameter covariance as a flat row-major buffer of side
    /// [`covariance_dim`](Self::covariance_dim), if the last error
    /// propagation succeeded.
    pub fn covariance(&self) -> Option<&[f64]> {
        self.cov_valid.then(|| self.cov.as_slice())
    }

    pub fn covariance_dim(&self) -> usize {
        self.cov_dim
    }

    pub fn report(&self) -> FitReport {
        FitReport {
            error_code: self.code,
            chi2: self.chi2,
            probability: self.probability,
            iterations: self.iterations,
            num_measured: self.ws.dims.nmea,
            num_unmeasured: self.ws.dims.nunm,
            num_constraints: self.ws.dims.ncon,
            dof: self.dof(),
            cov_valid: self.cov_valid,
        }
    }

    /// Run the fit to completion and return the fit probability.
    ///
    /// Non-convergence and in-loop singularities are *not* errors: the best
    /// available estimate stays in the fit objects and the condition is
    /// reported through [`error_code`](Self::error_code). `Err` is reserved
    /// for the hard failures listed on [`FitError`].
    pub fn fit(&mut self) -> Result<f64, FitError> {
        let mut tracer = self.tracer.take();
        let result = self.run(tracer.as_deref_mut());
        self.tracer = tracer;
        result
    }

    fn run(&mut self, mut tracer: Option<&mut (dyn FitTracer + 'static)>) -> Result<f64, FitError> {
        self.initialize()?;
        self.gather_parameters();
        self.fill_jacobian();

        let Dimensions {
            npar,
            nmea,
            nunm,
            ncon,
        } = self.ws.dims;
        let opts = self.options;

        let mut chinew = 0.0;
        let mut chit = 0.0;
        let mut chik = 0.0;
        let mut chik0 = 100.0;
        let mut chit0 = 100.0;
        let mut alph = 1.0;

        self.iterations = 0;
        self.code = ErrorCode::Converged;
        self.step_size = alph;
        self.chi2 = 0.0;

        let mut repeat = true;
        let mut scut = false;
        let mut calcerr = true;

        if let Some(t) = tracer.as_mut() {
            t.initialize(self);
        }

        while repeat {
            let mut updatesuccess;

            if scut {
                // retry with a smaller step from the last accepted point
                self.ws.etaxi.copy_from(&self.ws.etasv);
                updatesuccess = self.update_fit_objects();
                if !updatesuccess {
                    log::warn!("fit objects rejected the restored parameters");
                    return Err(FitError::RestoredStateRejected);
                }
                self.fill_jacobian();
            } else {
                self.ws.etasv.copy_from(&self.ws.etaxi);
                chik0 = chik;
                chit0 = chit;
            }

            // assemble the measurement covariance and invert its measured
            // block; a failure here only matters once the inverse is used
            self.ws.v.fill(0.0);
            for obj in &self.objects {
                obj.add_to_global_cov(&mut self.ws.v);
            }
            let vinv_ok = {
                let vetaeta = self.ws.v.view((0, 0), (nmea, nmea)).into_owned();
                match vetaeta.lu().try_inverse() {
                    Some(inv) => {
                        self.ws.vinv.copy_from(&inv);
                        true
                    }
                    None => {
                        log::warn!("measured covariance block is singular");
                        false
                    }
                }
            };

            for (k, constraint) in self.constraints.iter().enumerate() {
                self.ws.f[k] = constraint.value(&self.objects);
            }

            {
                let ws = &mut self.ws;
                // linearized residual r = f + Feta (y - eta)
                ws.y_eta.copy_from(&ws.y);
                ws.y_eta -= &ws.etaxi.rows(0, nmea);
                ws.r.copy_from(&ws.f);
                ws.r.gemv(1.0, &ws.fetaxi.columns(0, nmea), &ws.y_eta, 1.0);

                // S = Feta Vetaeta Feta^T; the Fxi Fxi^T term keeps S regular
                // when some constraint touches no measured parameter
                ws.feta_v
                    .gemm(1.0, &ws.fetaxi.columns(0, nmea), &ws.v.view((0, 0), (nmea, nmea)), 0.0);
                let feta_t = ws.fetaxi.columns(0, nmea).transpose();
                ws.s.gemm(1.0, &ws.feta_v, &feta_t, 0.0);
                if nunm > 0 {
                    let fxi_t = ws.fetaxi.columns(nmea, nunm).transpose();
                    ws.s.gemm(1.0, &ws.fetaxi.columns(nmea, nunm), &fxi_t, 1.0);
                }
            }

            match self.ws.s.clone().lu().try_inverse() {
                Some(inv) => self.ws.sinv.copy_from(&inv),
                None => {
                    log::warn!(
                        "reduced constraint-space system is singular at iteration {}",
                        self.iterations
                    );
                    self.code = ErrorCode::SingularReducedSystem;
                    calcerr = false;
                    break;
                }
            }

            // multiplier pre-term lambda = Sinv r; corrected below once the
            // unmeasured shift is known
            {
                let ws = &mut self.ws;
                ws.lambda.gemv(1.0, &ws.sinv, &ws.r, 0.0);
            }

            if nunm > 0 {
                {
                    let ws = &mut self.ws;
                    let fxi = ws.fetaxi.columns(nmea, nunm);
                    ws.sinv_fxi.gemm(1.0, &ws.sinv, &fxi, 0.0);
                    let fxi_t = fxi.transpose();
                    ws.w1.gemm(1.0, &fxi_t, &ws.sinv_fxi, 0.0);
                    // solve W1 dxi = -alph Fxi^T lambda
                    ws.dxi.gemv_tr(-alph, &fxi, &ws.lambda, 0.0);
                }
                match Cholesky::new(self.ws.w1.clone()) {
                    Some(chol) => chol.solve_mut(&mut self.ws.dxi),
                    None => {
                        log::warn!(
                            "unmeasured-parameter system is singular at iteration {}",
                            self.iterations
                        );
                        self.code = ErrorCode::SingularUnmeasuredSystem;
                        calcerr = false;
                        break;
                    }
                }

                {
                    let ws = &mut self.ws;
                    let mut xi = ws.etaxi.rows_mut(nmea, nunm);
                    xi += &ws.dxi;
                    // multiplier correction lambda += Sinv Fxi dxi
                    ws.fxi_dxi
                        .gemv(1.0, &ws.fetaxi.columns(nmea, nunm), &ws.dxi, 0.0);
                    ws.lambda.gemv(1.0, &ws.sinv, &ws.fxi_dxi, 1.0);
                }
            }

            // measured update eta = y - Vetaeta Feta^T lambda
            {
                let ws = &mut self.ws;
                ws.feta_t_lambda
                    .gemv_tr(1.0, &ws.fetaxi.columns(0, nmea), &ws.lambda, 0.0);
                let mut eta = ws.etaxi.rows_mut(0, nmea);
                eta.copy_from(&ws.y);
                eta.gemv(-1.0, &ws.v.view((0, 0), (nmea, nmea)), &ws.feta_t_lambda, 1.0);
            }

            // push the new point into the objects, then re-linearize there
            updatesuccess = self.update_fit_objects();
            self.fill_jacobian();

            {
                let ws = &mut self.ws;
                ws.y_eta.copy_from(&ws.y);
                ws.y_eta -= &ws.etaxi.rows(0, nmea);
            }
            if !vinv_ok {
                // the singular covariance finally bites: no chi-square exists
                self.code = ErrorCode::SingularReducedSystem;
                calcerr = false;
                break;
            }
            {
                let ws = &mut self.ws;
                ws.vinv_y_eta.gemv(1.0, &ws.vinv, &ws.y_eta, 0.0);
                chit = ws.y_eta.dot(&ws.vinv_y_eta);
            }
            chik = 0.0;
            for (k, constraint) in self.constraints.iter().enumerate() {
                chik += (2.0 * self.ws.lambda[k] * constraint.value(&self.objects)).abs();
            }
            chinew = chit + chik;

            self.iterations += 1;

            let sconv1 = (chik - chik0).abs() < opts.chik_tol
                && (chit - chit0).abs() < opts.chit_rel_tol * chit
                && chik < opts.chik_to_chit_max * chit;

            // exact criterion: constraints fulfilled and parameters
            // stationary since the snapshot
            let mut sconv2 = true;
            for k in 0..ncon {
                if self.ws.f[k].abs() >= opts.exact_tol {
                    sconv2 = false;
                    break;
                }
            }
            if sconv2 {
                for j in 0..npar {
                    if (self.ws.etaxi[j] - self.ws.etasv[j]).abs() >= opts.exact_tol {
                        sconv2 = false;
                        break;
                    }
                }
            }
            let sconv = sconv1 || sconv2;

            let sbad = chik > opts.chik_growth_max * chik0
                && chik > opts.chik_to_chit_max * chit
                && chik > chik0 + 1e-10;

            scut = false;

            if self.iterations > opts.max_iterations {
                repeat = false;
                self.code = ErrorCode::IterationLimit;
            } else if sconv && updatesuccess {
                repeat = false;
                self.code = ErrorCode::Converged;
            } else if self.iterations > 2 && chinew > opts.chi2_runaway && updatesuccess {
                repeat = false;
                calcerr = false;
                self.code = ErrorCode::ChiSquareRunaway;
            } else if (sbad && self.iterations > 1) || !updatesuccess {
                if alph == opts.step_floor {
                    repeat = false;
                    calcerr = false;
                    self.code = ErrorCode::StepFloorReached;
                } else {
                    alph = opts.step_floor.max(0.5 * alph);
                    scut = true;
                    self.code = ErrorCode::StepCut;
                }
            } else {
                alph = (alph + 0.1).min(1.0);
                self.code = ErrorCode::Stepping;
            }

            self.step_size = alph;
            self.chi2 = chinew;

            if let Some(t) = tracer.as_mut() {
                t.step(self);
            }
        }

        self.ws.vnew.fill(0.0);
        if calcerr {
            self.propagate_errors()?;
        }

        let dof = self.dof();
        self.chi2 = chinew;
        self.probability = if dof > 0 {
            chi_squared_prob(chinew, dof as u32)
        } else {
            0.5
        };

        if let Some(t) = tracer.as_mut() {
            t.finish(self);
        }
        Ok(self.probability)
    }

    /// Assign global indices (measured block first) and size the workspace.
    ///
    /// Index assignment and workspace allocation belong together: both are
    /// derived from the same scan of the objects and a mismatch between them
    /// would corrupt every later matrix access.
    fn initialize(&mut self) -> Result<(), FitError> {
        self.cov_valid = false;

        let mut iglobal = 0;
        for obj in &mut self.objects {
            for ilocal in 0..obj.num_params() {
                if obj.is_measured(ilocal) && !obj.is_fixed(ilocal) {
                    obj.assign_global_index(ilocal, iglobal);
                    iglobal += 1;
                }
            }
        }
        let nmea = iglobal;

        for obj in &mut self.objects {
            for ilocal in 0..obj.num_params() {
                if !obj.is_measured(ilocal) && !obj.is_fixed(ilocal) {
                    obj.assign_global_index(ilocal, iglobal);
                    iglobal += 1;
                }
            }
        }
        let npar = iglobal;
        let nunm = npar - nmea;
        let ncon = self.constraints.len();

        if npar > NPAR_MAX {
            return Err(FitError::TooManyParameters {
                npar,
                max: NPAR_MAX,
            });
        }
        if nunm > NUNM_MAX {
            return Err(FitError::TooManyUnmeasured {
                nunm,
                max: NUNM_MAX,
            });
        }
        if ncon > NCON_MAX {
            return Err(FitError::TooManyConstraints {
                ncon,
                max: NCON_MAX,
            });
        }

        let dims = Dimensions {
            npar,
            nmea,
            nunm,
            ncon,
        };
        self.ws.ensure(dims);
        log::debug!(
            "fit setup: {} measured + {} unmeasured parameters, {} constraints",
            nmea,
            nunm,
            ncon
        );
        Ok(())
    }

    /// Load the current parameter values and the measured values from the
    /// objects into the workspace.
    fn gather_parameters(&mut self) {
        let ws = &mut self.ws;
        for obj in &self.objects {
            for ilocal in 0..obj.num_params() {
                if obj.is_fixed(ilocal) {
                    continue;
                }
                let Some(iglobal) = obj.global_index(ilocal) else {
                    continue;
                };
                ws.etaxi[iglobal] = obj.param(ilocal);
                if obj.is_measured(ilocal) {
                    ws.y[iglobal] = obj.measured_value(ilocal);
                }
            }
        }
    }

    /// Evaluate all constraint gradients at the current point.
    fn fill_jacobian(&mut self) {
        let ws = &mut self.ws;
        ws.fetaxi.fill(0.0);
        for (k, constraint) in self.constraints.iter().enumerate() {
            ws.grad_row.fill(0.0);
            constraint.gradient(&self.objects, &mut ws.grad_row);
            for (j, g) in ws.grad_row.iter().enumerate() {
                ws.fetaxi[(k, j)] = *g;
            }
        }
    }

    /// Push the global parameter vector into every object; `false` when any
    /// object rejects its values as unphysical.
    fn update_fit_objects(&mut self) -> bool {
        let mut ok = true;
        let global = self.ws.etaxi.as_slice();
        for obj in &mut self.objects {
            ok &= obj.update_params(global);
        }
        ok
    }

    /// Propagate the measurement covariance into the fitted-parameter
    /// covariance at the converged point and write it back.
    fn propagate_errors(&mut self) -> Result<(), FitError> {
        let Dimensions { nmea, nunm, .. } = self.ws.dims;

        {
            let ws = &mut self.ws;
            // S at the converged point, built exactly as in the loop
            ws.feta_v
                .gemm(1.0, &ws.fetaxi.columns(0, nmea), &ws.v.view((0, 0), (nmea, nmea)), 0.0);
            let feta_t = ws.fetaxi.columns(0, nmea).transpose();
            ws.s.gemm(1.0, &ws.feta_v, &feta_t, 0.0);
            if nunm > 0 {
                let fxi_t = ws.fetaxi.columns(nmea, nunm).transpose();
                ws.s.gemm(1.0, &ws.fetaxi.columns(nmea, nunm), &fxi_t, 1.0);
            }
        }

        match self.ws.s.clone().lu().try_inverse() {
            Some(inv) => self.ws.sinv.copy_from(&inv),
            None => {
                log::warn!("reduced constraint-space system is singular during error propagation");
                self.code = ErrorCode::SingularErrorPropagation;
                return Err(FitError::SingularErrorPropagation);
            }
        }

        {
            let ws = &mut self.ws;
            // G = Feta^T Sinv Feta
            ws.sinv_feta
                .gemm(1.0, &ws.sinv, &ws.fetaxi.columns(0, nmea), 0.0);
            let feta_t = ws.fetaxi.columns(0, nmea).transpose();
            ws.g.gemm(1.0, &feta_t, &ws.sinv_feta, 0.0);
        }

        if nunm > 0 {
            {
                let ws = &mut self.ws;
                let fxi = ws.fetaxi.columns(nmea, nunm);
                ws.sinv_fxi.gemm(1.0, &ws.sinv, &fxi, 0.0);
                // H = Feta^T Sinv Fxi
                let feta_t = ws.fetaxi.columns(0, nmea).transpose();
                ws.h.gemm(1.0, &feta_t, &ws.sinv_fxi, 0.0);
                // the unmeasured block of the output is (Fxi^T Sinv Fxi)^-1
                let fxi_t = fxi.transpose();
                ws.w1.gemm(1.0, &fxi_t, &ws.sinv_fxi, 0.0);
            }
            let u = match self.ws.w1.clone().lu().try_inverse() {
                Some(u) => u,
                None => {
                    log::warn!("unmeasured covariance block is singular during error propagation");
                    return Err(FitError::SingularUnmeasuredBlock);
                }
            };
            {
                let ws = &mut self.ws;
                ws.vnew.view_mut((nmea, nmea), (nunm, nunm)).copy_from(&u);
                ws.hu.gemm(1.0, &ws.h, &u, 0.0);
                // measured-unmeasured cross block -Vetaeta H U, mirrored
                let mut cross = ws.vnew.view_mut((0, nmea), (nmea, nunm));
                cross.gemm(-1.0, &ws.v.view((0, 0), (nmea, nmea)), &ws.hu, 0.0);
            }
            {
                let ws = &mut self.ws;
                let cross_t = ws.vnew.view((0, nmea), (nmea, nunm)).transpose();
                ws.vnew.view_mut((nmea, 0), (nunm, nmea)).copy_from(&cross_t);
                // G <- G - H U H^T
                let h_t = ws.h.transpose();
                ws.g.gemm(-1.0, &ws.hu, &h_t, 1.0);
            }
        }

        {
            let ws = &mut self.ws;
            ws.igv.fill_with_identity();
            ws.igv
                .gemm(-1.0, &ws.g, &ws.v.view((0, 0), (nmea, nmea)), 1.0);
            let mut top_left = ws.vnew.view_mut((0, 0), (nmea, nmea));
            top_left.gemm(1.0, &ws.v.view((0, 0), (nmea, nmea)), &ws.igv, 0.0);
        }

        // write the fitted covariance back into the objects
        for obj in &mut self.objects {
            let n = obj.num_params();
            for ilocal in 0..n {
                let Some(ig) = obj.global_index(ilocal) else {
                    continue;
                };
                for jlocal in ilocal..n {
                    let Some(jg) = obj.global_index(jlocal) else {
                        continue;
                    };
                    obj.set_fitted_cov(ilocal, jlocal, self.ws.vnew[(ig, jg)]);
                }
            }
        }

        // and keep a flat row-major copy
        let dim = nmea + nunm;
        self.cov_dim = dim;
        self.cov.resize(dim * dim, 0.0);
        for i in 0..dim {
            for j in 0..dim {
                self.cov[i * dim + j] = self.ws.vnew[(i, j)];
            }
        }
        self.cov_valid = true;
        Ok(())
    }
}

impl Default for KinematicFitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    use super::*;
    use crate::constraints::{LinearConstraint, LinearTerm};
    use crate::objects::VectorFitObject;
    use crate::trace::HistoryTracer;

    fn fitter_with(objects: Vec<VectorFitObject>, constraints: Vec<Box<dyn Constraint>>) -> KinematicFitter {
        let mut fitter = KinematicFitter::new();
        for obj in objects {
            fitter.add_object(Box::new(obj));
        }
        for c in constraints {
            fitter.add_constraint(c);
        }
        fitter
    }

    #[test]
    fn no_constraints_converge_immediately() {
        let mut fitter = fitter_with(
            vec![VectorFitObject::measured("p", &[10.0], &[1.0])],
            vec![],
        );
        let prob = fitter.fit().unwrap();
        assert_eq!(fitter.error_code(), ErrorCode::Converged);
        assert_eq!(fitter.iterations(), 1);
        assert_relative_eq!(fitter.chi2(), 0.0);
        assert_relative_eq!(fitter.objects()[0].param(0), 10.0);
        // no degrees of freedom
        assert_relative_eq!(prob, 0.5);
    }

    #[test]
    fn one_linear_constraint_projects_onto_the_surface() {
        // 2 x = 30 with x measured as 10 +- 1: fitted x = 15, chi2 = 25
        let mut fitter = fitter_with(
            vec![VectorFitObject::measured("p", &[10.0], &[1.0])],
            vec![Box::new(LinearConstraint::new(
                "2x",
                vec![LinearTerm::new(0, 0, 2.0)],
                30.0,
            ))],
        );
        fitter.fit().unwrap();
        assert_eq!(fitter.error_code(), ErrorCode::Converged);
        assert_relative_eq!(fitter.objects()[0].param(0), 15.0, epsilon = 1e-9);
        assert_relative_eq!(fitter.chi2(), 25.0, epsilon = 1e-9);
    }

    #[test]
    fn two_measurements_share_a_sum_constraint() {
        // x1 = 10 +- 1, x2 = 5 +- 1, x1 + x2 = 20.
        // Stationarity: x1 = y1 + mu, x2 = y2 + mu with mu = 2.5, so the
        // closed-form solution is (12.5, 7.5) and chi2 = 2.5^2 + 2.5^2.
        let mut fitter = fitter_with(
            vec![
                VectorFitObject::measured("a", &[10.0], &[1.0]),
                VectorFitObject::measured("b", &[5.0], &[1.0]),
            ],
            vec![Box::new(LinearConstraint::sum_of(
                "total",
                &[(0, 0), (1, 0)],
                20.0,
            ))],
        );
        let prob = fitter.fit().unwrap();
        assert_eq!(fitter.error_code(), ErrorCode::Converged);
        assert_relative_eq!(fitter.objects()[0].param(0), 12.5, epsilon = 1e-9);
        assert_relative_eq!(fitter.objects()[1].param(0), 7.5, epsilon = 1e-9);
        assert_relative_eq!(fitter.chi2(), 12.5, epsilon = 1e-9);
        assert_eq!(fitter.dof(), 1);
        assert!(prob > 0.0 && prob < 1.0);

        // fitted covariance: Var = 0.5 on the diagonal, -0.5 across
        let cov = fitter.covariance().unwrap();
        assert_eq!(fitter.covariance_dim(), 2);
        assert_relative_eq!(cov[0], 0.5, epsilon = 1e-9);
        assert_relative_eq!(cov[1], -0.5, epsilon = 1e-9);
        assert_relative_eq!(cov[2], -0.5, epsilon = 1e-9);
        assert_relative_eq!(cov[3], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn refitting_a_converged_state_is_idempotent() {
        let mut fitter = fitter_with(
            vec![
                VectorFitObject::measured("a", &[10.0], &[1.0]),
                VectorFitObject::measured("b", &[5.0], &[1.0]),
            ],
            vec![Box::new(LinearConstraint::sum_of(
                "total",
                &[(0, 0), (1, 0)],
                20.0,
            ))],
        );
        fitter.fit().unwrap();
        let chi2_first = fitter.chi2();

        fitter.fit().unwrap();
        assert_eq!(fitter.error_code(), ErrorCode::Converged);
        assert_eq!(fitter.iterations(), 1);
        assert_relative_eq!(fitter.chi2(), chi2_first, epsilon = 1e-9);
    }

    #[test]
    fn unmeasured_parameter_is_determined_by_the_constraints() {
        // x1 + z = 12 and x2 - z = 3 with x1 = 10 +- 1 and x2 = 5 +- 1:
        // both are satisfied exactly by z = 2 without moving x1, x2.
        let mut fitter = fitter_with(
            vec![
                VectorFitObject::measured("a", &[10.0], &[1.0]),
                VectorFitObject::measured("b", &[5.0], &[1.0]),
                VectorFitObject::unmeasured("z", &[0.0]),
            ],
            vec![
                Box::new(LinearConstraint::new(
                    "c1",
                    vec![LinearTerm::new(0, 0, 1.0), LinearTerm::new(2, 0, 1.0)],
                    12.0,
                )),
                Box::new(LinearConstraint::new(
                    "c2",
                    vec![LinearTerm::new(1, 0, 1.0), LinearTerm::new(2, 0, -1.0)],
                    3.0,
                )),
            ],
        );
        fitter.fit().unwrap();
        assert_eq!(fitter.error_code(), ErrorCode::Converged);
        assert_eq!(fitter.num_unmeasured(), 1);
        assert_eq!(fitter.dof(), 1);
        assert_relative_eq!(fitter.objects()[0].param(0), 10.0, epsilon = 1e-9);
        assert_relative_eq!(fitter.objects()[1].param(0), 5.0, epsilon = 1e-9);
        assert_relative_eq!(fitter.objects()[2].param(0), 2.0, epsilon = 1e-9);
        assert_relative_eq!(fitter.chi2(), 0.0, epsilon = 1e-9);

        // covariance blocks of the propagation with the regularized reduced
        // system: measured block [[0.5, -0.5], [-0.5, 0.5]], cross -/+ 0.5
        let cov = fitter.covariance().unwrap();
        let dim = fitter.covariance_dim();
        assert_eq!(dim, 3);
        assert_relative_eq!(cov[0], 0.5, epsilon = 1e-9);
        assert_relative_eq!(cov[1], -0.5, epsilon = 1e-9);
        assert_relative_eq!(cov[2], -0.5, epsilon = 1e-9);
        assert_relative_eq!(cov[1 * dim + 2], 0.5, epsilon = 1e-9);
        // unmeasured block: inverse of Fxi^T Sinv Fxi = inverse of 2/3
        assert_relative_eq!(cov[2 * dim + 2], 1.5, epsilon = 1e-9);
        // symmetry of the full matrix
        for i in 0..dim {
            for j in 0..dim {
                assert_relative_eq!(cov[i * dim + j], cov[j * dim + i], epsilon = 1e-9);
            }
        }
    }

    /// Circle constraint x^2 + y^2 = r^2; with equal variances the fit is the
    /// radial projection of the measurement.
    struct CircleConstraint {
        object: usize,
        radius2: f64,
    }

    impl Constraint for CircleConstraint {
        fn name(&self) -> &str {
            "circle"
        }

        fn value(&self, objects: &[Box<dyn FitObject>]) -> f64 {
            let x = objects[self.object].param(0);
            let y = objects[self.object].param(1);
            x * x + y * y - self.radius2
        }

        fn gradient(&self, objects: &[Box<dyn FitObject>], grad: &mut [f64]) {
            let obj = &objects[self.object];
            if let Some(ix) = obj.global_index(0) {
                grad[ix] = 2.0 * obj.param(0);
            }
            if let Some(iy) = obj.global_index(1) {
                grad[iy] = 2.0 * obj.param(1);
            }
        }
    }

    #[test]
    fn nonlinear_constraint_projects_radially() {
        let mut fitter = fitter_with(
            vec![VectorFitObject::measured("p", &[3.2, 3.9], &[1.0, 1.0])],
            vec![Box::new(CircleConstraint {
                object: 0,
                radius2: 25.0,
            })],
        );
        fitter.fit().unwrap();
        assert_eq!(fitter.error_code(), ErrorCode::Converged);

        let x = fitter.objects()[0].param(0);
        let y = fitter.objects()[0].param(1);
        assert_relative_eq!(x * x + y * y, 25.0, epsilon = 1e-6);

        let len = (3.2f64 * 3.2 + 3.9 * 3.9).sqrt();
        assert_relative_eq!(x, 3.2 * 5.0 / len, epsilon = 1e-4);
        assert_relative_eq!(y, 3.9 * 5.0 / len, epsilon = 1e-4);
        assert_relative_eq!(fitter.chi2(), (len - 5.0) * (len - 5.0), epsilon = 1e-5);

        // output covariance stays symmetric for a well-conditioned system
        let cov = fitter.covariance().unwrap();
        let dim = fitter.covariance_dim();
        for i in 0..dim {
            for j in 0..dim {
                assert_relative_eq!(cov[i * dim + j], cov[j * dim + i], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn singular_covariance_is_reported_not_silently_wrong() {
        // zero variance makes the reduced system singular
        let mut fitter = fitter_with(
            vec![VectorFitObject::measured("p", &[10.0], &[0.0])],
            vec![Box::new(LinearConstraint::new(
                "2x",
                vec![LinearTerm::new(0, 0, 2.0)],
                30.0,
            ))],
        );
        fitter.fit().unwrap();
        assert_eq!(fitter.error_code(), ErrorCode::SingularReducedSystem);
        assert!(fitter.covariance().is_none());
    }

    /// A constraint whose reported gradient is so steep that the iteration
    /// can never satisfy it nor reject a step: the fit has to run into the
    /// iteration cap.
    struct StiffConstraint;

    impl Constraint for StiffConstraint {
        fn name(&self) -> &str {
            "stiff"
        }

        fn value(&self, _objects: &[Box<dyn FitObject>]) -> f64 {
            0.1
        }

        fn gradient(&self, objects: &[Box<dyn FitObject>], grad: &mut [f64]) {
            if let Some(ix) = objects[0].global_index(0) {
                grad[ix] = 1e9;
            }
        }
    }

    #[test]
    fn iteration_cap_returns_the_limit_code() {
        let mut fitter = fitter_with(
            vec![VectorFitObject::measured("p", &[0.0], &[1.0])],
            vec![Box::new(StiffConstraint)],
        );
        fitter.fit().unwrap();
        assert_eq!(fitter.error_code(), ErrorCode::IterationLimit);
        assert_eq!(fitter.iterations(), fitter.options().max_iterations + 1);
    }

    /// Cubic with the classic Newton two-cycle between 0 and 1: every
    /// re-growth of the constraint penalty rejects the step.
    struct CyclingCubic;

    impl Constraint for CyclingCubic {
        fn name(&self) -> &str {
            "cubic"
        }

        fn value(&self, objects: &[Box<dyn FitObject>]) -> f64 {
            let x = objects[0].param(0);
            x * x * x - 2.0 * x + 2.0
        }

        fn gradient(&self, objects: &[Box<dyn FitObject>], grad: &mut [f64]) {
            let obj = &objects[0];
            if let Some(ix) = obj.global_index(0) {
                let x = obj.param(0);
                grad[ix] = 3.0 * x * x - 2.0;
            }
        }
    }

    #[test]
    fn rejected_steps_shrink_the_damping_factor_to_its_floor() {
        let mut fitter = fitter_with(
            vec![VectorFitObject::measured("p", &[0.0], &[1.0])],
            vec![Box::new(CyclingCubic)],
        );
        let tracer = HistoryTracer::new();
        fitter.set_tracer(Box::new(tracer.clone()));
        fitter.fit().unwrap();
        let records = tracer.records();

        // every rejected step must carry a strictly smaller damping factor
        let mut cuts = 0;
        for pair in records.windows(2) {
            if pair[1].error_code == ErrorCode::StepCut {
                assert!(pair[1].step_size < pair[0].step_size);
                cuts += 1;
            }
        }
        assert!(cuts > 0, "expected at least one rejected step");

        // the two-cycle ends at the damping floor, without error propagation
        assert_eq!(fitter.error_code(), ErrorCode::StepFloorReached);
        assert_relative_eq!(fitter.step_size(), fitter.options().step_floor);
        assert!(fitter.covariance().is_none());
    }

    #[test]
    fn measured_parameters_come_first_in_the_global_ordering() {
        let mut first = VectorFitObject::measured("a", &[1.0, 2.0], &[1.0, 1.0]);
        first.fix_param(0);
        let mut fitter = fitter_with(
            vec![
                first,
                VectorFitObject::unmeasured("z", &[0.5]),
                VectorFitObject::measured("b", &[3.0], &[1.0]),
            ],
            vec![Box::new(LinearConstraint::new(
                "tie",
                vec![LinearTerm::new(1, 0, 1.0), LinearTerm::new(2, 0, -1.0)],
                0.0,
            ))],
        );
        fitter.fit().unwrap();

        assert_eq!(fitter.num_measured(), 2);
        assert_eq!(fitter.num_unmeasured(), 1);
        // fixed parameter keeps no index; measured block fills 0..nmea
        assert_eq!(fitter.objects()[0].global_index(0), None);
        assert_eq!(fitter.objects()[0].global_index(1), Some(0));
        assert_eq!(fitter.objects()[2].global_index(0), Some(1));
        assert_eq!(fitter.objects()[1].global_index(0), Some(2));
    }

    #[test]
    fn capacity_bounds_are_enforced() {
        let mut fitter = fitter_with(
            vec![VectorFitObject::measured("p", &[0.0], &[1.0])],
            vec![],
        );
        for _ in 0..(NCON_MAX + 1) {
            fitter.add_constraint(Box::new(LinearConstraint::new(
                "c",
                vec![LinearTerm::new(0, 0, 1.0)],
                0.0,
            )));
        }
        match fitter.fit() {
            Err(FitError::TooManyConstraints { ncon, max }) => {
                assert_eq!(ncon, NCON_MAX + 1);
                assert_eq!(max, NCON_MAX);
            }
            other => panic!("expected a capacity error, got {other:?}"),
        }
    }

    #[test]
    fn smeared_measurements_satisfy_the_constraint_exactly() {
        let truth = [3.0, 4.0, 5.0];
        let total: f64 = truth.iter().sum();
        let sigma = 0.5;

        let mut rng = StdRng::seed_from_u64(42);
        let noise = Normal::new(0.0, sigma).unwrap();
        let smeared: Vec<f64> = truth.iter().map(|t| t + noise.sample(&mut rng)).collect();

        let mut fitter = fitter_with(
            vec![VectorFitObject::measured(
                "p",
                &smeared,
                &[sigma, sigma, sigma],
            )],
            vec![Box::new(LinearConstraint::sum_of(
                "total",
                &[(0, 0), (0, 1), (0, 2)],
                total,
            ))],
        );
        fitter.fit().unwrap();
        assert_eq!(fitter.error_code(), ErrorCode::Converged);

        let sum: f64 = (0..3).map(|i| fitter.objects()[0].param(i)).sum();
        assert_relative_eq!(sum, total, epsilon = 1e-6);
        assert!(fitter.chi2() >= 0.0 && fitter.chi2().is_finite());
        assert!(fitter.covariance().is_some());
    }

    #[test]
    fn report_mirrors_the_accessors() {
        let mut fitter = fitter_with(
            vec![
                VectorFitObject::measured("a", &[10.0], &[1.0]),
                VectorFitObject::measured("b", &[5.0], &[1.0]),
            ],
            vec![Box::new(LinearConstraint::sum_of(
                "total",
                &[(0, 0), (1, 0)],
                20.0,
            ))],
        );
        fitter.fit().unwrap();
        let report = fitter.report();
        assert_eq!(report.error_code, fitter.error_code());
        assert_eq!(report.iterations, fitter.iterations());
        assert_eq!(report.num_measured, 2);
        assert_eq!(report.num_constraints, 1);
        assert_eq!(report.dof, 1);
        assert!(report.cov_valid);
        assert_relative_eq!(report.chi2, fitter.chi2());
        assert_relative_eq!(report.probability, fitter.probability());
    }
}
