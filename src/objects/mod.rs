//! Fit objects: the entities whose parameters are being fitted.
//!
//! A fit object owns a small local parameter vector. Each parameter is either
//! measured (it has an a priori value and a covariance entry) or unmeasured
//! (determined only by the constraints), and can additionally be fixed
//! (excluded from the fit). The fitter assigns every free parameter a global
//! index and talks to objects exclusively through the [`FitObject`] trait, so
//! domain-specific parameterizations live outside this crate.
//!
//! [`VectorFitObject`] is the general-purpose implementation: a plain
//! parameter vector with flags and a local covariance. It covers simple
//! measurements and test setups; richer parameterizations implement the
//! trait themselves.

use nalgebra::{DMatrix, DVector};

/// Accessor interface between the fitter and one fitted entity.
///
/// Global indices are (re)assigned by the fitter at the start of every fit;
/// implementations only store them. Parameter ordering within an object is
/// stable for the lifetime of the object.
pub trait FitObject {
    /// Identifier used in diagnostics.
    fn name(&self) -> &str;

    /// Number of local parameters (free or not).
    fn num_params(&self) -> usize;

    /// Name of a local parameter, for diagnostics.
    fn param_name(&self, ilocal: usize) -> &str;

    /// Whether the parameter has an associated measurement.
    fn is_measured(&self, ilocal: usize) -> bool;

    /// Whether the parameter is excluded from the fit.
    fn is_fixed(&self, ilocal: usize) -> bool;

    /// Current value of a local parameter.
    fn param(&self, ilocal: usize) -> f64;

    /// The a priori measured value. Only meaningful when
    /// `is_measured(ilocal)` is true.
    fn measured_value(&self, ilocal: usize) -> f64;

    /// Global index assigned to the parameter, if it is free.
    fn global_index(&self, ilocal: usize) -> Option<usize>;

    /// Store the global index for a free parameter.
    fn assign_global_index(&mut self, ilocal: usize, iglobal: usize);

    /// Pull new values for this object's free parameters out of the global
    /// parameter vector.
    ///
    /// Returns `false` when the values are unphysical for this
    /// parameterization (e.g. a negative energy); the fitter then retries
    /// from the last accepted point with a smaller step.
    fn update_params(&mut self, global: &[f64]) -> bool;

    /// Add this object's local measurement covariance into the global
    /// covariance matrix at its assigned global offsets.
    fn add_to_global_cov(&self, cov: &mut DMatrix<f64>);

    /// Receive one entry of the fitted covariance (local indices,
    /// `jlocal >= ilocal`), written back after a successful fit.
    fn set_fitted_cov(&mut self, ilocal: usize, jlocal: usize, value: f64);
}

/// A fit object that is just a vector of parameters.
///
/// Measured parameters carry their measured values and a local covariance
/// (diagonal via [`VectorFitObject::measured`], or full via
/// [`VectorFitObject::with_covariance`]); unmeasured parameters carry only a
/// starting value. Parameters can be fixed after construction.
#[derive(Debug, Clone)]
pub struct VectorFitObject {
    name: String,
    param_names: Vec<String>,
    values: DVector<f64>,
    measured_values: DVector<f64>,
    cov: DMatrix<f64>,
    fitted_cov: DMatrix<f64>,
    measured: Vec<bool>,
    fixed: Vec<bool>,
    global: Vec<Option<usize>>,
}

impl VectorFitObject {
    /// A fully measured object with uncorrelated errors.
    ///
    /// The current values start at the measured values.
    ///
    /// # Panics
    /// Panics if `values` and `sigmas` differ in length.
    pub fn measured(name: impl Into<String>, values: &[f64], sigmas: &[f64]) -> Self {
        assert_eq!(values.len(), sigmas.len());
        let n = values.len();
        let mut cov = DMatrix::zeros(n, n);
        for (i, s) in sigmas.iter().enumerate() {
            cov[(i, i)] = s * s;
        }
        Self::build(name.into(), values, values, cov, vec![true; n])
    }

    /// A fully measured object with a full local covariance matrix.
    ///
    /// # Panics
    /// Panics if `cov` is not square with side `values.len()`.
    pub fn with_covariance(name: impl Into<String>, values: &[f64], cov: DMatrix<f64>) -> Self {
        let n = values.len();
        assert_eq!(cov.nrows(), n);
        assert_eq!(cov.ncols(), n);
        Self::build(name.into(), values, values, cov, vec![true; n])
    }

    /// A fully unmeasured object; `start` seeds the iteration.
    pub fn unmeasured(name: impl Into<String>, start: &[f64]) -> Self {
        let n = start.len();
        Self::build(name.into(), start, start, DMatrix::zeros(n, n), vec![false; n])
    }

    fn build(
        name: String,
        values: &[f64],
        measured_values: &[f64],
        cov: DMatrix<f64>,
        measured: Vec<bool>,
    ) -> Self {
        let n = values.len();
        Self {
            param_names: (0..n).map(|i| format!("{name}.{i}")).collect(),
            name,
            values: DVector::from_row_slice(values),
            measured_values: DVector::from_row_slice(measured_values),
            cov,
            fitted_cov: DMatrix::zeros(n, n),
            measured,
            fixed: vec![false; n],
            global: vec![None; n],
        }
    }

    /// Exclude a parameter from the fit, keeping its current value.
    pub fn fix_param(&mut self, ilocal: usize) {
        self.fixed[ilocal] = true;
        self.global[ilocal] = None;
    }

    /// Override the generated parameter names.
    ///
    /// # Panics
    /// Panics if the number of names does not match the parameter count.
    pub fn set_param_names(&mut self, names: &[&str]) {
        assert_eq!(names.len(), self.values.len());
        self.param_names = names.iter().map(|n| n.to_string()).collect();
    }

    /// Fitted covariance entry written back by the fitter (symmetric).
    pub fn fitted_cov(&self, ilocal: usize, jlocal: usize) -> f64 {
        self.fitted_cov[(ilocal, jlocal)]
    }
}

impl FitObject for VectorFitObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_params(&self) -> usize {
        self.values.len()
    }

    fn param_name(&self, ilocal: usize) -> &str {
        &self.param_names[ilocal]
    }

    fn is_measured(&self, ilocal: usize) -> bool {
        self.measured[ilocal]
    }

    fn is_fixed(&self, ilocal: usize) -> bool {
        self.fixed[ilocal]
    }

    fn param(&self, ilocal: usize) -> f64 {
        self.values[ilocal]
    }

    fn measured_value(&self, ilocal: usize) -> f64 {
        self.measured_values[ilocal]
    }

    fn global_index(&self, ilocal: usize) -> Option<usize> {
        self.global[ilocal]
    }

    fn assign_global_index(&mut self, ilocal: usize, iglobal: usize) {
        self.global[ilocal] = Some(iglobal);
    }

    fn update_params(&mut self, global: &[f64]) -> bool {
        for ilocal in 0..self.values.len() {
            if let Some(iglobal) = self.global[ilocal] {
                self.values[ilocal] = global[iglobal];
            }
        }
        true
    }

    fn add_to_global_cov(&self, cov: &mut DMatrix<f64>) {
        for ilocal in 0..self.values.len() {
            if !self.measured[ilocal] {
                continue;
            }
            let Some(iglobal) = self.global[ilocal] else {
                continue;
            };
            for jlocal in 0..self.values.len() {
                if !self.measured[jlocal] {
                    continue;
                }
                let Some(jglobal) = self.global[jlocal] else {
                    continue;
                };
                cov[(iglobal, jglobal)] += self.cov[(ilocal, jlocal)];
            }
        }
    }

    fn set_fitted_cov(&mut self, ilocal: usize, jlocal: usize, value: f64) {
        self.fitted_cov[(ilocal, jlocal)] = value;
        self.fitted_cov[(jlocal, ilocal)] = value;
    }
}
