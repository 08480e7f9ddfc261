//! Synthetic Control weight fitting.
//!
//! Solves the simplex-constrained least-squares problem
//!
//! ```text
//! min_w  Σ_{t ∈ fit}  (y1_t − Σ_j w_j y_jt)²     s.t.  w_j ≥ 0,  Σ_j w_j = 1
//! ```
//!
//! with FISTA (accelerated projected gradient, Beck & Teboulle 2009) using the
//! exact simplex projection and a fixed step `1/L`, `L = λ_max(XᵀX)`. An
//! adaptive restart (O'Donoghue & Candès 2015) resets the momentum whenever it
//! points uphill. The solver starts from equal weights and is fully
//! deterministic.
//!
//! With fixed effects every series is demeaned by its own mean over the fitting
//! times; the treated mean is added back when predicting.

use gl_core::{Error, Panel, Result, TreatmentSpec, WeightVector};
use nalgebra::{DMatrix, DVector};

use crate::config::EstimatorConfig;
use crate::numeric::{largest_eigenvalue, project_simplex};
use crate::series::SeriesMatrix;

/// Simplex-weight fitter.
#[derive(Debug, Clone)]
pub struct WeightFitter {
    fixed_effects: bool,
    max_iter: usize,
    tol: f64,
}

/// Fitted Synthetic Control.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticControlFit {
    /// Donor weights on the simplex.
    pub weights: WeightVector,
    /// Whether series were demeaned before fitting.
    pub fixed_effects: bool,
    /// Treated mean over the fitting times (0 without fixed effects).
    pub treated_mean: f64,
    /// Donor means over the fitting times (0 without fixed effects).
    pub donor_means: Vec<f64>,
    /// Iterations used.
    pub n_iter: usize,
    /// Whether the tolerance was reached before the iteration cap.
    pub converged: bool,
}

impl SyntheticControlFit {
    /// Counterfactual prediction at time `t`.
    pub fn predict(&self, data: &SeriesMatrix, t: usize) -> f64 {
        let combo: f64 = self
            .weights
            .weights
            .iter()
            .zip(&self.donor_means)
            .enumerate()
            .map(|(j, (&w, &m))| w * (data.donor_at(j, t) - m))
            .sum();
        self.treated_mean + combo
    }

    /// Equal-weight baseline under the same demeaning.
    pub fn equal_weight(data: &SeriesMatrix, times: &[usize], fixed_effects: bool) -> Self {
        let (treated_mean, donor_means) = fit_means(data, times, fixed_effects);
        Self {
            weights: WeightVector::uniform(data.donor_ids().to_vec()),
            fixed_effects,
            treated_mean,
            donor_means,
            n_iter: 0,
            converged: true,
        }
    }
}

impl WeightFitter {
    /// Create a fitter.
    pub fn new(fixed_effects: bool) -> Self {
        let defaults = EstimatorConfig::default();
        Self { fixed_effects, max_iter: defaults.max_iter, tol: defaults.tol }
    }

    /// Create a fitter from estimator settings.
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self { fixed_effects: config.fixed_effects, max_iter: config.max_iter, tol: config.tol }
    }

    /// Set solver limits.
    pub fn with_limits(mut self, max_iter: usize, tol: f64) -> Self {
        self.max_iter = max_iter;
        self.tol = tol;
        self
    }

    /// Fit weights for `spec` over its pre-period.
    pub fn fit_panel(&self, panel: &Panel, spec: &TreatmentSpec) -> Result<SyntheticControlFit> {
        let data = SeriesMatrix::from_panel(panel, spec)?;
        self.fit(&data, &spec.pre_times())
    }

    /// Fit weights using only `times` (1-based, each `<= data.n_times()`).
    pub fn fit(&self, data: &SeriesMatrix, times: &[usize]) -> Result<SyntheticControlFit> {
        let j = data.n_donors();
        if j == 0 {
            return Err(Error::InsufficientData("donor pool is empty".into()));
        }
        if times.len() < j + 1 {
            return Err(Error::InsufficientData(format!(
                "{} fitting periods for {} donors; need at least {}",
                times.len(),
                j,
                j + 1
            )));
        }

        let (treated_mean, donor_means) = fit_means(data, times, self.fixed_effects);
        let x =
            DMatrix::from_fn(times.len(), j, |r, c| data.donor_at(c, times[r]) - donor_means[c]);
        let y = DVector::from_iterator(
            times.len(),
            times.iter().map(|&t| data.treated_at(t) - treated_mean),
        );
        let gram = x.transpose() * &x;
        let xty = x.transpose() * &y;

        let (w, n_iter, converged) = self.solve(&gram, &xty);
        log::debug!(
            "weight fit: {j} donors, {} periods, {n_iter} iterations, converged={converged}",
            times.len()
        );

        Ok(SyntheticControlFit {
            weights: WeightVector::new(data.donor_ids().to_vec(), w)?,
            fixed_effects: self.fixed_effects,
            treated_mean,
            donor_means,
            n_iter,
            converged,
        })
    }

    fn solve(&self, gram: &DMatrix<f64>, xty: &DVector<f64>) -> (Vec<f64>, usize, bool) {
        let j = gram.nrows();
        let mut w = vec![1.0 / j as f64; j];
        let lip = largest_eigenvalue(gram);
        if j == 1 || !(lip > 0.0 && lip.is_finite()) {
            return (w, 0, true);
        }
        let step = 1.0 / lip;

        let mut z = w.clone();
        let mut momentum = 1.0_f64;
        for iter in 1..=self.max_iter {
            let zv = DVector::from_column_slice(&z);
            let grad = gram * &zv - xty;
            let mut w_next: Vec<f64> =
                z.iter().zip(grad.iter()).map(|(zi, gi)| zi - step * gi).collect();
            project_simplex(&mut w_next);

            let delta = w_next.iter().zip(&w).map(|(a, b)| (a - b).abs()).fold(0.0_f64, f64::max);
            if delta < self.tol {
                return (w_next, iter, true);
            }

            // Restart when the momentum direction disagrees with the projected step.
            let uphill: f64 =
                z.iter().zip(&w_next).zip(&w).map(|((zi, wn), wo)| (zi - wn) * (wn - wo)).sum();
            if uphill > 0.0 {
                momentum = 1.0;
                z.clone_from(&w_next);
            } else {
                let next = 0.5 * (1.0 + (1.0 + 4.0 * momentum * momentum).sqrt());
                let beta = (momentum - 1.0) / next;
                for ((zi, wn), wo) in z.iter_mut().zip(&w_next).zip(&w) {
                    *zi = wn + beta * (wn - wo);
                }
                momentum = next;
            }
            w = w_next;
        }
        (w, self.max_iter, false)
    }
}

fn fit_means(data: &SeriesMatrix, times: &[usize], fixed_effects: bool) -> (f64, Vec<f64>) {
    if !fixed_effects || times.is_empty() {
        return (0.0, vec![0.0; data.n_donors()]);
    }
    let n = times.len() as f64;
    let treated = times.iter().map(|&t| data.treated_at(t)).sum::<f64>() / n;
    let donors = (0..data.n_donors())
        .map(|j| times.iter().map(|&t| data.donor_at(j, t)).sum::<f64>() / n)
        .collect();
    (treated, donors)
}
