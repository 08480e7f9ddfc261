//! Treated aggregate and donor outcomes, extracted from a panel.

use gl_core::{Error, Panel, Result, TreatmentSpec};

/// Outcome matrix seen by the fitters.
///
/// `treated[t - 1]` is the per-time mean over the treated units; donor series
/// are stored donor-major. Times are 1-based throughout.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesMatrix {
    treated: Vec<f64>,
    donors: Vec<usize>,
    donor_values: Vec<f64>,
    n_times: usize,
}

impl SeriesMatrix {
    /// Extract the treated aggregate and donor pool of `spec`.
    pub fn from_panel(panel: &Panel, spec: &TreatmentSpec) -> Result<Self> {
        let donors = spec.donors(panel);
        if donors.is_empty() {
            return Err(Error::InsufficientData("donor pool is empty".into()));
        }
        let n_times = panel.n_times();
        let n_treated = spec.treated().len() as f64;
        let mut treated = vec![0.0; n_times];
        for &l in spec.treated() {
            for (acc, y) in treated.iter_mut().zip(panel.series(l)) {
                *acc += y;
            }
        }
        for v in treated.iter_mut() {
            *v /= n_treated;
        }
        let mut donor_values = Vec::with_capacity(donors.len() * n_times);
        for &d in &donors {
            donor_values.extend_from_slice(panel.series(d));
        }
        Ok(Self { treated, donors, donor_values, n_times })
    }

    /// Build directly from series (used by residualization and tests).
    pub fn from_parts(
        treated: Vec<f64>,
        donors: Vec<usize>,
        donor_series: Vec<Vec<f64>>,
    ) -> Result<Self> {
        let n_times = treated.len();
        if donors.len() != donor_series.len() {
            return Err(Error::Validation("donor ids and series differ in length".into()));
        }
        if donors.is_empty() {
            return Err(Error::InsufficientData("donor pool is empty".into()));
        }
        if donor_series.iter().any(|s| s.len() != n_times) {
            return Err(Error::Validation("donor series length differs from treated".into()));
        }
        let donor_values = donor_series.concat();
        Ok(Self { treated, donors, donor_values, n_times })
    }

    /// Number of time periods.
    pub fn n_times(&self) -> usize {
        self.n_times
    }

    /// Number of donors.
    pub fn n_donors(&self) -> usize {
        self.donors.len()
    }

    /// Donor location indices.
    pub fn donor_ids(&self) -> &[usize] {
        &self.donors
    }

    /// Treated aggregate series.
    pub fn treated(&self) -> &[f64] {
        &self.treated
    }

    /// Treated aggregate at time `t`.
    #[inline]
    pub fn treated_at(&self, t: usize) -> f64 {
        self.treated[t - 1]
    }

    /// Series of donor `j` (position in the pool, not the location index).
    pub fn donor(&self, j: usize) -> &[f64] {
        &self.donor_values[j * self.n_times..(j + 1) * self.n_times]
    }

    /// Donor `j` at time `t`.
    #[inline]
    pub fn donor_at(&self, j: usize, t: usize) -> f64 {
        self.donor_values[j * self.n_times + (t - 1)]
    }
}
