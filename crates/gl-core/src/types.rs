//! Treatment definitions and fitted weights.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Panel, Result};

/// Which locations are treated, and when.
///
/// The pre-period is `[1, start - 1]`, the test period `[start, end]`.
/// Excluded locations are never used as donors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreatmentSpec {
    treated: Vec<usize>,
    excluded: Vec<usize>,
    start: usize,
    end: usize,
}

impl TreatmentSpec {
    /// Create a treatment spec from location identifiers.
    pub fn new<S: AsRef<str>>(
        panel: &Panel,
        treated: &[S],
        start: usize,
        end: usize,
    ) -> Result<Self> {
        let idx = resolve(panel, treated)?;
        Self::from_indices(panel, idx, start, end)
    }

    /// Create a treatment spec from location indices.
    pub fn from_indices(
        panel: &Panel,
        treated: Vec<usize>,
        start: usize,
        end: usize,
    ) -> Result<Self> {
        let treated: BTreeSet<usize> = treated.into_iter().collect();
        if treated.is_empty() {
            return Err(Error::Validation("treated location set must be non-empty".into()));
        }
        if let Some(&bad) = treated.iter().find(|&&l| l >= panel.n_locations()) {
            return Err(Error::Validation(format!("treated location index {bad} out of range")));
        }
        if start == 0 || start > end || end > panel.n_times() {
            return Err(Error::Validation(format!(
                "treatment window [{start}, {end}] must satisfy 1 <= start <= end <= {}",
                panel.n_times()
            )));
        }
        if start == 1 {
            return Err(Error::InsufficientData(format!(
                "treatment window [1, {end}] leaves no pre-period"
            )));
        }
        Ok(Self { treated: treated.into_iter().collect(), excluded: Vec::new(), start, end })
    }

    /// Exclude locations from the donor pool.
    pub fn with_excluded<S: AsRef<str>>(mut self, panel: &Panel, excluded: &[S]) -> Result<Self> {
        let idx = resolve(panel, excluded)?;
        self.excluded = idx.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        Ok(self)
    }

    /// Exclude locations (by index) from the donor pool.
    pub fn with_excluded_indices(mut self, excluded: impl IntoIterator<Item = usize>) -> Self {
        self.excluded = excluded.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        self
    }

    /// Treated location indices (sorted, unique).
    pub fn treated(&self) -> &[usize] {
        &self.treated
    }

    /// Excluded location indices (sorted, unique).
    pub fn excluded(&self) -> &[usize] {
        &self.excluded
    }

    /// First treated time.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Last treated time.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Last pre-period time.
    pub fn pre_end(&self) -> usize {
        self.start - 1
    }

    /// Pre-period times `1..start`.
    pub fn pre_times(&self) -> Vec<usize> {
        (1..self.start).collect()
    }

    /// Test-period length.
    pub fn duration(&self) -> usize {
        self.end - self.start + 1
    }

    /// Donor pool: every location that is neither treated nor excluded.
    pub fn donors(&self, panel: &Panel) -> Vec<usize> {
        (0..panel.n_locations())
            .filter(|l| self.treated.binary_search(l).is_err())
            .filter(|l| self.excluded.binary_search(l).is_err())
            .collect()
    }
}

fn resolve<S: AsRef<str>>(panel: &Panel, ids: &[S]) -> Result<Vec<usize>> {
    ids.iter()
        .map(|id| {
            let id = id.as_ref();
            panel
                .location_index(id)
                .ok_or_else(|| Error::Validation(format!("unknown location '{id}'")))
        })
        .collect()
}

/// Donor weights produced by the weight fitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    /// Donor location indices.
    pub donors: Vec<usize>,
    /// Weight per donor (same order as `donors`).
    pub weights: Vec<f64>,
}

impl WeightVector {
    /// Pair donors with weights.
    pub fn new(donors: Vec<usize>, weights: Vec<f64>) -> Result<Self> {
        if donors.len() != weights.len() {
            return Err(Error::Validation(format!(
                "{} donors but {} weights",
                donors.len(),
                weights.len()
            )));
        }
        Ok(Self { donors, weights })
    }

    /// Equal weights over the donor pool.
    pub fn uniform(donors: Vec<usize>) -> Self {
        let w = 1.0 / donors.len().max(1) as f64;
        let weights = vec![w; donors.len()];
        Self { donors, weights }
    }

    /// Weight of a donor location (0 when absent).
    pub fn weight_of(&self, loc: usize) -> f64 {
        self.donors.iter().position(|&d| d == loc).map_or(0.0, |i| self.weights[i])
    }

    /// Sum of weights.
    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Weighted donor outcome at time `t`.
    pub fn combine(&self, panel: &Panel, t: usize) -> f64 {
        self.donors.iter().zip(&self.weights).map(|(&d, &w)| w * panel.outcome(d, t)).sum()
    }

    /// `(location name, weight)` pairs with weight above `threshold`, largest first.
    pub fn named(&self, panel: &Panel, threshold: f64) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .donors
            .iter()
            .zip(&self.weights)
            .filter(|&(_, &w)| w.abs() > threshold)
            .map(|(&d, &w)| (panel.location_name(d).to_string(), w))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panel() -> Panel {
        Panel::from_series(
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            vec![vec![1.0; 6], vec![2.0; 6], vec![3.0; 6], vec![4.0; 6]],
        )
        .unwrap()
    }

    #[test]
    fn test_spec_windows_and_donors() {
        let p = panel();
        let spec =
            TreatmentSpec::new(&p, &["c", "a"], 4, 6).unwrap().with_excluded(&p, &["d"]).unwrap();
        assert_eq!(spec.treated(), &[0, 2]);
        assert_eq!(spec.pre_times(), vec![1, 2, 3]);
        assert_eq!(spec.duration(), 3);
        assert_eq!(spec.donors(&p), vec![1]);
    }

    #[test]
    fn test_spec_validation() {
        let p = panel();
        let empty: [&str; 0] = [];
        assert!(TreatmentSpec::new(&p, &empty, 2, 3).is_err());
        assert!(TreatmentSpec::new(&p, &["zz"], 2, 3).is_err());
        assert!(matches!(TreatmentSpec::new(&p, &["a"], 0, 3), Err(Error::Validation(_))));
        assert!(matches!(TreatmentSpec::new(&p, &["a"], 4, 3), Err(Error::Validation(_))));
        assert!(TreatmentSpec::new(&p, &["a"], 2, 7).is_err());
    }

    #[test]
    fn test_empty_pre_period_is_insufficient_data() {
        let p = panel();
        assert!(matches!(TreatmentSpec::new(&p, &["a"], 1, 3), Err(Error::InsufficientData(_))));
        assert!(matches!(
            TreatmentSpec::from_indices(&p, vec![0, 1], 1, 1),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn test_weight_vector_combine() {
        let p = panel();
        let w = WeightVector::new(vec![1, 3], vec![0.25, 0.75]).unwrap();
        assert!((w.combine(&p, 1) - 3.5).abs() < 1e-12);
        assert_eq!(w.weight_of(3), 0.75);
        assert_eq!(w.weight_of(0), 0.0);
        assert_eq!(w.named(&p, 0.0)[0].0, "d");
        assert!((WeightVector::uniform(vec![0, 1, 2]).total() - 1.0).abs() < 1e-12);
    }
}
