//! Placebo (permutation) inference for a fitted treatment effect.
//!
//! Each pseudo-treated set has the same size as the real treated set and is
//! drawn from the real donor pool. It is refitted with the same window and
//! estimator configuration, using the remaining donors only, so real treated
//! units never act as donors. The observed statistic is then ranked against
//! the placebo statistics.
//!
//! The placebo distribution does not depend on the treated outcomes, so one
//! [`PlaceboDistribution`] can be reused to evaluate many variants of the same
//! test (see [`EstimateResult::with_injected_effect`]).

use std::collections::BTreeSet;

use gl_core::{Error, Panel, Result, TreatmentSpec};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::Serialize;

use crate::combinations::{Combinations, n_choose_k};
use crate::config::{InferenceConfig, SideOfTest};
use crate::estimator::{EstimateResult, Estimator};
use crate::numeric::quantile_linear_sorted;

/// Relative slack when comparing a placebo statistic with the observed one.
const TIE_TOLERANCE: f64 = 1e-9;

/// Effects of every successful placebo run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceboDistribution {
    /// Signed cumulative lift per placebo.
    pub cumulative_effects: Vec<f64>,
    /// Sum of absolute ATT over the test window per placebo.
    pub absolute_effects: Vec<f64>,
    /// Placebo sets tried.
    pub n_attempted: usize,
    /// Placebo sets whose fit failed.
    pub n_failed: usize,
}

/// Outcome of the placebo test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResult {
    /// Observed test statistic.
    pub statistic: f64,
    /// Placebo statistics on the same scale as `statistic`.
    pub placebo_statistics: Vec<f64>,
    /// Share of placebo statistics at least as extreme as the observed one.
    pub p_value: f64,
    /// Interval for the cumulative lift.
    pub confidence_interval: (f64, f64),
    /// `confidence_interval` relative to the counterfactual total of the window.
    pub percent_confidence_interval: (f64, f64),
    /// Sidedness.
    pub side_of_test: SideOfTest,
    /// Significance level.
    pub alpha: f64,
    /// `p_value <= alpha`.
    pub significant: bool,
    /// Successful placebo runs.
    pub n_placebos: usize,
    /// Failed placebo runs.
    pub n_failed: usize,
}

/// Placebo permutation test.
#[derive(Debug, Clone)]
pub struct PlaceboTest {
    config: InferenceConfig,
}

impl PlaceboTest {
    /// Create a test.
    pub fn new(config: InferenceConfig) -> Self {
        Self { config }
    }

    /// Configuration.
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Fit the placebo distribution and evaluate `observed` against it.
    pub fn run(
        &self,
        panel: &Panel,
        spec: &TreatmentSpec,
        estimator: &Estimator,
        observed: &EstimateResult,
    ) -> Result<InferenceResult> {
        let dist = self.distribution(panel, spec, estimator)?;
        self.evaluate(observed, &dist)
    }

    /// Pseudo-treated sets for `spec`, drawn from its donor pool.
    pub fn placebo_sets(&self, panel: &Panel, spec: &TreatmentSpec) -> Result<Vec<Vec<usize>>> {
        let donors = spec.donors(panel);
        let k = spec.treated().len();
        if donors.len() < 2 || donors.len() < k {
            return Err(Error::InsufficientDonors(format!(
                "{} donors cannot build a placebo distribution for {k} treated units",
                donors.len()
            )));
        }

        let total = n_choose_k(donors.len(), k);
        if k == 1 || total <= self.config.max_placebos {
            return Ok(Combinations::new(&donors, k).collect());
        }

        let mut rng = StdRng::seed_from_u64(self.seed_for(spec));
        let mut sets = BTreeSet::new();
        let max_draws = self.config.max_placebos.saturating_mul(50);
        for _ in 0..max_draws {
            if sets.len() == self.config.max_placebos {
                break;
            }
            let mut set: Vec<usize> = rand::seq::index::sample(&mut rng, donors.len(), k)
                .into_iter()
                .map(|i| donors[i])
                .collect();
            set.sort_unstable();
            sets.insert(set);
        }
        Ok(sets.into_iter().collect())
    }

    /// Refit the estimator for every placebo set.
    pub fn distribution(
        &self,
        panel: &Panel,
        spec: &TreatmentSpec,
        estimator: &Estimator,
    ) -> Result<PlaceboDistribution> {
        self.config.validate()?;
        let sets = self.placebo_sets(panel, spec)?;
        let blocked: Vec<usize> = spec.treated().iter().chain(spec.excluded()).copied().collect();

        let refit = |pseudo: &Vec<usize>| -> Option<(f64, f64)> {
            let fit = TreatmentSpec::from_indices(panel, pseudo.clone(), spec.start(), spec.end())
                .map(|s| s.with_excluded_indices(blocked.iter().copied()))
                .and_then(|s| estimator.fit(panel, &s));
            match fit {
                Ok(r) => Some((r.effect.cumulative_lift, r.absolute_effect())),
                Err(e) => {
                    log::debug!("placebo {pseudo:?} failed: {e}");
                    None
                }
            }
        };
        let runs: Vec<Option<(f64, f64)>> = if self.config.parallel {
            sets.par_iter().map(refit).collect()
        } else {
            sets.iter().map(refit).collect()
        };

        let n_attempted = runs.len();
        let (cumulative_effects, absolute_effects): (Vec<f64>, Vec<f64>) =
            runs.into_iter().flatten().unzip();
        let n_failed = n_attempted - cumulative_effects.len();
        if cumulative_effects.len() < 2 {
            return Err(Error::InsufficientDonors(format!(
                "only {} of {n_attempted} placebo fits succeeded",
                cumulative_effects.len()
            )));
        }
        if n_failed > 0 {
            log::warn!("{n_failed} of {n_attempted} placebo fits failed");
        }
        Ok(PlaceboDistribution { cumulative_effects, absolute_effects, n_attempted, n_failed })
    }

    /// Rank `observed` against a placebo distribution.
    pub fn evaluate(
        &self,
        observed: &EstimateResult,
        dist: &PlaceboDistribution,
    ) -> Result<InferenceResult> {
        self.config.validate()?;
        if dist.cumulative_effects.len() < 2 {
            return Err(Error::InsufficientDonors(
                "placebo distribution has fewer than 2 runs".into(),
            ));
        }
        let alpha = self.config.alpha;
        let lift = observed.effect.cumulative_lift;

        let (statistic, placebo_statistics) = match self.config.side_of_test {
            SideOfTest::TwoSided => (observed.absolute_effect(), dist.absolute_effects.clone()),
            SideOfTest::OneSided => {
                let s = effect_sign(lift);
                (s * lift, dist.cumulative_effects.iter().map(|c| s * c).collect())
            }
        };
        let p_value = permutation_p_value(statistic, &placebo_statistics);

        let mut sorted = dist.cumulative_effects.clone();
        sorted.sort_by(f64::total_cmp);
        let q = |p: f64| quantile_linear_sorted(&sorted, p);
        let confidence_interval = match self.config.side_of_test {
            SideOfTest::TwoSided => (lift - q(1.0 - alpha / 2.0), lift - q(alpha / 2.0)),
            SideOfTest::OneSided if effect_sign(lift) > 0.0 => {
                (lift - q(1.0 - alpha), f64::INFINITY)
            }
            SideOfTest::OneSided => (f64::NEG_INFINITY, lift - q(alpha)),
        };
        let cf_total = observed.counterfactual_total();
        let percent_confidence_interval = if cf_total != 0.0 {
            (confidence_interval.0 / cf_total, confidence_interval.1 / cf_total)
        } else {
            (0.0, 0.0)
        };

        Ok(InferenceResult {
            statistic,
            placebo_statistics,
            p_value,
            confidence_interval,
            percent_confidence_interval,
            side_of_test: self.config.side_of_test,
            alpha,
            significant: p_value <= alpha,
            n_placebos: dist.cumulative_effects.len(),
            n_failed: dist.n_failed,
        })
    }

    fn seed_for(&self, spec: &TreatmentSpec) -> u64 {
        spec.treated().iter().fold(self.config.seed, |h, &l| {
            (h ^ (l as u64 + 1)).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        })
    }
}

/// `+1` for a non-negative effect, `-1` otherwise.
fn effect_sign(v: f64) -> f64 {
    if v < 0.0 { -1.0 } else { 1.0 }
}

/// Share of `placebos` at least as large as `observed` (up to a relative tolerance).
pub fn permutation_p_value(observed: f64, placebos: &[f64]) -> f64 {
    if placebos.is_empty() {
        return 1.0;
    }
    let slack = TIE_TOLERANCE * observed.abs().max(1.0);
    let extreme = placebos.iter().filter(|&&p| p >= observed - slack).count();
    extreme as f64 / placebos.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EstimatorConfig;
    use approx::assert_relative_eq;

    fn wavy_panel(n_loc: usize, n_times: usize) -> Panel {
        let locations = (0..n_loc).map(|i| format!("m{i:02}")).collect();
        let series = (0..n_loc)
            .map(|i| {
                (0..n_times)
                    .map(|t| 100.0 + i as f64 + 4.0 * (t as f64 * 0.6 + 0.3 * i as f64).sin())
                    .collect()
            })
            .collect();
        Panel::from_series(locations, series).unwrap()
    }

    #[test]
    fn test_p_value_counts_ties() {
        assert_relative_eq!(permutation_p_value(3.0, &[1.0, 2.0, 3.0, 4.0]), 0.5);
        assert_relative_eq!(permutation_p_value(10.0, &[1.0, 2.0]), 0.0);
        assert_relative_eq!(permutation_p_value(-1.0, &[1.0, 2.0]), 1.0);
    }

    #[test]
    fn test_single_treated_uses_every_donor() {
        let panel = wavy_panel(7, 30);
        let spec = TreatmentSpec::new(&panel, &["m03"], 26, 30).unwrap();
        let sets =
            PlaceboTest::new(InferenceConfig::default()).placebo_sets(&panel, &spec).unwrap();
        assert_eq!(sets, vec![vec![0], vec![1], vec![2], vec![4], vec![5], vec![6]]);
    }

    #[test]
    fn test_sampled_sets_are_seeded_and_distinct() {
        let panel = wavy_panel(14, 30);
        let spec = TreatmentSpec::new(&panel, &["m00", "m01"], 26, 30).unwrap();
        let test = PlaceboTest::new(InferenceConfig::default().with_max_placebos(10));
        let a = test.placebo_sets(&panel, &spec).unwrap();
        let b = test.placebo_sets(&panel, &spec).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        let unique: BTreeSet<_> = a.iter().cloned().collect();
        assert_eq!(unique.len(), 10);
        assert!(a.iter().flatten().all(|&l| l >= 2));
    }

    #[test]
    fn test_sequential_matches_parallel() {
        let panel = wavy_panel(12, 30);
        let spec = TreatmentSpec::new(&panel, &["m02", "m07"], 26, 30).unwrap();
        let est = Estimator::new(EstimatorConfig::default());
        let cfg = InferenceConfig::default().with_max_placebos(15);
        let parallel = PlaceboTest::new(cfg.clone());
        let sequential = PlaceboTest::new(cfg.with_parallel(false));
        let par = parallel.distribution(&panel, &spec, &est).unwrap();
        let seq = sequential.distribution(&panel, &spec, &est).unwrap();
        assert_eq!(par, seq);
    }

    #[test]
    fn test_too_few_donors() {
        let panel = wavy_panel(2, 10);
        let spec = TreatmentSpec::new(&panel, &["m00"], 8, 10).unwrap();
        let err = PlaceboTest::new(InferenceConfig::default())
            .distribution(&panel, &spec, &Estimator::new(EstimatorConfig::default()))
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientDonors(_)));
    }

    #[test]
    fn test_detects_large_lift() {
        let panel = wavy_panel(10, 40);
        let lifted = panel.with_scaled_outcomes(&[4], 33, 40, 1.3).unwrap();
        let spec = TreatmentSpec::new(&lifted, &["m04"], 33, 40).unwrap();
        let est = Estimator::new(EstimatorConfig::default());
        let fit = est.fit(&lifted, &spec).unwrap();
        let test = PlaceboTest::new(InferenceConfig::default());
        let res = test.run(&lifted, &spec, &est, &fit).unwrap();
        assert_eq!(res.n_placebos, 9);
        assert_relative_eq!(res.p_value, 0.0);
        assert!(res.significant);
        let (lo, hi) = res.confidence_interval;
        assert!(lo <= fit.effect.cumulative_lift && fit.effect.cumulative_lift <= hi);
        assert!(lo > 0.0);
    }

    #[test]
    fn test_one_sided_interval_is_open_on_one_side() {
        let panel = wavy_panel(8, 30);
        let spec = TreatmentSpec::new(&panel, &["m02"], 25, 30).unwrap();
        let est = Estimator::new(EstimatorConfig::default());
        let fit = est.fit(&panel, &spec).unwrap();
        let test = PlaceboTest::new(InferenceConfig::default().with_side(SideOfTest::OneSided));
        let dist = test.distribution(&panel, &spec, &est).unwrap();

        let up = test.evaluate(&fit.with_injected_effect(0.2), &dist).unwrap();
        assert!(up.confidence_interval.1.is_infinite() && up.confidence_interval.1 > 0.0);
        let down = test.evaluate(&fit.with_injected_effect(-0.2), &dist).unwrap();
        assert!(down.confidence_interval.0.is_infinite() && down.confidence_interval.0 < 0.0);
    }
}
