//! Synthetic Control estimator: counterfactual, ATT and Lift for one treatment.
//!
//! The weights and the augmentation are fitted on pre-period data only and
//! then applied to donor outcomes over the whole horizon `[1, T]`.
//!
//! # Example
//!
//! ```
//! use gl_core::{Panel, TreatmentSpec};
//! use gl_inference::{Estimator, EstimatorConfig};
//!
//! let panel = Panel::from_series(
//!     vec!["a".into(), "b".into(), "c".into()],
//!     vec![vec![10.0, 11.0, 12.0, 13.0, 18.0], vec![10.0, 11.0, 12.0, 13.0, 14.0], vec![5.0; 5]],
//! )
//! .unwrap();
//! let spec = TreatmentSpec::new(&panel, &["a"], 5, 5).unwrap();
//! let fit = Estimator::new(EstimatorConfig::default()).fit(&panel, &spec).unwrap();
//! assert!((fit.effect.cumulative_lift - 4.0).abs() < 1e-6);
//! ```

use gl_core::{Error, Panel, Result, TreatmentSpec, WeightVector};
use serde::Serialize;

use crate::augment::{self, Augmentation, Correction};
use crate::config::{EstimatorConfig, ModelKind};
use crate::covariates;
use crate::numeric::scaled_imbalance;
use crate::series::SeriesMatrix;
use crate::weights::{SyntheticControlFit, WeightFitter};

/// Estimated no-treatment outcome of the treated aggregate, times `1..=T`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterfactualSeries {
    values: Vec<f64>,
}

impl CounterfactualSeries {
    /// Values (index `t - 1`).
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value at time `t`.
    pub fn at(&self, t: usize) -> f64 {
        self.values[t - 1]
    }

    /// Sum over `start..=end`.
    pub fn window_total(&self, start: usize, end: usize) -> f64 {
        self.values[start - 1..end].iter().sum()
    }
}

/// Treatment effect summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectEstimate {
    /// Observed − counterfactual, times `1..=T`.
    pub att: Vec<f64>,
    /// Running sum of ATT over the test window.
    pub cumulative_att: Vec<f64>,
    /// Sum of ATT over the test window.
    pub cumulative_lift: f64,
    /// Cumulative lift relative to the counterfactual total of the window.
    pub percent_lift: f64,
    /// Mean ATT over the test window.
    pub average_att: f64,
    /// Cumulative lift × number of treated units.
    pub incremental: f64,
    /// Sum of squared pre-period ATT.
    pub l2_imbalance: f64,
    /// `l2_imbalance` relative to the equal-weight baseline, in `[0, 1]`.
    pub scaled_l2_imbalance: f64,
}

/// What the augmentation step actually did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AugmentationReport {
    /// Requested model.
    pub requested: ModelKind,
    /// Applied model.
    pub applied: ModelKind,
    /// Per-time correction added to the SC estimate (`bias removed`).
    pub bias_removed: Vec<f64>,
    /// The requested model failed and the fit fell back to plain SC.
    pub degraded: bool,
    /// Reason for degradation.
    pub message: Option<String>,
    /// Ridge penalty.
    pub penalty: Option<f64>,
    /// Factor rank.
    pub rank: Option<usize>,
}

/// Output of one estimator run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimateResult {
    /// Treated location indices.
    pub treated: Vec<usize>,
    /// First treated time.
    pub start: usize,
    /// Last treated time.
    pub end: usize,
    /// Simplex weights.
    pub weights: WeightVector,
    /// Simplex weights plus the ridge correction.
    pub augmented_weights: Option<WeightVector>,
    /// Observed treated aggregate, times `1..=T`.
    pub observed: Vec<f64>,
    /// Counterfactual.
    pub counterfactual: CounterfactualSeries,
    /// Effect summary.
    pub effect: EffectEstimate,
    /// Augmentation details.
    pub augmentation: AugmentationReport,
    /// Weight solver converged.
    pub converged: bool,
}

impl EstimateResult {
    /// Estimate obtained if the treated outcomes in the test window were scaled by `1 + effect`.
    ///
    /// Weights, augmentation and covariate adjustment depend only on pre-period
    /// treated data and on donors, so only the test-window ATT changes.
    pub fn with_injected_effect(&self, effect: f64) -> Self {
        let mut out = self.clone();
        for t in self.start..=self.end {
            out.observed[t - 1] = self.observed[t - 1] * (1.0 + effect);
        }
        out.effect = summarize(
            &out.observed,
            &out.counterfactual,
            self.start,
            self.end,
            self.treated.len(),
            self.effect.l2_imbalance,
            self.effect.scaled_l2_imbalance,
        );
        out
    }

    /// Sum of absolute ATT over the test window.
    pub fn absolute_effect(&self) -> f64 {
        self.effect.att[self.start - 1..self.end].iter().map(|v| v.abs()).sum()
    }

    /// Counterfactual total over the test window.
    pub fn counterfactual_total(&self) -> f64 {
        self.counterfactual.window_total(self.start, self.end)
    }
}

/// Synthetic Control estimator.
#[derive(Debug, Clone)]
pub struct Estimator {
    config: EstimatorConfig,
}

impl Estimator {
    /// Create an estimator.
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    /// Configuration.
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Fit the estimator for `spec`.
    pub fn fit(&self, panel: &Panel, spec: &TreatmentSpec) -> Result<EstimateResult> {
        self.config.validate()?;
        let raw = SeriesMatrix::from_panel(panel, spec)?;
        let pre = spec.pre_times();
        let n_times = raw.n_times();

        let (data, covariate_fit) = if self.config.use_covariates && panel.n_covariates() > 0 {
            let r = covariates::residualize(panel, spec, &raw)?;
            (r.data, r.treated_fitted)
        } else {
            (raw.clone(), vec![0.0; n_times])
        };

        let sc = WeightFitter::from_config(&self.config).fit(&data, &pre)?;
        let (correction, degraded, message) = self.augment(&data, &sc, &pre);

        let counterfactual: Vec<f64> = (1..=n_times)
            .map(|t| sc.predict(&data, t) + correction.adjustment[t - 1] + covariate_fit[t - 1])
            .collect();
        let counterfactual = CounterfactualSeries { values: counterfactual };
        let observed = raw.treated().to_vec();

        let naive = SyntheticControlFit::equal_weight(&data, &pre, self.config.fixed_effects);
        let l2: f64 = pre.iter().map(|&t| (observed[t - 1] - counterfactual.at(t)).powi(2)).sum();
        let baseline: f64 = pre
            .iter()
            .map(|&t| (observed[t - 1] - naive.predict(&data, t) - covariate_fit[t - 1]).powi(2))
            .sum();
        let tol = f64::EPSILON * pre.iter().map(|&t| observed[t - 1].powi(2)).sum::<f64>();
        let scaled = scaled_imbalance(l2, baseline, tol);

        let effect = summarize(
            &observed,
            &counterfactual,
            spec.start(),
            spec.end(),
            spec.treated().len(),
            l2,
            scaled,
        );

        let augmented_weights = match &correction.ridge_coefficients {
            Some(delta) => Some(WeightVector::new(
                sc.weights.donors.clone(),
                sc.weights.weights.iter().zip(delta).map(|(w, d)| w + d).collect(),
            )?),
            None => None,
        };

        Ok(EstimateResult {
            treated: spec.treated().to_vec(),
            start: spec.start(),
            end: spec.end(),
            weights: sc.weights,
            augmented_weights,
            observed,
            counterfactual,
            effect,
            augmentation: AugmentationReport {
                requested: self.config.model,
                applied: correction.kind.into(),
                bias_removed: correction.adjustment,
                degraded,
                message,
                penalty: correction.penalty,
                rank: correction.rank,
            },
            converged: sc.converged,
        })
    }

    fn augment(
        &self,
        data: &SeriesMatrix,
        sc: &SyntheticControlFit,
        pre: &[usize],
    ) -> (Correction, bool, Option<String>) {
        let chosen = match self.config.model {
            ModelKind::None => Ok(Augmentation::None),
            ModelKind::Ridge => Ok(Augmentation::Ridge),
            ModelKind::Gsc => Ok(Augmentation::Gsc),
            ModelKind::Best => augment::select_best(data, pre, &self.config),
        };
        match chosen.and_then(|a| a.fit(data, sc, pre, &self.config)) {
            Ok(c) => (c, false, None),
            Err(e) => {
                let msg = match e {
                    Error::Augmentation(msg) => msg,
                    other => other.to_string(),
                };
                log::warn!(
                    "augmentation {:?} failed, using plain synthetic control: {msg}",
                    self.config.model
                );
                (Correction::none(data.n_times()), true, Some(msg))
            }
        }
    }
}

fn summarize(
    observed: &[f64],
    counterfactual: &CounterfactualSeries,
    start: usize,
    end: usize,
    n_treated: usize,
    l2_imbalance: f64,
    scaled_l2_imbalance: f64,
) -> EffectEstimate {
    let att: Vec<f64> = observed.iter().zip(counterfactual.values()).map(|(y, c)| y - c).collect();
    let cumulative_att: Vec<f64> = att[start - 1..end]
        .iter()
        .scan(0.0, |acc, v| {
            *acc += v;
            Some(*acc)
        })
        .collect();
    let cumulative_lift = cumulative_att.last().copied().unwrap_or(0.0);
    let cf_total = counterfactual.window_total(start, end);
    let percent_lift = if cf_total != 0.0 { cumulative_lift / cf_total } else { 0.0 };
    let duration = (end - start + 1) as f64;
    EffectEstimate {
        att,
        cumulative_att,
        cumulative_lift,
        percent_lift,
        average_att: cumulative_lift / duration,
        incremental: cumulative_lift * n_treated as f64,
        l2_imbalance,
        scaled_l2_imbalance,
    }
}
