//! Second-stage bias correction of the Synthetic Control estimate.
//!
//! [`Augmentation`] is a closed set of prognostic models sharing one
//! capability: fit on a subset of pre-period times and return a per-time
//! additive [`Correction`] over the full horizon. [`select_best`] compares the
//! variants by held-out scaled L2 imbalance on contiguous pre-period folds.
//!
//! Every failure here is an [`Error::Augmentation`]; the estimator recovers from
//! it by falling back to [`Augmentation::None`].

pub mod factor;
pub mod ridge;

use gl_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::config::{EstimatorConfig, ModelKind};
use crate::numeric::{complement, contiguous_folds, scaled_imbalance};
use crate::series::SeriesMatrix;
use crate::weights::{SyntheticControlFit, WeightFitter};

/// Improvement in held-out scaled imbalance required to prefer an augmented model.
const SELECTION_MARGIN: f64 = 1e-6;

/// Prognostic model applied on top of the simplex weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Augmentation {
    /// No correction.
    None,
    /// Ridge regression of the SC residual on donor outcomes.
    Ridge,
    /// Interactive fixed-effects factor model.
    Gsc,
}

impl From<Augmentation> for ModelKind {
    fn from(a: Augmentation) -> Self {
        match a {
            Augmentation::None => ModelKind::None,
            Augmentation::Ridge => ModelKind::Ridge,
            Augmentation::Gsc => ModelKind::Gsc,
        }
    }
}

/// Additive correction to the SC counterfactual.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    /// Variant that produced it.
    pub kind: Augmentation,
    /// Correction for times `1..=T` (index `t - 1`).
    pub adjustment: Vec<f64>,
    /// Ridge coefficients added to the simplex weights.
    pub ridge_coefficients: Option<Vec<f64>>,
    /// Ridge penalty.
    pub penalty: Option<f64>,
    /// Factor rank.
    pub rank: Option<usize>,
}

impl Correction {
    /// Zero correction over `n_times` periods.
    pub fn none(n_times: usize) -> Self {
        Self {
            kind: Augmentation::None,
            adjustment: vec![0.0; n_times],
            ridge_coefficients: None,
            penalty: None,
            rank: None,
        }
    }
}

impl Augmentation {
    /// Fit the correction for `sc` using `times` only.
    pub fn fit(
        &self,
        data: &SeriesMatrix,
        sc: &SyntheticControlFit,
        times: &[usize],
        config: &EstimatorConfig,
    ) -> Result<Correction> {
        let n_times = data.n_times();
        match self {
            Augmentation::None => Ok(Correction::none(n_times)),
            Augmentation::Ridge => {
                let fit = ridge::fit(data, sc, times, config.cv_folds)?;
                let adjustment = (1..=n_times).map(|t| fit.adjustment(data, sc, t)).collect();
                Ok(Correction {
                    kind: *self,
                    adjustment,
                    ridge_coefficients: Some(fit.coefficients),
                    penalty: Some(fit.penalty),
                    rank: None,
                })
            }
            Augmentation::Gsc => {
                let fit = factor::fit(data, times, config.max_factors, config.cv_folds)?;
                let adjustment = (1..=n_times)
                    .map(|t| fit.counterfactual[t - 1] - sc.predict(data, t))
                    .collect();
                Ok(Correction {
                    kind: *self,
                    adjustment,
                    ridge_coefficients: None,
                    penalty: None,
                    rank: Some(fit.rank),
                })
            }
        }
    }
}

/// Held-out scaled L2 imbalance of every variant, in `[None, Ridge, Gsc]` order.
///
/// A variant that fails on any fold scores `+∞`.
pub fn cross_validated_imbalance(
    data: &SeriesMatrix,
    times: &[usize],
    config: &EstimatorConfig,
) -> Result<[f64; 3]> {
    let k = config.cv_folds.min(times.len() / 2);
    if k < 2 {
        return Err(Error::Augmentation(format!(
            "{} periods are too few for model selection",
            times.len()
        )));
    }
    let fitter = WeightFitter::from_config(config);
    let variants = [Augmentation::None, Augmentation::Ridge, Augmentation::Gsc];
    let mut imbalance = [0.0_f64; 3];
    let mut baseline = 0.0_f64;

    for held in contiguous_folds(times, k) {
        let train = complement(times, &held);
        let sc = fitter
            .fit(data, &train)
            .map_err(|e| Error::Augmentation(format!("fold refit failed: {e}")))?;
        let naive = SyntheticControlFit::equal_weight(data, &train, config.fixed_effects);
        baseline += held
            .iter()
            .map(|&t| (data.treated_at(t) - naive.predict(data, t)).powi(2))
            .sum::<f64>();

        for (slot, variant) in imbalance.iter_mut().zip(variants) {
            if !slot.is_finite() {
                continue;
            }
            match variant.fit(data, &sc, &train, config) {
                Ok(c) => {
                    *slot += held
                        .iter()
                        .map(|&t| {
                            (data.treated_at(t) - sc.predict(data, t) - c.adjustment[t - 1]).powi(2)
                        })
                        .sum::<f64>();
                }
                Err(_) => *slot = f64::INFINITY,
            }
        }
    }

    let tol = f64::EPSILON * times.iter().map(|&t| data.treated_at(t).powi(2)).sum::<f64>();
    Ok(imbalance.map(|l2| {
        if l2.is_finite() { scaled_imbalance(l2, baseline, tol) } else { f64::INFINITY }
    }))
}

/// Pick `Ridge` or `Gsc` when one of them beats `None` out of sample, else `None`.
pub fn select_best(
    data: &SeriesMatrix,
    times: &[usize],
    config: &EstimatorConfig,
) -> Result<Augmentation> {
    let [none, ridge, gsc] = cross_validated_imbalance(data, times, config)?;
    log::debug!("model selection: none={none:.4} ridge={ridge:.4} gsc={gsc:.4}");
    let (candidate, score) =
        if gsc < ridge { (Augmentation::Gsc, gsc) } else { (Augmentation::Ridge, ridge) };
    Ok(if score + SELECTION_MARGIN < none { candidate } else { Augmentation::None })
}
