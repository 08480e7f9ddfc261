//! Configuration values threaded through every estimation call.
//!
//! All structs are plain immutable values with `Default`, `with_*` builders and
//! serde support (`#[serde(default)]`, so a partial JSON document is enough).
//! `validate()` returns [`Error::Configuration`] on an invalid combination.

use gl_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Augmentation model applied on top of the Synthetic Control weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Plain Synthetic Control.
    #[default]
    None,
    /// Ridge-augmented Synthetic Control.
    Ridge,
    /// Generalized Synthetic Control (interactive fixed effects).
    Gsc,
    /// Cross-validated choice among `None`, `Ridge` and `Gsc`.
    Best,
}

/// Sidedness of the placebo test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideOfTest {
    /// Signed statistic, direction fixed by the observed effect.
    OneSided,
    /// Absolute statistic.
    #[default]
    TwoSided,
}

/// Estimator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Augmentation model.
    pub model: ModelKind,
    /// Demean every unit by its pre-period mean before fitting.
    pub fixed_effects: bool,
    /// Residualize outcomes on pre-period covariate means (no-op without covariates).
    pub use_covariates: bool,
    /// Number of contiguous pre-period folds used by cross-validation.
    pub cv_folds: usize,
    /// Largest factor rank tried by the GSC augmentation.
    pub max_factors: usize,
    /// Iteration cap of the weight solver.
    pub max_iter: usize,
    /// Convergence tolerance of the weight solver (max abs weight change).
    pub tol: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::None,
            fixed_effects: false,
            use_covariates: false,
            cv_folds: 5,
            max_factors: 5,
            max_iter: 10_000,
            tol: 1e-10,
        }
    }
}

impl EstimatorConfig {
    /// Set the augmentation model.
    pub fn with_model(mut self, model: ModelKind) -> Self {
        self.model = model;
        self
    }

    /// Enable or disable fixed effects.
    pub fn with_fixed_effects(mut self, fixed_effects: bool) -> Self {
        self.fixed_effects = fixed_effects;
        self
    }

    /// Enable or disable covariate residualization.
    pub fn with_covariates(mut self, use_covariates: bool) -> Self {
        self.use_covariates = use_covariates;
        self
    }

    /// Validate.
    pub fn validate(&self) -> Result<()> {
        if self.cv_folds < 2 {
            return Err(Error::Configuration(format!(
                "cv_folds must be >= 2, got {}",
                self.cv_folds
            )));
        }
        if self.max_iter == 0 {
            return Err(Error::Configuration("max_iter must be >= 1".into()));
        }
        if !(self.tol.is_finite() && self.tol > 0.0) {
            return Err(Error::Configuration(format!("tol must be > 0, got {}", self.tol)));
        }
        Ok(())
    }
}

/// Placebo inference configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Significance level.
    pub alpha: f64,
    /// Sidedness of the test.
    pub side_of_test: SideOfTest,
    /// Cap on placebo runs when the treated set has more than one unit.
    pub max_placebos: usize,
    /// Seed for sampling placebo combinations.
    pub seed: u64,
    /// Refit placebos on the current rayon pool; `false` keeps them on the calling thread.
    pub parallel: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            side_of_test: SideOfTest::TwoSided,
            max_placebos: 100,
            seed: 42,
            parallel: true,
        }
    }
}

impl InferenceConfig {
    /// Set alpha.
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set sidedness.
    pub fn with_side(mut self, side: SideOfTest) -> Self {
        self.side_of_test = side;
        self
    }

    /// Set the placebo cap.
    pub fn with_max_placebos(mut self, max_placebos: usize) -> Self {
        self.max_placebos = max_placebos;
        self
    }

    /// Enable or disable parallel placebo refits.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Validate.
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(Error::Configuration(format!("alpha must be in (0,1), got {}", self.alpha)));
        }
        if self.max_placebos < 2 {
            return Err(Error::Configuration("max_placebos must be >= 2".into()));
        }
        Ok(())
    }
}

/// How candidate treatment groups are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStrategy {
    /// Lexicographic combinations of the eligible pool, truncated at the cap.
    #[default]
    Exhaustive,
    /// Each eligible location plus its most correlated peers.
    Correlation,
}

/// Power simulation / market selection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Candidate test durations (periods).
    pub treatment_periods: Vec<usize>,
    /// Candidate test-group sizes.
    pub n: Vec<usize>,
    /// Effect sizes injected as relative lifts (0.1 = +10%).
    pub effect_sizes: Vec<f64>,
    /// Number of look-back offsets simulated per duration.
    pub lookback_window: usize,
    /// Locations every candidate must contain.
    pub include_markets: Vec<String>,
    /// Locations never used as test markets (they remain donors).
    pub exclude_markets: Vec<String>,
    /// Admissible `(min, max)` holdout share of the total outcome.
    pub holdout: Option<(f64, f64)>,
    /// Cost per incremental conversion.
    pub cpic: f64,
    /// Maximum investment.
    pub budget: Option<f64>,
    /// Cap on candidate groups per group size.
    pub max_combinations: usize,
    /// Candidate generation strategy.
    pub candidates: CandidateStrategy,
    /// Run work items and their placebo refits on a rayon pool.
    ///
    /// `false` keeps the whole simulation on the calling thread.
    pub parallel: bool,
    /// Rayon threads (0 = global pool).
    pub n_threads: usize,
    /// Estimator used for every simulated test.
    pub estimator: EstimatorConfig,
    /// Placebo inference used for every simulated test.
    pub inference: InferenceConfig,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            treatment_periods: vec![15],
            n: vec![2],
            effect_sizes: vec![0.0, 0.05, 0.1, 0.15, 0.2, 0.25],
            lookback_window: 1,
            include_markets: Vec::new(),
            exclude_markets: Vec::new(),
            holdout: None,
            cpic: 1.0,
            budget: None,
            max_combinations: 1_000,
            candidates: CandidateStrategy::Exhaustive,
            parallel: true,
            n_threads: 0,
            estimator: EstimatorConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl PowerConfig {
    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the panel-independent parts of the configuration.
    pub fn validate(&self) -> Result<()> {
        self.estimator.validate()?;
        self.inference.validate()?;
        if self.treatment_periods.is_empty() || self.treatment_periods.contains(&0) {
            return Err(Error::Configuration("treatment_periods must be non-empty and >= 1".into()));
        }
        if self.n.is_empty() || self.n.contains(&0) {
            return Err(Error::Configuration("n must be non-empty and >= 1".into()));
        }
        if self.effect_sizes.is_empty()
            || self.effect_sizes.iter().any(|e| !e.is_finite() || *e <= -1.0)
        {
            return Err(Error::Configuration(
                "effect_sizes must be non-empty, finite and > -1".into(),
            ));
        }
        if self.lookback_window == 0 {
            return Err(Error::Configuration("lookback_window must be >= 1".into()));
        }
        if let Some((lo, hi)) = self.holdout
            && (!(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi)
        {
            return Err(Error::Configuration(format!(
                "holdout bounds ({lo}, {hi}) must satisfy 0 <= min <= max <= 1"
            )));
        }
        if !(self.cpic.is_finite() && self.cpic > 0.0) {
            return Err(Error::Configuration(format!("cpic must be > 0, got {}", self.cpic)));
        }
        if let Some(b) = self.budget
            && !(b.is_finite() && b > 0.0)
        {
            return Err(Error::Configuration(format!("budget must be > 0, got {b}")));
        }
        if self.max_combinations == 0 {
            return Err(Error::Configuration("max_combinations must be >= 1".into()));
        }
        if let Some(m) = self.include_markets.iter().find(|m| self.exclude_markets.contains(m)) {
            return Err(Error::Configuration(format!("market '{m}' is both included and excluded")));
        }
        Ok(())
    }
}

/// Relative weight of each normalized metric in the rank score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankWeights {
    /// Weight of |MDE|.
    pub effect_size: f64,
    /// Weight of `1 - power`.
    pub power: f64,
    /// Weight of the average scaled L2 imbalance.
    pub imbalance: f64,
    /// Weight of `abs_lift_in_zero`.
    pub abs_lift_in_zero: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self { effect_size: 1.0, power: 1.0, imbalance: 1.0, abs_lift_in_zero: 1.0 }
    }
}

/// How the MDE is read off a power curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MdeSelection {
    /// Smallest simulated effect size reaching the power target.
    #[default]
    Smallest,
    /// Linear interpolation between the bracketing effect sizes.
    Interpolate,
}

/// Market ranking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Power a group must reach for an effect size to count as detectable.
    pub power_target: f64,
    /// Metric weights.
    pub weights: RankWeights,
    /// Scores closer than this share a rank.
    pub tie_tolerance: f64,
    /// MDE selection rule.
    pub mde: MdeSelection,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            power_target: 0.8,
            weights: RankWeights::default(),
            tie_tolerance: 1e-9,
            mde: MdeSelection::Smallest,
        }
    }
}

impl RankingConfig {
    /// Validate.
    pub fn validate(&self) -> Result<()> {
        if !(self.power_target > 0.0 && self.power_target <= 1.0) {
            return Err(Error::Configuration(format!(
                "power_target must be in (0,1], got {}",
                self.power_target
            )));
        }
        let w = &self.weights;
        if [w.effect_size, w.power, w.imbalance, w.abs_lift_in_zero]
            .iter()
            .any(|v| !(v.is_finite() && *v >= 0.0))
        {
            return Err(Error::Configuration("rank weights must be finite and >= 0".into()));
        }
        if !(self.tie_tolerance.is_finite() && self.tie_tolerance >= 0.0) {
            return Err(Error::Configuration("tie_tolerance must be >= 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EstimatorConfig::default().validate().is_ok());
        assert!(InferenceConfig::default().validate().is_ok());
        assert!(PowerConfig::default().validate().is_ok());
        assert!(RankingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let cfg = PowerConfig::from_json_str(
            r#"{"n": [3], "lookback_window": 4, "holdout": [0.5, 0.9],
                "estimator": {"model": "best", "fixed_effects": true},
                "inference": {"side_of_test": "one_sided"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.n, vec![3]);
        assert_eq!(cfg.estimator.model, ModelKind::Best);
        assert!(cfg.estimator.fixed_effects);
        assert_eq!(cfg.estimator.cv_folds, 5);
        assert_eq!(cfg.inference.side_of_test, SideOfTest::OneSided);
        assert!(cfg.inference.parallel);
        assert_eq!(cfg.holdout, Some((0.5, 0.9)));
    }

    #[test]
    fn test_invalid_combinations() {
        let bad = PowerConfig { holdout: Some((0.9, 0.5)), ..PowerConfig::default() };
        assert!(matches!(bad.validate(), Err(Error::Configuration(_))));

        let bad = PowerConfig {
            include_markets: vec!["a".into()],
            exclude_markets: vec!["a".into()],
            ..PowerConfig::default()
        };
        assert!(matches!(bad.validate(), Err(Error::Configuration(_))));

        let bad = PowerConfig { budget: Some(0.0), ..PowerConfig::default() };
        assert!(bad.validate().is_err());

        let bad = PowerConfig {
            inference: InferenceConfig::default().with_alpha(1.5),
            ..PowerConfig::default()
        };
        assert!(bad.validate().is_err());

        assert!(matches!(PowerConfig::from_json_str("{"), Err(Error::Json(_))));
    }
}
