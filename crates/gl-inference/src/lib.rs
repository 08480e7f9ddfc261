//! # gl-inference
//!
//! Causal lift estimation and test design for GeoLift.
//!
//! This crate provides:
//! - Synthetic Control weights on the simplex ([`weights`])
//! - ridge / factor-model augmentation with cross-validated selection ([`augment`])
//! - the counterfactual estimator ([`Estimator`])
//! - placebo permutation inference ([`PlaceboTest`])
//! - combinatorial power simulation ([`PowerSimulator`]) and market ranking ([`MarketRanker`])
//!
//! ## Architecture
//!
//! Every entry point takes an immutable configuration value and a read-only
//! [`Panel`]. Nothing here holds global state, so simulations can run on a
//! rayon pool and still reproduce sequential results exactly.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Second-stage bias correction: none / ridge / GSC / cross-validated best.
pub mod augment;
/// Lazy lexicographic combinations.
pub mod combinations;
/// Estimator, inference, simulation and ranking configuration.
pub mod config;
/// Covariate residualization.
pub mod covariates;
/// Counterfactual, ATT and Lift.
pub mod estimator;
/// Numerical helpers.
pub mod numeric;
/// Placebo permutation inference.
pub mod placebo;
/// Power simulation.
pub mod power;
/// Market ranking.
pub mod ranking;
/// Treated aggregate and donor outcome matrix.
pub mod series;
/// Simplex-constrained Synthetic Control weights.
pub mod weights;

pub use augment::{Augmentation, Correction};
pub use config::{
    CandidateStrategy, EstimatorConfig, InferenceConfig, MdeSelection, ModelKind, PowerConfig,
    RankWeights, RankingConfig, SideOfTest,
};
pub use estimator::{
    AugmentationReport, CounterfactualSeries, EffectEstimate, EstimateResult, Estimator,
};
pub use gl_core::{Error, Panel, PanelRow, Result, TreatmentSpec, WeightVector};
pub use placebo::{InferenceResult, PlaceboDistribution, PlaceboTest};
pub use power::{
    PowerPoint, PowerSimulator, ProgressFn, SimulationFailure, SimulationOutcome, SimulationRecord,
};
pub use ranking::{MarketRanker, RankedMarket};
pub use weights::{SyntheticControlFit, WeightFitter};
