//! # gl-core
//!
//! Core types for GeoLift.
//!
//! This crate provides:
//! - the error taxonomy shared by every GeoLift crate;
//! - the validated location × time [`Panel`];
//! - [`TreatmentSpec`] and [`WeightVector`].
//!
//! Estimation lives in `gl-inference`, which depends on this crate only.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod panel;
pub mod types;

pub use error::{Error, Result};
pub use panel::{Panel, PanelRow};
pub use types::{TreatmentSpec, WeightVector};
