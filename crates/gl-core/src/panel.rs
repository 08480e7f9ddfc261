//! Balanced location × time panel.
//!
//! A [`Panel`] is the only input the estimation core consumes. It is built
//! once from long-format rows (or per-location series), validated against the
//! upstream contract, and never mutated afterwards:
//!
//! - locations are unique and kept in lexicographic order;
//! - the time index is contiguous and starts at 1;
//! - every location has a finite outcome at every time;
//! - covariates, when present, have the same width in every cell.
//!
//! Outcomes are stored location-major (`values[loc * T + (t - 1)]`), so a
//! location's series is a contiguous slice.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One long-format observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelRow {
    /// Location identifier.
    pub location: String,
    /// Time index (1-based).
    pub time: usize,
    /// Outcome value.
    pub outcome: f64,
    /// Optional covariate vector.
    #[serde(default)]
    pub covariates: Option<Vec<f64>>,
}

impl PanelRow {
    /// Row without covariates.
    pub fn new(location: impl Into<String>, time: usize, outcome: f64) -> Self {
        Self { location: location.into(), time, outcome, covariates: None }
    }
}

/// Validated, immutable panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Panel {
    locations: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    n_times: usize,
    values: Vec<f64>,
    n_covariates: usize,
    covariates: Option<Vec<f64>>,
}

impl Panel {
    /// Build a panel from long-format rows.
    pub fn from_rows(rows: Vec<PanelRow>) -> Result<Self> {
        if rows.is_empty() {
            return Err(Error::MalformedPanel("no rows".into()));
        }

        let mut by_location: BTreeMap<String, Vec<(usize, f64, Option<Vec<f64>>)>> =
            BTreeMap::new();
        let mut n_times = 0usize;
        let mut width: Option<usize> = None;
        for row in rows {
            if row.time == 0 {
                return Err(Error::MalformedPanel(format!(
                    "location '{}' has time index 0; time starts at 1",
                    row.location
                )));
            }
            if !row.outcome.is_finite() {
                return Err(Error::MalformedPanel(format!(
                    "non-finite outcome at ({}, {})",
                    row.location, row.time
                )));
            }
            let w = row.covariates.as_ref().map_or(0, Vec::len);
            match width {
                None => width = Some(w),
                Some(prev) if prev != w => {
                    return Err(Error::MalformedPanel(format!(
                        "covariate width {} at ({}, {}) differs from {}",
                        w, row.location, row.time, prev
                    )));
                }
                _ => {}
            }
            if let Some(cov) = &row.covariates
                && cov.iter().any(|v| !v.is_finite())
            {
                return Err(Error::MalformedPanel(format!(
                    "non-finite covariate at ({}, {})",
                    row.location, row.time
                )));
            }
            n_times = n_times.max(row.time);
            by_location
                .entry(row.location)
                .or_default()
                .push((row.time, row.outcome, row.covariates));
        }

        let n_covariates = width.unwrap_or(0);
        let n_locations = by_location.len();
        let mut values = vec![f64::NAN; n_locations * n_times];
        let mut covariates =
            (n_covariates > 0).then(|| vec![0.0; n_locations * n_times * n_covariates]);
        let mut locations = Vec::with_capacity(n_locations);

        for (loc, (name, obs)) in by_location.into_iter().enumerate() {
            if obs.len() != n_times {
                return Err(Error::MalformedPanel(format!(
                    "location '{}' has {} observations, expected {}",
                    name,
                    obs.len(),
                    n_times
                )));
            }
            for (t, y, cov) in obs {
                let cell = loc * n_times + (t - 1);
                if !values[cell].is_nan() {
                    return Err(Error::MalformedPanel(format!(
                        "duplicate observation for ({}, {})",
                        name, t
                    )));
                }
                values[cell] = y;
                if let (Some(dst), Some(src)) = (covariates.as_mut(), cov) {
                    dst[cell * n_covariates..(cell + 1) * n_covariates].copy_from_slice(&src);
                }
            }
            locations.push(name);
        }

        Self::assemble(locations, n_times, values, n_covariates, covariates)
    }

    /// Build a panel from one outcome series per location (times `1..=T`).
    pub fn from_series(locations: Vec<String>, outcomes: Vec<Vec<f64>>) -> Result<Self> {
        if locations.len() != outcomes.len() {
            return Err(Error::MalformedPanel(format!(
                "{} locations but {} series",
                locations.len(),
                outcomes.len()
            )));
        }
        let n_times = outcomes.first().map_or(0, Vec::len);
        for (loc, series) in locations.iter().zip(&outcomes) {
            if series.is_empty() {
                return Err(Error::MalformedPanel(format!("location '{loc}' has an empty series")));
            }
            if series.len() != n_times {
                return Err(Error::MalformedPanel(format!(
                    "location '{loc}' has {} periods, expected {n_times}",
                    series.len()
                )));
            }
        }
        let rows = locations
            .into_iter()
            .zip(outcomes)
            .flat_map(|(loc, series)| {
                series
                    .into_iter()
                    .enumerate()
                    .map(move |(i, y)| PanelRow::new(loc.clone(), i + 1, y))
                    .collect::<Vec<_>>()
            })
            .collect();
        Self::from_rows(rows)
    }

    fn assemble(
        locations: Vec<String>,
        n_times: usize,
        values: Vec<f64>,
        n_covariates: usize,
        covariates: Option<Vec<f64>>,
    ) -> Result<Self> {
        if n_times == 0 || locations.is_empty() {
            return Err(Error::MalformedPanel("panel is empty".into()));
        }
        let index = locations.iter().enumerate().map(|(i, l)| (l.clone(), i)).collect();
        Ok(Self { locations, index, n_times, values, n_covariates, covariates })
    }

    /// Location identifiers, in panel order.
    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    /// Number of locations.
    pub fn n_locations(&self) -> usize {
        self.locations.len()
    }

    /// Number of time periods `T`.
    pub fn n_times(&self) -> usize {
        self.n_times
    }

    /// Number of covariates per cell (0 when the panel has none).
    pub fn n_covariates(&self) -> usize {
        self.n_covariates
    }

    /// Index of a location identifier.
    pub fn location_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Identifier of a location index.
    pub fn location_name(&self, loc: usize) -> &str {
        &self.locations[loc]
    }

    /// Outcome for location `loc` at time `t` (1-based).
    #[inline]
    pub fn outcome(&self, loc: usize, t: usize) -> f64 {
        self.values[loc * self.n_times + (t - 1)]
    }

    /// Full outcome series of a location (index 0 is time 1).
    pub fn series(&self, loc: usize) -> &[f64] {
        &self.values[loc * self.n_times..(loc + 1) * self.n_times]
    }

    /// Covariate vector for location `loc` at time `t`, if the panel has covariates.
    pub fn covariates(&self, loc: usize, t: usize) -> Option<&[f64]> {
        let k = self.n_covariates;
        self.covariates.as_ref().map(|c| {
            let cell = loc * self.n_times + (t - 1);
            &c[cell * k..(cell + 1) * k]
        })
    }

    /// Sum of every outcome in the panel.
    pub fn total_outcome(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Sum of a location's outcomes over all times.
    pub fn location_total(&self, loc: usize) -> f64 {
        self.series(loc).iter().sum()
    }

    /// Sum of outcomes over `locs` and times `start..=end`.
    pub fn window_total(&self, locs: &[usize], start: usize, end: usize) -> f64 {
        locs.iter().map(|&l| self.series(l)[start - 1..end].iter().sum::<f64>()).sum()
    }

    /// Copy of the panel with outcomes of `locs` in `start..=end` multiplied by `factor`.
    pub fn with_scaled_outcomes(
        &self,
        locs: &[usize],
        start: usize,
        end: usize,
        factor: f64,
    ) -> Result<Self> {
        if start == 0 || start > end || end > self.n_times {
            return Err(Error::Validation(format!(
                "window [{start}, {end}] outside [1, {}]",
                self.n_times
            )));
        }
        if !factor.is_finite() {
            return Err(Error::Validation(format!("scale factor must be finite, got {factor}")));
        }
        let mut out = self.clone();
        for &l in locs {
            if l >= self.n_locations() {
                return Err(Error::Validation(format!("location index {l} out of range")));
            }
            for t in start..=end {
                out.values[l * self.n_times + (t - 1)] *= factor;
            }
        }
        Ok(out)
    }
}
