//! Market ranking from simulated power curves.
//!
//! One row per (group, duration). The effect-size row is the smallest
//! detectable effect at the configured power target. Four metrics are min-max
//! normalized across rows and combined with [`RankWeights`]:
//!
//! | metric | term |
//! |---|---|
//! | \|MDE\| | lower is better (1 when no MDE) |
//! | power | `1 - power` |
//! | scaled L2 imbalance | lower is better |
//! | `abs_lift_in_zero` | lower is better (1 when not simulated) |
//!
//! [`RankWeights`]: crate::config::RankWeights

use gl_core::Result;
use serde::Serialize;

use crate::config::{MdeSelection, RankingConfig};
use crate::power::{PowerPoint, SimulationOutcome};

/// One ranked (group, duration).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedMarket {
    /// Competition rank (1 = best); tied scores share a rank.
    pub rank: usize,
    /// Combined score (lower is better).
    pub score: f64,
    /// Treated location identifiers.
    pub locations: Vec<String>,
    /// Treated location indices.
    pub location_ids: Vec<usize>,
    /// Test duration.
    pub duration: usize,
    /// Minimum detectable effect; `None` when the power target is never reached.
    pub effect_size: Option<f64>,
    /// Power at the reported row.
    pub power: f64,
    /// Average ATT at the reported row.
    pub average_att: f64,
    /// Average estimated percent lift at the reported row.
    pub average_detected_lift: f64,
    /// Average scaled L2 imbalance at the reported row.
    pub average_scaled_l2_imbalance: f64,
    /// Investment at the reported row.
    pub investment: f64,
    /// Group share of the total outcome.
    pub proportion_total_y: f64,
    /// `1 - proportion_total_y`.
    pub holdout: f64,
    /// |average percent lift| with no injected effect.
    pub abs_lift_in_zero: Option<f64>,
    /// Records aggregated.
    pub n_records: usize,
    /// Records lost to failed simulations.
    pub n_omitted: usize,
}

/// Ranks simulated groups.
#[derive(Debug, Clone)]
pub struct MarketRanker {
    config: RankingConfig,
}

impl MarketRanker {
    /// Create a ranker.
    pub fn new(config: RankingConfig) -> Self {
        Self { config }
    }

    /// Rank every (group, duration) in `outcome`.
    pub fn rank(&self, outcome: &SimulationOutcome) -> Result<Vec<RankedMarket>> {
        self.config.validate()?;
        let curves = outcome.power_curves();

        let mut rows = Vec::new();
        let mut start = 0;
        while start < curves.len() {
            let key = (&curves[start].location_ids, curves[start].duration);
            let len =
                curves[start..].iter().take_while(|p| (&p.location_ids, p.duration) == key).count();
            let group = &curves[start..start + len];
            let n_omitted = outcome
                .failures
                .iter()
                .filter(|f| f.location_ids == *key.0 && f.duration == key.1)
                .map(|f| f.effect_sizes.len())
                .sum();
            rows.push(self.summarize(group, n_omitted));
            start += len;
        }

        let mde: Vec<Option<f64>> = rows.iter().map(|r| r.effect_size.map(f64::abs)).collect();
        let miss: Vec<Option<f64>> = rows.iter().map(|r| Some(1.0 - r.power)).collect();
        let imb: Vec<Option<f64>> =
            rows.iter().map(|r| Some(r.average_scaled_l2_imbalance)).collect();
        let zero: Vec<Option<f64>> = rows.iter().map(|r| r.abs_lift_in_zero).collect();
        let (mde, miss, imb, zero) =
            (normalize(&mde), normalize(&miss), normalize(&imb), normalize(&zero));

        let w = &self.config.weights;
        for (i, row) in rows.iter_mut().enumerate() {
            row.score = w.effect_size * mde[i]
                + w.power * miss[i]
                + w.imbalance * imb[i]
                + w.abs_lift_in_zero * zero[i];
        }
        rows.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.location_ids.cmp(&b.location_ids))
                .then(a.duration.cmp(&b.duration))
        });
        assign_ranks(&mut rows, self.config.tie_tolerance);
        Ok(rows)
    }

    /// Summary row of one (group, duration), effect sizes ascending.
    fn summarize(&self, group: &[PowerPoint], n_omitted: usize) -> RankedMarket {
        let mut effects: Vec<&PowerPoint> = group.iter().filter(|p| p.effect_size != 0.0).collect();
        effects.sort_by(|a, b| a.effect_size.abs().total_cmp(&b.effect_size.abs()));
        let zero = group.iter().find(|p| p.effect_size == 0.0);
        let target = self.config.power_target;

        let hit = effects.iter().position(|p| p.power >= target);
        let (row, effect_size, power) = match hit {
            Some(i) => {
                let p = effects[i];
                match (self.config.mde, i.checked_sub(1).map(|j| effects[j])) {
                    (MdeSelection::Interpolate, Some(below)) if p.power > below.power => {
                        let frac = (target - below.power) / (p.power - below.power);
                        let lo = below.effect_size.abs();
                        let size = lo + frac * (p.effect_size.abs() - lo);
                        (p, Some(size.copysign(p.effect_size)), target)
                    }
                    _ => (p, Some(p.effect_size), p.power),
                }
            }
            None => {
                let p = effects.last().copied().or(zero).unwrap_or(&group[0]);
                (p, None, p.power)
            }
        };

        RankedMarket {
            rank: 0,
            score: 0.0,
            locations: row.locations.clone(),
            location_ids: row.location_ids.clone(),
            duration: row.duration,
            effect_size,
            power,
            average_att: row.average_att,
            average_detected_lift: row.average_percent_lift,
            average_scaled_l2_imbalance: row.average_scaled_l2_imbalance,
            investment: row.investment,
            proportion_total_y: row.proportion_total_y,
            holdout: row.holdout,
            abs_lift_in_zero: zero.map(|z| z.average_percent_lift.abs()),
            n_records: group.iter().map(|p| p.n_offsets).sum(),
            n_omitted,
        }
    }
}

/// Min-max normalize onto `[0, 1]`; missing values map to 1, a constant metric to 0.
fn normalize(values: &[Option<f64>]) -> Vec<f64> {
    let present = values.iter().flatten().copied().filter(|v| v.is_finite());
    let (lo, hi) =
        present.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    values
        .iter()
        .map(|v| match v {
            Some(v) if v.is_finite() => {
                if hi > lo {
                    (v - lo) / (hi - lo)
                } else {
                    0.0
                }
            }
            _ => 1.0,
        })
        .collect()
}

/// Competition ranks over rows sorted by score; a gap above `tol` starts a new rank.
fn assign_ranks(rows: &mut [RankedMarket], tol: f64) {
    for i in 0..rows.len() {
        rows[i].rank = if i > 0 && rows[i].score - rows[i - 1].score <= tol {
            rows[i - 1].rank
        } else {
            i + 1
        };
    }
}
