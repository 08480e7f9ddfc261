//! Power simulation for prospective test design.
//!
//! For every candidate group, test duration and look-back offset the
//! estimator and its placebo distribution are fitted once on historical data;
//! each configured effect size is then injected into the treated outcomes of
//! the test window and evaluated against that same distribution. Power for a
//! (group, duration, effect size) is the share of offsets that came out
//! significant.
//!
//! Work items are independent and read the panel only. They run on rayon
//! (`parallel = true`) or sequentially, and the collected records are sorted,
//! so both modes return identical outcomes.

pub mod candidates;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use gl_core::{Error, Panel, Result, TreatmentSpec};
use rayon::prelude::*;
use serde::Serialize;
use statrs::statistics::Statistics;

pub use candidates::Candidates;

use crate::config::PowerConfig;
use crate::estimator::Estimator;
use crate::placebo::PlaceboTest;

/// One simulated test: a group, a window and an injected effect size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationRecord {
    /// Treated location identifiers.
    pub locations: Vec<String>,
    /// Treated location indices (sorted).
    pub location_ids: Vec<usize>,
    /// Test duration.
    pub duration: usize,
    /// Look-back offset.
    pub offset: usize,
    /// Injected relative lift.
    pub effect_size: f64,
    /// First treated time.
    pub treatment_start: usize,
    /// Last treated time.
    pub treatment_end: usize,
    /// Estimated percent lift.
    pub percent_lift: f64,
    /// Estimated cumulative lift.
    pub cumulative_lift: f64,
    /// Estimated average ATT.
    pub average_att: f64,
    /// Pre-period fit quality.
    pub scaled_l2_imbalance: f64,
    /// Placebo p-value.
    pub p_value: f64,
    /// Counted as a detection.
    pub significant: bool,
    /// cpic × |effect| × group outcome over the last `duration` periods.
    pub investment: f64,
    /// Group share of the panel's total outcome.
    pub proportion_total_y: f64,
    /// `1 - proportion_total_y`.
    pub holdout: f64,
}

/// A work item that could not be simulated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationFailure {
    /// Treated location identifiers.
    pub locations: Vec<String>,
    /// Treated location indices (sorted).
    pub location_ids: Vec<usize>,
    /// Test duration.
    pub duration: usize,
    /// Look-back offset.
    pub offset: usize,
    /// Effect sizes whose records are missing.
    pub effect_sizes: Vec<f64>,
    /// Error message.
    pub error: String,
}

/// Power of one group at one effect size, aggregated over offsets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerPoint {
    /// Treated location identifiers.
    pub locations: Vec<String>,
    /// Treated location indices (sorted).
    pub location_ids: Vec<usize>,
    /// Test duration.
    pub duration: usize,
    /// Injected relative lift.
    pub effect_size: f64,
    /// Share of significant offsets.
    pub power: f64,
    /// Mean of `average_att`.
    pub average_att: f64,
    /// Mean of `percent_lift`.
    pub average_percent_lift: f64,
    /// Mean of `scaled_l2_imbalance`.
    pub average_scaled_l2_imbalance: f64,
    /// Investment.
    pub investment: f64,
    /// Group share of the total outcome.
    pub proportion_total_y: f64,
    /// `1 - proportion_total_y`.
    pub holdout: f64,
    /// Offsets aggregated.
    pub n_offsets: usize,
}

/// Everything a simulation produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationOutcome {
    /// Records sorted by (locations, duration, offset, effect size).
    pub records: Vec<SimulationRecord>,
    /// Failed work items, in the same order.
    pub failures: Vec<SimulationFailure>,
    /// (group, duration) pairs dropped by the holdout or budget filters.
    pub n_pruned_candidates: usize,
    /// Effect sizes dropped by the budget filter.
    pub n_pruned_effects: usize,
    /// Work items dispatched.
    pub n_work_items: usize,
}

impl SimulationOutcome {
    /// Records lost to failed work items.
    pub fn n_omitted(&self) -> usize {
        self.failures.iter().map(|f| f.effect_sizes.len()).sum()
    }

    /// Power per (group, duration, effect size), in record order.
    pub fn power_curves(&self) -> Vec<PowerPoint> {
        let mut groups: BTreeMap<(&[usize], usize, u64), Vec<&SimulationRecord>> = BTreeMap::new();
        for r in &self.records {
            groups
                .entry((r.location_ids.as_slice(), r.duration, ordered_bits(r.effect_size)))
                .or_default()
                .push(r);
        }
        groups
            .into_values()
            .map(|rs| {
                let first = rs[0];
                let n = rs.len();
                PowerPoint {
                    locations: first.locations.clone(),
                    location_ids: first.location_ids.clone(),
                    duration: first.duration,
                    effect_size: first.effect_size,
                    power: rs.iter().filter(|r| r.significant).count() as f64 / n as f64,
                    average_att: rs.iter().map(|r| r.average_att).mean(),
                    average_percent_lift: rs.iter().map(|r| r.percent_lift).mean(),
                    average_scaled_l2_imbalance: rs.iter().map(|r| r.scaled_l2_imbalance).mean(),
                    investment: first.investment,
                    proportion_total_y: first.proportion_total_y,
                    holdout: first.holdout,
                    n_offsets: n,
                }
            })
            .collect()
    }
}

/// Map an `f64` to a `u64` with the same total order.
fn ordered_bits(v: f64) -> u64 {
    let b = v.to_bits();
    if b >> 63 == 1 { !b } else { b | (1 << 63) }
}

#[derive(Debug, Clone)]
struct WorkItem {
    group: Vec<usize>,
    duration: usize,
    offset: usize,
    effects: Vec<(f64, f64)>,
    proportion_total_y: f64,
}

enum ItemOutcome {
    Done(Vec<SimulationRecord>),
    Failed(SimulationFailure),
    Skipped,
}

/// Called with the number of finished work items after each one completes.
pub type ProgressFn = Arc<dyn Fn(usize) + Send + Sync>;

/// Combinatorial power simulator.
#[derive(Clone)]
pub struct PowerSimulator {
    config: PowerConfig,
    cancel: Option<Arc<AtomicBool>>,
    progress: Option<ProgressFn>,
}

impl fmt::Debug for PowerSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerSimulator")
            .field("config", &self.config)
            .field("cancel", &self.cancel)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl PowerSimulator {
    /// Create a simulator; fails on an invalid configuration.
    pub fn new(config: PowerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, cancel: None, progress: None })
    }

    /// Stop dispatching work items once `flag` is set.
    ///
    /// Items already running finish, but the run then returns `Error::Cancelled`
    /// and their records are discarded.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Report progress after every finished work item (successful or failed).
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Configuration.
    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    /// Run the simulation over `panel`.
    pub fn run(&self, panel: &Panel) -> Result<SimulationOutcome> {
        let cfg = &self.config;
        let includes = resolve_markets(panel, &cfg.include_markets)?;
        let excludes = resolve_markets(panel, &cfg.exclude_markets)?;
        let pool: Vec<usize> = (0..panel.n_locations()).filter(|l| !excludes.contains(l)).collect();
        if pool.is_empty() {
            return Err(Error::Configuration("no eligible locations after exclusions".into()));
        }

        let sizes: Vec<usize> = cfg
            .n
            .iter()
            .copied()
            .filter(|&n| n >= includes.len() && n <= pool.len() && n < panel.n_locations())
            .collect();
        if sizes.is_empty() {
            return Err(Error::Configuration(format!(
                "no group size in {:?} fits {} includes and a pool of {} locations",
                cfg.n,
                includes.len(),
                pool.len()
            )));
        }

        let t = panel.n_times();
        let durations: Vec<usize> = cfg
            .treatment_periods
            .iter()
            .copied()
            .filter(|&d| d + cfg.lookback_window <= t)
            .collect();
        if durations.is_empty() {
            return Err(Error::Configuration(format!(
                "no duration in {:?} leaves a pre-period with a look-back of {} in {t} periods",
                cfg.treatment_periods, cfg.lookback_window
            )));
        }
        if durations.len() < cfg.treatment_periods.len() {
            log::warn!("dropping durations too long for the panel: kept {durations:?}");
        }

        let total_y = panel.total_outcome();
        let pruned_candidates = AtomicUsize::new(0);
        let pruned_effects = AtomicUsize::new(0);
        let dispatched = AtomicUsize::new(0);

        let work = sizes
            .iter()
            .flat_map(|&n| {
                Candidates::new(panel, &pool, &includes, n, cfg.candidates, cfg.max_combinations)
            })
            .flat_map(|group| {
                let share = if total_y != 0.0 {
                    group.iter().map(|&l| panel.location_total(l)).sum::<f64>() / total_y
                } else {
                    0.0
                };
                let holdout_ok =
                    cfg.holdout.is_none_or(|(lo, hi)| (lo..=hi).contains(&(1.0 - share)));
                let mut items = Vec::new();
                for &d in &durations {
                    if !holdout_ok {
                        pruned_candidates.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let effects = self.affordable_effects(panel, &group, d, &pruned_effects);
                    if !effects.iter().any(|(e, _)| *e != 0.0) {
                        pruned_candidates.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    for offset in 0..cfg.lookback_window {
                        items.push(WorkItem {
                            group: group.clone(),
                            duration: d,
                            offset,
                            effects: effects.clone(),
                            proportion_total_y: share,
                        });
                    }
                }
                items
            })
            .inspect(|_| {
                dispatched.fetch_add(1, Ordering::Relaxed);
            });

        log::info!(
            "power simulation: {} locations x {t} periods, sizes {sizes:?}, \
             durations {durations:?}, {} effect sizes",
            panel.n_locations(),
            cfg.effect_sizes.len()
        );

        let estimator = Estimator::new(cfg.estimator.clone());
        // Placebo refits only fan out when the simulation itself is parallel.
        let inference = cfg.inference.clone().with_parallel(cfg.parallel && cfg.inference.parallel);
        let placebo = PlaceboTest::new(inference);
        let finished = AtomicUsize::new(0);
        let process = |item: WorkItem| -> ItemOutcome {
            if self.is_cancelled() {
                return ItemOutcome::Skipped;
            }
            let result = self.simulate(panel, &estimator, &placebo, &item);
            let n_finished = finished.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(progress) = &self.progress {
                progress(n_finished);
            }
            match result {
                Ok(records) => ItemOutcome::Done(records),
                Err(e) => {
                    log::warn!(
                        "simulation failed for {:?}, duration {}, offset {}: {e}",
                        item.group,
                        item.duration,
                        item.offset
                    );
                    ItemOutcome::Failed(SimulationFailure {
                        locations: names(panel, &item.group),
                        location_ids: item.group,
                        duration: item.duration,
                        offset: item.offset,
                        effect_sizes: item.effects.iter().map(|(e, _)| *e).collect(),
                        error: e.to_string(),
                    })
                }
            }
        };

        let outcomes: Vec<ItemOutcome> = if cfg.parallel {
            let run = || work.par_bridge().map(process).collect::<Vec<_>>();
            if cfg.n_threads > 0 {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(cfg.n_threads)
                    .build()
                    .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?;
                pool.install(run)
            } else {
                run()
            }
        } else {
            work.map(process).collect()
        };

        if self.is_cancelled() {
            return Err(Error::Cancelled("power simulation cancelled".into()));
        }

        let mut records = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Done(rs) => records.extend(rs),
                ItemOutcome::Failed(f) => failures.push(f),
                ItemOutcome::Skipped => {}
            }
        }
        records.sort_by(|a, b| {
            a.location_ids
                .cmp(&b.location_ids)
                .then(a.duration.cmp(&b.duration))
                .then(a.offset.cmp(&b.offset))
                .then(a.effect_size.total_cmp(&b.effect_size))
        });
        failures.sort_by(|a, b| {
            a.location_ids
                .cmp(&b.location_ids)
                .then(a.duration.cmp(&b.duration))
                .then(a.offset.cmp(&b.offset))
        });

        let outcome = SimulationOutcome {
            records,
            failures,
            n_pruned_candidates: pruned_candidates.into_inner(),
            n_pruned_effects: pruned_effects.into_inner(),
            n_work_items: dispatched.into_inner(),
        };
        log::info!(
            "power simulation done: {} records, {} failed items ({} records omitted), \
             {} pruned candidates",
            outcome.records.len(),
            outcome.failures.len(),
            outcome.n_omitted(),
            outcome.n_pruned_candidates
        );
        Ok(outcome)
    }

    /// Effect sizes within budget for `group` over `duration`, paired with their investment.
    fn affordable_effects(
        &self,
        panel: &Panel,
        group: &[usize],
        duration: usize,
        pruned: &AtomicUsize,
    ) -> Vec<(f64, f64)> {
        let t = panel.n_times();
        let recent = panel.window_total(group, t - duration + 1, t);
        self.config
            .effect_sizes
            .iter()
            .map(|&e| (e, self.config.cpic * e.abs() * recent))
            .filter(|&(e, investment)| {
                let ok = e == 0.0 || self.config.budget.is_none_or(|b| investment <= b);
                if !ok {
                    pruned.fetch_add(1, Ordering::Relaxed);
                }
                ok
            })
            .collect()
    }

    fn simulate(
        &self,
        panel: &Panel,
        estimator: &Estimator,
        placebo: &PlaceboTest,
        item: &WorkItem,
    ) -> Result<Vec<SimulationRecord>> {
        let t = panel.n_times();
        let end = t - item.offset;
        let start = end + 1 - item.duration;
        let spec = TreatmentSpec::from_indices(panel, item.group.clone(), start, end)?;
        let fit = estimator.fit(panel, &spec)?;
        let dist = placebo.distribution(panel, &spec, estimator)?;
        let locations = names(panel, &item.group);

        item.effects
            .iter()
            .map(|&(effect, investment)| {
                let injected = fit.with_injected_effect(effect);
                let inference = placebo.evaluate(&injected, &dist)?;
                let lift = injected.effect.percent_lift;
                let right_direction = effect == 0.0 || lift.signum() == effect.signum();
                Ok(SimulationRecord {
                    locations: locations.clone(),
                    location_ids: item.group.clone(),
                    duration: item.duration,
                    offset: item.offset,
                    effect_size: effect,
                    treatment_start: start,
                    treatment_end: end,
                    percent_lift: lift,
                    cumulative_lift: injected.effect.cumulative_lift,
                    average_att: injected.effect.average_att,
                    scaled_l2_imbalance: injected.effect.scaled_l2_imbalance,
                    p_value: inference.p_value,
                    significant: inference.significant && right_direction,
                    investment,
                    proportion_total_y: item.proportion_total_y,
                    holdout: 1.0 - item.proportion_total_y,
                })
            })
            .collect()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed))
    }
}

fn resolve_markets(panel: &Panel, markets: &[String]) -> Result<Vec<usize>> {
    let mut out = markets
        .iter()
        .map(|m| {
            panel
                .location_index(m)
                .ok_or_else(|| Error::Configuration(format!("market '{m}' is not in the panel")))
        })
        .collect::<Result<Vec<_>>>()?;
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

fn names(panel: &Panel, group: &[usize]) -> Vec<String> {
    group.iter().map(|&l| panel.location_name(l).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;

    fn flat_panel(n_loc: usize, n_times: usize) -> Panel {
        let locations = (0..n_loc).map(|i| format!("g{i:02}")).collect();
        let series = (0..n_loc)
            .map(|i| {
                (0..n_times).map(|t| 50.0 + i as f64 + ((t * (i + 2)) % 7) as f64 * 0.3).collect()
            })
            .collect();
        Panel::from_series(locations, series).unwrap()
    }

    fn small_config() -> PowerConfig {
        PowerConfig {
            treatment_periods: vec![5],
            n: vec![1],
            effect_sizes: vec![0.0, 0.3],
            lookback_window: 2,
            max_combinations: 3,
            parallel: false,
            inference: InferenceConfig::default().with_max_placebos(10),
            ..PowerConfig::default()
        }
    }

    #[test]
    fn test_records_cover_the_grid() {
        let panel = flat_panel(6, 30);
        let out = PowerSimulator::new(small_config()).unwrap().run(&panel).unwrap();
        assert_eq!(out.n_work_items, 3 * 2);
        assert_eq!(out.records.len() + out.n_omitted(), 3 * 2 * 2);
        let r = &out.records[0];
        assert_eq!(r.location_ids, vec![0]);
        assert_eq!((r.offset, r.treatment_start, r.treatment_end), (0, 26, 30));
        assert!((r.holdout + r.proportion_total_y - 1.0).abs() < 1e-12);

        let curves = out.power_curves();
        assert!(curves.iter().all(|p| (0.0..=1.0).contains(&p.power)));
        assert!(curves.iter().all(|p| p.n_offsets <= 2));
    }

    #[test]
    fn test_unknown_market_is_a_configuration_error() {
        let cfg = PowerConfig { include_markets: vec!["nowhere".into()], ..small_config() };
        let err = PowerSimulator::new(cfg).unwrap().run(&flat_panel(6, 30)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_no_eligible_duration() {
        let cfg = PowerConfig { treatment_periods: vec![29], ..small_config() };
        let err = PowerSimulator::new(cfg).unwrap().run(&flat_panel(6, 30)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_budget_prunes_before_simulation() {
        let cfg = PowerConfig { budget: Some(1.0), ..small_config() };
        let out = PowerSimulator::new(cfg).unwrap().run(&flat_panel(6, 30)).unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.n_work_items, 0);
        assert_eq!(out.n_pruned_candidates, 3);
        assert_eq!(out.n_pruned_effects, 3);
    }

    #[test]
    fn test_holdout_filter() {
        // Each single location holds about 1/6 of the total, so holdout ~ 0.83.
        let cfg = PowerConfig { holdout: Some((0.9, 1.0)), ..small_config() };
        let out = PowerSimulator::new(cfg).unwrap().run(&flat_panel(6, 30)).unwrap();
        assert_eq!(out.n_work_items, 0);
        assert_eq!(out.n_pruned_candidates, 3);
    }

    #[test]
    fn test_cancelled_before_start() {
        let flag = Arc::new(AtomicBool::new(true));
        let sim = PowerSimulator::new(small_config()).unwrap().with_cancel_flag(flag);
        assert!(matches!(sim.run(&flat_panel(6, 30)), Err(Error::Cancelled(_))));
    }

    #[test]
    fn test_cancelled_mid_run_discards_finished_items() {
        let flag = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let progress: ProgressFn = {
            let flag = Arc::clone(&flag);
            let calls = Arc::clone(&calls);
            Arc::new(move |n| {
                calls.fetch_add(1, Ordering::Relaxed);
                if n == 1 {
                    flag.store(true, Ordering::Relaxed);
                }
            })
        };
        let sim = PowerSimulator::new(small_config())
            .unwrap()
            .with_cancel_flag(Arc::clone(&flag))
            .with_progress(progress);
        assert!(matches!(sim.run(&flat_panel(6, 30)), Err(Error::Cancelled(_))));
        // Sequential: the remaining five items are skipped without running.
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cancelled_mid_parallel_run() {
        let flag = Arc::new(AtomicBool::new(false));
        let progress: ProgressFn = {
            let flag = Arc::clone(&flag);
            Arc::new(move |_| flag.store(true, Ordering::Relaxed))
        };
        let cfg = PowerConfig { parallel: true, n_threads: 2, ..small_config() };
        let sim = PowerSimulator::new(cfg)
            .unwrap()
            .with_cancel_flag(Arc::clone(&flag))
            .with_progress(progress);
        assert!(matches!(sim.run(&flat_panel(6, 30)), Err(Error::Cancelled(_))));
    }

    #[test]
    fn test_progress_counts_every_item() {
        let seen = Arc::new(AtomicUsize::new(0));
        let progress: ProgressFn = {
            let seen = Arc::clone(&seen);
            Arc::new(move |n| {
                seen.fetch_max(n, Ordering::Relaxed);
            })
        };
        let sim = PowerSimulator::new(small_config()).unwrap().with_progress(progress);
        let out = sim.run(&flat_panel(6, 30)).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), out.n_work_items);
    }

    #[test]
    fn test_ordered_bits_preserves_order() {
        let vals = [-1.0, -0.05, 0.0, 0.05, 0.1, 2.0];
        for w in vals.windows(2) {
            assert!(ordered_bits(w[0]) < ordered_bits(w[1]));
        }
    }
}
