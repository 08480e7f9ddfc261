//! `parallel = false` keeps every fit on the calling thread.
//!
//! The crate logs a `debug!` line per weight fit; a recording logger notes the
//! thread each line came from. The logger is process-global, so this binary
//! holds a single test.

use std::collections::HashSet;
use std::sync::Mutex;
use std::thread::{self, ThreadId};

use gl_inference::{InferenceConfig, Panel, PowerConfig, PowerSimulator};

struct ThreadRecorder {
    threads: Mutex<Vec<ThreadId>>,
}

impl log::Log for ThreadRecorder {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.target().starts_with("gl_inference")
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata())
            && let Ok(mut threads) = self.threads.lock()
        {
            threads.push(thread::current().id());
        }
    }

    fn flush(&self) {}
}

static RECORDER: ThreadRecorder = ThreadRecorder { threads: Mutex::new(Vec::new()) };

fn wavy_panel(n_loc: usize, n_times: usize) -> Panel {
    let locations = (0..n_loc).map(|l| format!("geo{l:02}")).collect();
    let series = (0..n_loc)
        .map(|l| {
            (0..n_times)
                .map(|t| 80.0 + 2.0 * l as f64 + 3.0 * (0.5 * t as f64 + 0.7 * l as f64).sin())
                .collect()
        })
        .collect();
    Panel::from_series(locations, series).unwrap()
}

fn recorded_threads() -> HashSet<ThreadId> {
    let mut threads = RECORDER.threads.lock().unwrap();
    threads.drain(..).collect()
}

#[test]
fn sequential_run_stays_on_the_calling_thread() {
    log::set_logger(&RECORDER).unwrap();
    log::set_max_level(log::LevelFilter::Debug);
    let panel = wavy_panel(10, 36);
    let config = PowerConfig {
        treatment_periods: vec![5],
        n: vec![1, 2],
        effect_sizes: vec![0.0, 0.1],
        lookback_window: 2,
        max_combinations: 3,
        parallel: false,
        inference: InferenceConfig::default().with_max_placebos(12),
        ..PowerConfig::default()
    };

    let out = PowerSimulator::new(config.clone()).unwrap().run(&panel).unwrap();
    assert!(!out.records.is_empty());
    let threads = recorded_threads();
    assert_eq!(threads, HashSet::from([thread::current().id()]));

    // Same simulation with parallelism on still produces the same outcome.
    let parallel = PowerSimulator::new(PowerConfig { parallel: true, ..config }).unwrap();
    assert_eq!(parallel.run(&panel).unwrap(), out);
    assert!(!recorded_threads().is_empty());
}
