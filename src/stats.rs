//! Statistics of a fuzzing session
#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};

use std::time::{Duration, Instant};

use crate::addrs::PAGE_SIZE;
use crate::utils::pretty_size;

/// Counters of a fuzzing session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzStats {
    /// Executions since the session started, including the first execution
    pub iterations: u64,

    /// Unique addresses reached by any execution
    pub coverage: u64,

    /// Addresses discovered since the last report
    pub new_coverage: u64,

    /// Pages supplied for instruction fetches
    pub code_pages: u64,

    /// Pages supplied for data accesses
    pub data_pages: u64,

    /// Inputs in the corpus
    pub corpus_size: u64,

    /// Executions that ended in a crash
    pub crashes: u64,

    /// Crashes with a key never seen before
    pub unique_crashes: u64,

    /// Wall clock time of the session
    pub elapsed: Duration,
}

/// Periodic [`FuzzStats`] reporter
#[derive(Debug)]
pub(crate) struct StatsReporter {
    /// Time between reports. Zero disables reporting.
    interval: Duration,

    /// Start of the session
    start: Instant,

    /// Start of the current report window
    window_start: Instant,

    /// Iterations at the start of the current window
    window_iterations: u64,
}

impl StatsReporter {
    /// Start a reporter at the current time
    pub(crate) fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            interval,
            start: now,
            window_start: now,
            window_iterations: 0,
        }
    }

    /// Time since the session started
    pub(crate) fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Log `stats` if the report window has passed
    pub(crate) fn update(&mut self, stats: &mut FuzzStats) {
        if self.interval.is_zero() || self.window_start.elapsed() < self.interval {
            return;
        }

        self.report(stats);
    }

    /// Log `stats` and start a new report window
    pub(crate) fn report(&mut self, stats: &mut FuzzStats) {
        let window = self.window_start.elapsed().as_secs_f64();
        let executions = stats.iterations - self.window_iterations;
        let exec_per_sec = if window > 0.0 {
            executions as f64 / window
        } else {
            0.0
        };

        stats.elapsed = self.elapsed();

        log::info!(
            "{} executions, {:.0} exec/s, coverage {}, new {}, code {}, data {}, corpus {}, crashes {} ({} unique)",
            stats.iterations,
            exec_per_sec,
            stats.coverage,
            stats.new_coverage,
            pretty_size(stats.code_pages * PAGE_SIZE),
            pretty_size(stats.data_pages * PAGE_SIZE),
            stats.corpus_size,
            stats.crashes,
            stats.unique_crashes,
        );

        stats.new_coverage = 0;
        self.window_start = Instant::now();
        self.window_iterations = stats.iterations;
    }
}
