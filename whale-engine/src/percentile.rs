use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::reservoir::Reservoir;

/// Samples buffered before the bootstrap thresholds are computed.
const BOOTSTRAP_SAMPLE_COUNT: usize = 50_000;

/// Percentile thresholds used for whale classification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub p99: f64,
    pub p999: f64,
}

impl Default for Thresholds {
    /// Conservative base-asset fallbacks used before any history or
    /// bootstrap data exists.
    fn default() -> Self {
        Self {
            p99: 5.0,
            p999: 20.0,
        }
    }
}

/// Serializable reservoir snapshot.
#[derive(Clone, Debug)]
pub struct ReservoirState {
    pub samples: Vec<f64>,
    pub count: u64,
}

/// Serializable bootstrap snapshot.
#[derive(Clone, Copy, Debug)]
pub struct BootstrapState {
    pub thresholds: Thresholds,
    pub bootstrapped: bool,
}

/// Sliding window of per-day quantity reservoirs.
///
/// Thresholds for a date are computed from the reservoirs of strictly
/// earlier days only, so classification never sees its own day. Until
/// history exists, thresholds come from a bootstrap pass over the first
/// 50 000 samples in arrival order, regardless of how those samples are
/// spread across dates. That arrival-order behavior is part of the
/// checkpoint format and must not change.
pub struct RollingPercentile {
    window_days: usize,
    samples_per_day: usize,
    daily: BTreeMap<NaiveDate, Reservoir>,
    bootstrap_buffer: Vec<f64>,
    bootstrap_thresholds: Thresholds,
    bootstrapped: bool,
}

impl RollingPercentile {
    pub fn new(window_days: usize, samples_per_day: usize) -> Self {
        Self {
            window_days,
            samples_per_day,
            daily: BTreeMap::new(),
            bootstrap_buffer: Vec::new(),
            bootstrap_thresholds: Thresholds::default(),
            bootstrapped: false,
        }
    }

    pub fn window_days(&self) -> usize {
        self.window_days
    }

    pub fn samples_per_day(&self) -> usize {
        self.samples_per_day
    }

    /// Records one trade quantity under its calendar date.
    pub fn add_sample(&mut self, date: NaiveDate, qty: f64) {
        if !self.bootstrapped {
            self.bootstrap_buffer.push(qty);
            if self.bootstrap_buffer.len() >= BOOTSTRAP_SAMPLE_COUNT {
                self.compute_bootstrap_thresholds();
            }
        }
        self.daily
            .entry(date)
            .or_insert_with(|| Reservoir::new(self.samples_per_day))
            .add(qty);
    }

    fn compute_bootstrap_thresholds(&mut self) {
        let mut sorted = self.bootstrap_buffer.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        self.bootstrap_thresholds = Thresholds {
            p99: percentile(&sorted, 99.0),
            p999: percentile(&sorted, 99.9),
        };
        self.bootstrapped = true;
        self.bootstrap_buffer = Vec::new();
    }

    /// P99/P99.9 thresholds for `date`, from the last `window_days` days
    /// strictly before it. Strict less-than is what rules out look-ahead.
    pub fn get_thresholds(&self, date: NaiveDate) -> Thresholds {
        let window: Vec<&Reservoir> = self
            .daily
            .range(..date)
            .rev()
            .take(self.window_days)
            .map(|(_, reservoir)| reservoir)
            .collect();

        let mut all_samples: Vec<f64> = window
            .iter()
            .flat_map(|reservoir| reservoir.as_slice().iter().copied())
            .collect();

        if all_samples.is_empty() {
            if self.bootstrapped {
                return self.bootstrap_thresholds;
            }
            return Thresholds::default();
        }

        all_samples.sort_by(|a, b| a.total_cmp(b));
        Thresholds {
            p99: percentile(&all_samples, 99.0),
            p999: percentile(&all_samples, 99.9),
        }
    }

    /// True once `window_days` full days precede `date`.
    pub fn has_enough_data(&self, date: NaiveDate) -> bool {
        self.daily.range(..date).count() >= self.window_days
    }

    /// Drops days no longer reachable by any future window; keeps a
    /// `window_days + 1` tail ending before `current_date`.
    pub fn prune(&mut self, current_date: NaiveDate) {
        let total = self.daily.len();
        let mut stale = Vec::new();
        for (i, (&date, _)) in self.daily.iter().enumerate() {
            if date >= current_date || total - i <= self.window_days + 1 {
                break;
            }
            stale.push(date);
        }
        for date in stale {
            self.daily.remove(&date);
        }
    }

    /// (tracked days, samples currently stored across them).
    pub fn stats(&self) -> (usize, usize) {
        let total = self.daily.values().map(Reservoir::size).sum();
        (self.daily.len(), total)
    }

    pub fn export_state(&self) -> BTreeMap<NaiveDate, ReservoirState> {
        self.daily
            .iter()
            .map(|(&date, reservoir)| {
                let (samples, count) = reservoir.export_state();
                (date, ReservoirState { samples, count })
            })
            .collect()
    }

    pub fn export_bootstrap(&self) -> BootstrapState {
        BootstrapState {
            thresholds: self.bootstrap_thresholds,
            bootstrapped: self.bootstrapped,
        }
    }

    pub fn import_state(&mut self, reservoirs: BTreeMap<NaiveDate, ReservoirState>) {
        self.daily = reservoirs
            .into_iter()
            .map(|(date, state)| {
                (
                    date,
                    Reservoir::from_samples(self.samples_per_day, state.samples, state.count),
                )
            })
            .collect();
    }

    pub fn import_bootstrap(&mut self, state: BootstrapState) {
        self.bootstrap_thresholds = state.thresholds;
        self.bootstrapped = state.bootstrapped;
        if self.bootstrapped {
            self.bootstrap_buffer = Vec::new();
        }
    }
}

/// Linear-interpolated percentile of an ascending-sorted slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank as usize;
    let upper = lower + 1;
    if upper >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    let frac = rank - lower as f64;
    sorted[lower] + frac * (sorted[upper] - sorted[lower])
}
