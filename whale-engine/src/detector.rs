use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use core_types::types::Trade;
use parking_lot::RwLock;

use crate::percentile::{BootstrapState, ReservoirState, RollingPercentile, Thresholds};

/// Whale flags for a single trade.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub is_whale_p99: bool,
    pub is_whale_p999: bool,
}

/// Classifies trades against rolling percentile thresholds, with a per-date
/// threshold cache invalidated whenever that date receives a new sample.
pub struct Detector {
    rolling: RollingPercentile,
    cache: RwLock<HashMap<NaiveDate, Thresholds>>,
}

impl Detector {
    pub fn new(window_days: usize, samples_per_day: usize) -> Self {
        Self {
            rolling: RollingPercentile::new(window_days, samples_per_day),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn window_days(&self) -> usize {
        self.rolling.window_days()
    }

    pub fn samples_per_day(&self) -> usize {
        self.rolling.samples_per_day()
    }

    /// Feeds a trade quantity into the rolling window and drops the cached
    /// thresholds for that date.
    pub fn add_sample(&mut self, date: NaiveDate, qty: f64) {
        self.rolling.add_sample(date, qty);
        self.cache.write().remove(&date);
    }

    pub fn classify(&self, trade: &Trade) -> Classification {
        let thresholds = self.get_thresholds(trade.date());
        Classification {
            is_whale_p99: trade.qty >= thresholds.p99,
            is_whale_p999: trade.qty >= thresholds.p999,
        }
    }

    /// Classifies a batch, re-resolving thresholds only when the date
    /// changes between consecutive trades.
    pub fn classify_batch(&self, trades: &[Trade]) -> Vec<Classification> {
        let mut results = Vec::with_capacity(trades.len());
        let mut current: Option<(NaiveDate, Thresholds)> = None;
        for trade in trades {
            let date = trade.date();
            let thresholds = match current {
                Some((cached_date, thresholds)) if cached_date == date => thresholds,
                _ => {
                    let thresholds = self.get_thresholds(date);
                    current = Some((date, thresholds));
                    thresholds
                }
            };
            results.push(Classification {
                is_whale_p99: trade.qty >= thresholds.p99,
                is_whale_p999: trade.qty >= thresholds.p999,
            });
        }
        results
    }

    pub fn get_thresholds(&self, date: NaiveDate) -> Thresholds {
        if let Some(thresholds) = self.cache.read().get(&date) {
            return *thresholds;
        }
        let thresholds = self.rolling.get_thresholds(date);
        self.cache.write().insert(date, thresholds);
        thresholds
    }

    pub fn has_enough_data(&self, date: NaiveDate) -> bool {
        self.rolling.has_enough_data(date)
    }

    /// Drops window days and cached thresholds older than `current_date`.
    pub fn prune(&mut self, current_date: NaiveDate) {
        self.rolling.prune(current_date);
        self.cache.write().retain(|date, _| *date >= current_date);
    }

    /// (tracked days, stored samples).
    pub fn stats(&self) -> (usize, usize) {
        self.rolling.stats()
    }

    pub fn export_state(&self) -> BTreeMap<NaiveDate, ReservoirState> {
        self.rolling.export_state()
    }

    pub fn export_bootstrap(&self) -> BootstrapState {
        self.rolling.export_bootstrap()
    }

    pub fn import_state(&mut self, reservoirs: BTreeMap<NaiveDate, ReservoirState>) {
        self.rolling.import_state(reservoirs);
        self.cache.write().clear();
    }

    pub fn import_bootstrap(&mut self, state: BootstrapState) {
        self.rolling.import_bootstrap(state);
    }
}
