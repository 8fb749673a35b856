// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Streaming hourly aggregation of trades with whale classification.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use core_types::types::Trade;
use whale_engine::Detector;

mod bar;

pub use bar::HourlyBar;

/// A finalized (or finalizable) hourly bar with its hour start.
#[derive(Clone, Debug, PartialEq)]
pub struct HourlyRecord {
    pub time: DateTime<Utc>,
    pub bar: HourlyBar,
}

/// Consumes trade batches, feeds the whale detector, and accumulates
/// hour-keyed bars.
///
/// Bars are deliberately not finalized while batches stream in; an hour can
/// receive more trades from a later batch. Finalization happens in
/// [`Aggregator::get_bars_for_month`] at checkpoint time, or in
/// [`Aggregator::flush`] at the very end of a run.
pub struct Aggregator {
    detector: Detector,
    pending: HashMap<DateTime<Utc>, HourlyBar>,
    finalized: Vec<HourlyRecord>,
    first_date: Option<NaiveDate>,
    last_date: Option<NaiveDate>,
}

impl Aggregator {
    pub fn new(window_days: usize, samples_per_day: usize) -> Self {
        Self {
            detector: Detector::new(window_days, samples_per_day),
            pending: HashMap::new(),
            finalized: Vec::new(),
            first_date: None,
            last_date: None,
        }
    }

    /// Processes one batch in two passes: sample every quantity first, then
    /// classify and fold. Classification only reads strictly earlier days,
    /// so sampling a trade before classifying it cannot leak the trade into
    /// its own thresholds; the two passes just make intra-batch date
    /// ordering irrelevant.
    pub fn process_trades(&mut self, trades: &[Trade]) {
        if trades.is_empty() {
            return;
        }

        for trade in trades {
            let date = trade.date();
            self.detector.add_sample(date, trade.qty);
            if self.first_date.map_or(true, |first| date < first) {
                self.first_date = Some(date);
            }
            if self.last_date.map_or(true, |last| date > last) {
                self.last_date = Some(date);
            }
        }

        let classifications = self.detector.classify_batch(trades);
        for (trade, class) in trades.iter().zip(classifications) {
            let bar = self.pending.entry(trade.hour()).or_default();
            bar.add_trade(
                trade.price,
                trade.qty,
                trade.is_buy(),
                trade.minute(),
                class.is_whale_p99,
                class.is_whale_p999,
            );
        }
    }

    /// Extracts, finalizes and returns every bar whose hour falls in the
    /// given `YYYY-MM` month, removing them from internal state so the next
    /// month cannot double-count.
    pub fn get_bars_for_month(&mut self, month: &str) -> Vec<HourlyRecord> {
        let mut result = Vec::new();

        let mut remaining = Vec::with_capacity(self.finalized.len());
        for record in self.finalized.drain(..) {
            if month_label(record.time) == month {
                result.push(record);
            } else {
                remaining.push(record);
            }
        }
        self.finalized = remaining;

        let hours: Vec<DateTime<Utc>> = self
            .pending
            .keys()
            .filter(|hour| month_label(**hour) == month)
            .copied()
            .collect();
        for hour in hours {
            if let Some(mut bar) = self.pending.remove(&hour) {
                bar.finalize();
                result.push(HourlyRecord { time: hour, bar });
            }
        }

        result.sort_by_key(|record| record.time);
        result
    }

    /// Finalizes all pending bars in hour order.
    pub fn flush(&mut self) {
        let mut hours: Vec<DateTime<Utc>> = self.pending.keys().copied().collect();
        hours.sort();
        for hour in hours {
            if let Some(mut bar) = self.pending.remove(&hour) {
                bar.finalize();
                self.finalized.push(HourlyRecord { time: hour, bar });
            }
        }
    }

    /// Drains every bar, pending ones finalized, sorted by hour. Terminal.
    pub fn get_all_bars(&mut self) -> Vec<HourlyRecord> {
        self.flush();
        let mut all: Vec<HourlyRecord> = self.finalized.drain(..).collect();
        all.sort_by_key(|record| record.time);
        all
    }

    pub fn total_trades(&self) -> u64 {
        let pending: u64 = self.pending.values().map(|bar| bar.n_trades).sum();
        let finalized: u64 = self.finalized.iter().map(|record| record.bar.n_trades).sum();
        pending + finalized
    }

    /// (pending bars, finalized bars, seen date range).
    pub fn stats(&self) -> (usize, usize, Option<(NaiveDate, NaiveDate)>) {
        let range = match (self.first_date, self.last_date) {
            (Some(first), Some(last)) => Some((first, last)),
            _ => None,
        };
        (self.pending.len(), self.finalized.len(), range)
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut Detector {
        &mut self.detector
    }
}

fn month_label(time: DateTime<Utc>) -> String {
    time.format("%Y-%m").to_string()
}
