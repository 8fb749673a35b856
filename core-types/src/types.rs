// Copyright (c) James Kassemi, SC, US. All rights reserved.

use chrono::{DateTime, NaiveDate, Timelike, Utc};

/// Microsecond/millisecond boundary for the timestamp heuristic. Binance
/// spot archives carry milliseconds, futures archives microseconds.
const MICROS_THRESHOLD: i64 = 1_000_000_000_000_000;

/// A single aggregated trade.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Trade {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub qty: f64,
    pub is_buyer_maker: bool,
}

impl Trade {
    /// Taker buy: the buyer was not the resting order.
    pub fn is_buy(&self) -> bool {
        !self.is_buyer_maker
    }

    pub fn is_sell(&self) -> bool {
        self.is_buyer_maker
    }

    pub fn dollar_volume(&self) -> f64 {
        self.price * self.qty
    }

    /// UTC clock hour containing this trade.
    pub fn hour(&self) -> DateTime<Utc> {
        let secs = self.time.timestamp();
        DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(self.time)
    }

    /// UTC calendar date of the trade.
    pub fn date(&self) -> NaiveDate {
        self.time.date_naive()
    }

    /// Minute within the hour (0-59).
    pub fn minute(&self) -> u32 {
        self.time.minute()
    }
}

/// Intermediate parse result carrying the raw integer timestamp.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawTrade {
    pub agg_id: i64,
    pub price: f64,
    pub qty: f64,
    pub timestamp: i64,
    pub is_buyer_maker: bool,
}

impl RawTrade {
    /// Resolves the raw timestamp into a UTC instant. Values above 1e15 are
    /// microseconds, everything else milliseconds. Returns `None` for
    /// timestamps outside the representable range.
    pub fn to_trade(&self) -> Option<Trade> {
        let time = if self.timestamp > MICROS_THRESHOLD {
            DateTime::from_timestamp_micros(self.timestamp)?
        } else {
            DateTime::from_timestamp_millis(self.timestamp)?
        };
        Some(Trade {
            time,
            price: self.price,
            qty: self.qty,
            is_buyer_maker: self.is_buyer_maker,
        })
    }
}
