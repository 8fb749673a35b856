// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Whale-trade detection over a rolling multi-day percentile window.
//!
//! A per-day [`Reservoir`] keeps a bounded uniform sample of trade
//! quantities; [`RollingPercentile`] derives P99/P99.9 thresholds for a date
//! from the reservoirs of strictly earlier days; [`Detector`] caches those
//! thresholds and classifies individual trades.

mod detector;
mod percentile;
mod reservoir;

pub use detector::{Classification, Detector};
pub use percentile::{percentile, BootstrapState, ReservoirState, RollingPercentile, Thresholds};
pub use reservoir::Reservoir;
