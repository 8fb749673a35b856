use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use whale_engine::{BootstrapState, Detector, ReservoirState, Thresholds};

/// Serialized per-day reservoir: samples and total observation count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReservoirData {
    #[serde(rename = "s")]
    pub samples: Vec<f64>,
    #[serde(rename = "c")]
    pub count: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BootstrapData {
    pub p99: f64,
    pub p999: f64,
    pub bootstrapped: bool,
}

/// Full rolling-window snapshot, the on-disk `detector.json` shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectorSnapshot {
    pub window_days: usize,
    pub samples_per_day: usize,
    pub reservoirs: BTreeMap<NaiveDate, ReservoirData>,
    /// Kept for format compatibility; the sorted reservoir keys are
    /// authoritative on load.
    pub date_order: Vec<NaiveDate>,
    #[serde(default)]
    pub bootstrap: BootstrapData,
}

impl DetectorSnapshot {
    pub fn from_detector(detector: &Detector) -> Self {
        let reservoirs: BTreeMap<NaiveDate, ReservoirData> = detector
            .export_state()
            .into_iter()
            .map(|(date, state)| {
                (
                    date,
                    ReservoirData {
                        samples: state.samples,
                        count: state.count,
                    },
                )
            })
            .collect();
        let date_order = reservoirs.keys().copied().collect();
        let bootstrap = detector.export_bootstrap();
        Self {
            window_days: detector.window_days(),
            samples_per_day: detector.samples_per_day(),
            reservoirs,
            date_order,
            bootstrap: BootstrapData {
                p99: bootstrap.thresholds.p99,
                p999: bootstrap.thresholds.p999,
                bootstrapped: bootstrap.bootstrapped,
            },
        }
    }

    /// Restores this snapshot into a detector.
    pub fn apply_to(&self, detector: &mut Detector) {
        let reservoirs: BTreeMap<NaiveDate, ReservoirState> = self
            .reservoirs
            .iter()
            .map(|(&date, data)| {
                (
                    date,
                    ReservoirState {
                        samples: data.samples.clone(),
                        count: data.count,
                    },
                )
            })
            .collect();
        detector.import_state(reservoirs);
        detector.import_bootstrap(BootstrapState {
            thresholds: Thresholds {
                p99: self.bootstrap.p99,
                p999: self.bootstrap.p999,
            },
            bootstrapped: self.bootstrap.bootstrapped,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut detector = Detector::new(7, 100);
        let day: NaiveDate = "2020-01-01".parse().unwrap();
        for i in 0..250 {
            detector.add_sample(day, i as f64);
        }

        let snapshot = DetectorSnapshot::from_detector(&detector);
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: DetectorSnapshot = serde_json::from_str(&json).unwrap();

        let mut restored = Detector::new(7, 100);
        parsed.apply_to(&mut restored);

        assert_eq!(detector.stats(), restored.stats());
        let probe: NaiveDate = "2020-01-02".parse().unwrap();
        assert_eq!(detector.get_thresholds(probe), restored.get_thresholds(probe));
    }

    #[test]
    fn json_uses_short_reservoir_keys_and_iso_dates() {
        let mut detector = Detector::new(7, 10);
        detector.add_sample("2020-01-01".parse().unwrap(), 1.5);
        let snapshot = DetectorSnapshot::from_detector(&detector);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();

        let reservoir = &value["reservoirs"]["2020-01-01"];
        assert_eq!(reservoir["s"][0], 1.5);
        assert_eq!(reservoir["c"], 1);
        assert_eq!(value["date_order"][0], "2020-01-01");
        assert_eq!(value["window_days"], 7);
        assert_eq!(value["bootstrap"]["bootstrapped"], false);
    }
}
