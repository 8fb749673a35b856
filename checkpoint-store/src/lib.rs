// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Crash-consistent persistence for the ingestion pipeline.
//!
//! Layout under the checkpoint directory:
//! - `state.json`: completed-month list; written last, marks completion.
//! - `detector.json`: rolling-window snapshot.
//! - `bars/<YYYY-MM>.json`: finalized hourly bars per month.
//!
//! Every write lands in a `.tmp` sibling, is synced, then renamed over the
//! final path. A crash between the three files of a month's checkpoint
//! leaves `state.json` without that month, so a restart recomputes it
//! rather than skipping it.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod bars;
mod snapshot;

pub use bars::SerializedBar;
pub use snapshot::DetectorSnapshot;

use aggregations::HourlyRecord;
use whale_engine::Detector;

const CURRENT_VERSION: u32 = 1;
const STATE_FILE: &str = "state.json";
const DETECTOR_FILE: &str = "detector.json";
const BARS_DIR: &str = "bars";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Completed-month ledger. A month listed here has its bars file and the
/// detector snapshot taken after it durably on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineState {
    pub version: u32,
    pub completed_months: Vec<String>,
    pub last_update: DateTime<Utc>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            completed_months: Vec::new(),
            last_update: DateTime::UNIX_EPOCH,
        }
    }
}

impl PipelineState {
    pub fn is_completed(&self, month: &str) -> bool {
        self.completed_months.iter().any(|m| m == month)
    }

    /// Requested months minus completed ones, input order preserved.
    pub fn pending_months(&self, all_months: &[String]) -> Vec<String> {
        all_months
            .iter()
            .filter(|month| !self.is_completed(month))
            .cloned()
            .collect()
    }
}

/// Handles the on-disk checkpoint triple.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bars_dir(&self) -> PathBuf {
        self.dir.join(BARS_DIR)
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn detector_path(&self) -> PathBuf {
        self.dir.join(DETECTOR_FILE)
    }

    /// Loads prior state. Missing, unparseable or version-mismatched files
    /// all mean "no prior state"; the pipeline rebuilds from scratch.
    pub fn load_state(&self) -> Result<Option<PipelineState>, CheckpointError> {
        let path = self.state_path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state: PipelineState = match serde_json::from_slice(&data) {
            Ok(state) => state,
            Err(err) => {
                warn!("corrupt state file {}: {err}; rebuilding", path.display());
                return Ok(None);
            }
        };
        if state.version != CURRENT_VERSION {
            warn!(
                "state version {} != {}; rebuilding",
                state.version, CURRENT_VERSION
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Persists the state, stamping version and update time. Call only
    /// after the month's bars and detector snapshot are durable.
    pub fn save_state(&self, state: &mut PipelineState) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;
        state.version = CURRENT_VERSION;
        state.last_update = Utc::now();
        let data = serde_json::to_vec_pretty(state)?;
        atomic_write(&self.state_path(), &data)
    }

    pub fn save_detector(&self, detector: &Detector) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;
        let snapshot = DetectorSnapshot::from_detector(detector);
        let data = serde_json::to_vec(&snapshot)?;
        atomic_write(&self.detector_path(), &data)
    }

    pub fn load_detector(&self) -> Result<Option<DetectorSnapshot>, CheckpointError> {
        let path = self.detector_path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&data) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) => {
                warn!(
                    "corrupt detector snapshot {}: {err}; rebuilding",
                    path.display()
                );
                Ok(None)
            }
        }
    }

    pub fn save_month_bars(
        &self,
        month: &str,
        bars: &[HourlyRecord],
    ) -> Result<(), CheckpointError> {
        let dir = self.bars_dir();
        std::fs::create_dir_all(&dir)?;
        let serialized: Vec<SerializedBar> = bars.iter().map(SerializedBar::from).collect();
        let data = serde_json::to_vec(&serialized)?;
        atomic_write(&dir.join(format!("{month}.json")), &data)
    }

    pub fn load_month_bars(&self, month: &str) -> Result<Option<Vec<HourlyRecord>>, CheckpointError> {
        let path = self.bars_dir().join(format!("{month}.json"));
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<Vec<SerializedBar>>(&data) {
            Ok(serialized) => Ok(Some(
                serialized.iter().map(SerializedBar::to_record).collect(),
            )),
            Err(err) => {
                warn!("corrupt bars file {}: {err}; rebuilding", path.display());
                Ok(None)
            }
        }
    }

    /// Bars of every listed month, merged and sorted by hour.
    pub fn load_all_bars(&self, months: &[String]) -> Result<Vec<HourlyRecord>, CheckpointError> {
        let mut all = Vec::new();
        for month in months {
            if let Some(bars) = self.load_month_bars(month)? {
                all.extend(bars);
            }
        }
        all.sort_by_key(|record| record.time);
        Ok(all)
    }

    /// Removes the entire checkpoint directory.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// tmp-write, sync, rename. The rename is the commit point.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), CheckpointError> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = (|| -> Result<(), CheckpointError> {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregations::HourlyBar;
    use tempfile::tempdir;

    fn record(ts: i64, n_trades: u64) -> HourlyRecord {
        let mut bar = HourlyBar::default();
        for _ in 0..n_trades {
            bar.add_trade(100.0, 1.0, true, 0, false, false);
        }
        bar.finalize();
        HourlyRecord {
            time: DateTime::from_timestamp(ts, 0).unwrap(),
            bar,
        }
    }

    #[test]
    fn missing_state_means_fresh_start() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        assert!(manager.load_state().unwrap().is_none());
    }

    #[test]
    fn state_round_trips() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let mut state = PipelineState::default();
        state.completed_months.push("2020-01".to_string());
        manager.save_state(&mut state).unwrap();

        let loaded = manager.load_state().unwrap().unwrap();
        assert_eq!(loaded.completed_months, vec!["2020-01"]);
        assert!(loaded.is_completed("2020-01"));
        assert!(!loaded.is_completed("2020-02"));
        assert!(loaded.last_update > DateTime::UNIX_EPOCH);
    }

    #[test]
    fn corrupt_state_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(manager.state_path(), b"{ not json").unwrap();
        assert!(manager.load_state().unwrap().is_none());
    }

    #[test]
    fn version_mismatch_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        std::fs::write(
            manager.state_path(),
            br#"{"version":2,"completed_months":["2020-01"],"last_update":"2020-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(manager.load_state().unwrap().is_none());
    }

    #[test]
    fn pending_months_filters_completed() {
        let mut state = PipelineState::default();
        state.completed_months.push("2020-01".to_string());
        let all = vec!["2020-01".to_string(), "2020-02".to_string()];
        assert_eq!(state.pending_months(&all), vec!["2020-02"]);
    }

    #[test]
    fn atomic_write_leaves_no_tmp_and_survives_stale_tmp() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        // Stale tmp from a crashed run must not confuse a fresh save.
        std::fs::write(dir.path().join("state.json.tmp"), b"garbage").unwrap();

        let mut state = PipelineState::default();
        manager.save_state(&mut state).unwrap();
        assert!(!dir.path().join("state.json.tmp").exists());
        assert!(manager.load_state().unwrap().is_some());
    }

    #[test]
    fn bars_round_trip_sorted() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let bars = vec![record(1_577_840_400, 2), record(1_577_836_800, 1)];
        manager.save_month_bars("2020-01", &bars).unwrap();

        let loaded = manager.load_month_bars("2020-01").unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].bar.n_trades, 2);

        let merged = manager.load_all_bars(&["2020-01".to_string()]).unwrap();
        assert!(merged.windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[test]
    fn missing_bars_month_is_skipped_in_merge() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        manager
            .save_month_bars("2020-01", &[record(1_577_836_800, 1)])
            .unwrap();
        let merged = manager
            .load_all_bars(&["2019-12".to_string(), "2020-01".to_string()])
            .unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn clear_removes_all_checkpoint_files() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoint"));
        let mut state = PipelineState::default();
        manager.save_state(&mut state).unwrap();
        manager
            .save_month_bars("2020-01", &[record(1_577_836_800, 1)])
            .unwrap();

        manager.clear().unwrap();
        assert!(manager.load_state().unwrap().is_none());
        assert!(manager.load_month_bars("2020-01").unwrap().is_none());
        manager.clear().unwrap(); // idempotent
    }

    #[test]
    fn incomplete_checkpoint_never_lists_the_month() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        // Bars and detector written, crash before state: month absent.
        manager
            .save_month_bars("2020-01", &[record(1_577_836_800, 1)])
            .unwrap();
        let detector = Detector::new(7, 100);
        manager.save_detector(&detector).unwrap();

        assert!(manager.load_state().unwrap().is_none());
    }
}
