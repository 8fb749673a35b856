// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::path::PathBuf;

use chrono::{Datelike, NaiveDate};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use thiserror::Error;

/// Binance Data Vision base URL for monthly spot aggTrades archives.
pub const BASE_URL: &str = "https://data.binance.vision/data/spot/monthly/aggTrades";

pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_MAX_MEMORY_PCT: u64 = 80;
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 3;
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

pub const PERCENTILE_WINDOW_DAYS: usize = 7;
pub const RESERVOIR_SAMPLES_PER_DAY: usize = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid month (expected YYYY-MM): {0}")]
    InvalidMonth(String),
    #[error("start month {start} is after end month {end}")]
    StartAfterEnd { start: String, end: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime configuration, loaded from `config.toml` plus `AGGTRADES_*`
/// environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// First month to ingest, `YYYY-MM`. When unset the archive source's
    /// catalogue decides.
    #[serde(default)]
    pub start_month: Option<String>,
    /// Last month to ingest, inclusive.
    #[serde(default)]
    pub end_month: Option<String>,
    /// Scratch directory for archives, CSVs and the checkpoint store.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default = "default_max_memory_pct")]
    pub max_memory_pct: u64,
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_window_days")]
    pub window_days: usize,
    #[serde(default = "default_samples_per_day")]
    pub samples_per_day: usize,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Derived in [`AppConfig::validate`]; not read from the file.
    #[serde(skip)]
    pub max_memory_bytes: i64,
}

fn default_symbol() -> String {
    DEFAULT_SYMBOL.to_string()
}

fn default_max_memory_pct() -> u64 {
    DEFAULT_MAX_MEMORY_PCT
}

fn default_download_workers() -> usize {
    DEFAULT_DOWNLOAD_WORKERS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_window_days() -> usize {
    PERCENTILE_WINDOW_DAYS
}

fn default_samples_per_day() -> usize {
    RESERVOIR_SAMPLES_PER_DAY
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            start_month: None,
            end_month: None,
            temp_dir: None,
            max_memory_pct: default_max_memory_pct(),
            download_workers: default_download_workers(),
            batch_size: default_batch_size(),
            window_days: default_window_days(),
            samples_per_day: default_samples_per_day(),
            metrics_port: default_metrics_port(),
            max_memory_bytes: 0,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("config.toml").required(false))
            .add_source(Environment::with_prefix("AGGTRADES"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Checks month bounds, resolves the scratch directory and computes the
    /// memory ceiling from the configured RAM percentage.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if let Some(start) = &self.start_month {
            parse_month(start)?;
        }
        if let Some(end) = &self.end_month {
            parse_month(end)?;
        }
        if let (Some(start), Some(end)) = (&self.start_month, &self.end_month) {
            if start > end {
                return Err(ConfigError::StartAfterEnd {
                    start: start.clone(),
                    end: end.clone(),
                });
            }
        }

        if self.temp_dir.is_none() {
            self.temp_dir = Some(PathBuf::from(format!("./aggtrades_temp_{}", self.symbol)));
        }
        if let Some(dir) = &self.temp_dir {
            std::fs::create_dir_all(dir)?;
        }

        self.download_workers = self.download_workers.max(1);
        self.max_memory_pct = self.max_memory_pct.clamp(1, 100);
        self.max_memory_bytes =
            (total_system_memory() as f64 * self.max_memory_pct as f64 / 100.0) as i64;
        Ok(())
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("./aggtrades_temp_{}", self.symbol)))
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.temp_dir().join("checkpoint")
    }

    pub fn month_url(&self, month: &str) -> String {
        format!(
            "{}/{}/{}-aggTrades-{}.zip",
            BASE_URL, self.symbol, self.symbol, month
        )
    }

    pub fn month_zip_path(&self, month: &str) -> PathBuf {
        self.temp_dir().join(format!("{month}.zip"))
    }

    pub fn month_csv_path(&self, month: &str) -> PathBuf {
        self.temp_dir().join(format!("{month}.csv"))
    }

    /// All months between `start_month` and `end_month`, inclusive.
    pub fn generate_months(&self) -> Result<Vec<String>, ConfigError> {
        let (start, end) = match (&self.start_month, &self.end_month) {
            (Some(start), Some(end)) => (parse_month(start)?, parse_month(end)?),
            _ => return Ok(Vec::new()),
        };
        Ok(month_range(start, end))
    }
}

/// Inclusive month labels from `start` to `end`.
pub fn month_range(start: NaiveDate, end: NaiveDate) -> Vec<String> {
    let mut months = Vec::new();
    let mut current = start;
    while current <= end {
        months.push(format!("{:04}-{:02}", current.year(), current.month()));
        current = next_month(current);
    }
    months
}

pub fn parse_month(label: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(&format!("{label}-01"), "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidMonth(label.to_string()))
}

fn next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

fn total_system_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}
