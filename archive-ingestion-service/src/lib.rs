//! Ordered ingestion of monthly trade archives.
//!
//! N download workers fetch and extract archives in parallel; a single
//! dispatcher consumes the resulting jobs in strict chronological order,
//! streaming each CSV through the aggregator and checkpointing after every
//! month. Chronology is load-bearing: the rolling percentile window is
//! time-causal, so a month may only be processed once every earlier month
//! has been.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use aggregations::{Aggregator, HourlyRecord};
use archive_source::{parse_csv, ArchiveSource, SourceError};
use checkpoint_store::{CheckpointError, CheckpointManager, PipelineState};
use chrono::NaiveDate;
use core_types::config::{parse_month, AppConfig};
use core_types::retry::RetryPolicy;
use log::{debug, error, info, warn};
use memory_arbiter::{estimate_month_memory, MemoryArbiter};
use metrics::Metrics;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod download;

use download::{DownloadError, DownloadEvent, Downloader, MonthJob};

/// Dispatcher re-poll period while the next chronological month is absent.
const DISPATCH_POLL_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of one month moving through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MonthState {
    Queued,
    Ready,
    Processing,
    Checkpointed,
    Failed,
}

/// Runtime wiring for the ingestion service.
#[derive(Clone, Debug)]
pub struct IngestionConfig {
    pub symbol: String,
    /// All requested months, ascending `YYYY-MM`; completed ones are
    /// skipped on resume.
    pub months: Vec<String>,
    pub temp_dir: PathBuf,
    pub download_workers: usize,
    pub batch_size: usize,
    pub window_days: usize,
    pub samples_per_day: usize,
}

impl IngestionConfig {
    pub fn from_app_config(config: &AppConfig, months: Vec<String>) -> Self {
        Self {
            symbol: config.symbol.clone(),
            months,
            temp_dir: config.temp_dir(),
            download_workers: config.download_workers,
            batch_size: config.batch_size,
            window_days: config.window_days,
            samples_per_day: config.samples_per_day,
        }
    }
}

/// Downloads, aggregates and checkpoints the configured months, returning
/// the full chronologically sorted bar series.
pub struct ArchiveIngestionService {
    config: IngestionConfig,
    source: Arc<dyn ArchiveSource>,
    arbiter: Arc<MemoryArbiter>,
    metrics: Arc<Metrics>,
    checkpoints: CheckpointManager,
    aggregator: Mutex<Aggregator>,
}

impl ArchiveIngestionService {
    pub fn new(
        config: IngestionConfig,
        source: Arc<dyn ArchiveSource>,
        arbiter: Arc<MemoryArbiter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let checkpoints = CheckpointManager::new(config.temp_dir.join("checkpoint"));
        let aggregator = Mutex::new(Aggregator::new(config.window_days, config.samples_per_day));
        Self {
            config,
            source,
            arbiter,
            metrics,
            checkpoints,
            aggregator,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Runs the pipeline to completion or cancellation.
    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<Vec<HourlyRecord>, PipelineError> {
        std::fs::create_dir_all(&self.config.temp_dir)?;

        let mut state = self.checkpoints.load_state()?.unwrap_or_default();
        if !state.completed_months.is_empty() {
            self.restore_detector(&state)?;
        }

        let mut months = self.config.months.clone();
        months.sort();
        let pending = state.pending_months(&months);
        if pending.is_empty() {
            info!("all {} months already processed", months.len());
            return Ok(self.checkpoints.load_all_bars(&months)?);
        }
        info!(
            "processing {} months ({} already completed)",
            pending.len(),
            months.len() - pending.len()
        );
        self.metrics.add_planned_months(pending.len() as u64);
        self.metrics
            .set_pipeline_status(format!("Processing {} months", pending.len()));

        let (events_tx, events_rx) = mpsc::channel::<DownloadEvent>(16);
        let worker_handles = self.spawn_download_workers(&pending, events_tx, &cancel);

        let run_result = self
            .dispatch(&pending, events_rx, &mut state, &cancel)
            .await;

        for handle in worker_handles {
            if let Err(err) = handle.await {
                error!("download worker join error: {err}");
            }
        }
        run_result?;

        // Leftover bars exist only for months that were parsed but not
        // checkpointed; everything else comes back from the store.
        let new_bars = self.aggregator.lock().get_all_bars();
        let mut all_bars = self.checkpoints.load_all_bars(&state.completed_months)?;
        all_bars.extend(new_bars);
        all_bars.sort_by_key(|record| record.time);

        self.metrics
            .set_pipeline_status(format!("Done: {} hourly bars", all_bars.len()));
        Ok(all_bars)
    }

    fn restore_detector(&self, state: &PipelineState) -> Result<(), PipelineError> {
        match self.checkpoints.load_detector()? {
            Some(snapshot) => {
                let mut aggregator = self.aggregator.lock();
                snapshot.apply_to(aggregator.detector_mut());
                let (days, samples) = aggregator.detector().stats();
                info!(
                    "restored detector state ({days} days, {samples} samples, bootstrap={})",
                    snapshot.bootstrap.bootstrapped
                );
            }
            None => warn!(
                "no detector snapshot despite {} completed months; thresholds rebuild from scratch",
                state.completed_months.len()
            ),
        }
        Ok(())
    }

    fn spawn_download_workers(
        &self,
        pending: &[String],
        events_tx: mpsc::Sender<DownloadEvent>,
        cancel: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let (months_tx, months_rx) = mpsc::channel::<String>(pending.len().max(1));
        for month in pending {
            // Capacity covers every pending month; the send cannot block.
            let _ = months_tx.try_send(month.clone());
        }
        drop(months_tx);
        let months_rx = Arc::new(tokio::sync::Mutex::new(months_rx));

        let mut handles = Vec::new();
        for worker_id in 0..self.config.download_workers.max(1) {
            let months_rx = months_rx.clone();
            let events_tx = events_tx.clone();
            let cancel = cancel.clone();
            let downloader = Downloader {
                source: self.source.clone(),
                metrics: self.metrics.clone(),
                retry: RetryPolicy::default_download(),
                symbol: self.config.symbol.clone(),
                temp_dir: self.config.temp_dir.clone(),
            };
            handles.push(tokio::spawn(async move {
                loop {
                    let month = {
                        let mut rx = months_rx.lock().await;
                        match rx.recv().await {
                            Some(month) => month,
                            None => break,
                        }
                    };
                    if cancel.is_cancelled() {
                        break;
                    }
                    debug!("worker {worker_id} downloading {month}");
                    match downloader.download_month(&month, &cancel).await {
                        Ok(job) => {
                            if events_tx.send(DownloadEvent::Ready(job)).await.is_err() {
                                break;
                            }
                        }
                        Err(DownloadError::Cancelled) => break,
                        Err(DownloadError::Source(err)) => {
                            error!("download {month}: {err}");
                            if events_tx
                                .send(DownloadEvent::Failed(month))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            }));
        }
        handles
    }

    /// Consumes download events and processes months strictly in order.
    async fn dispatch(
        &self,
        month_order: &[String],
        mut events_rx: mpsc::Receiver<DownloadEvent>,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut ready: HashMap<String, MonthJob> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut states: HashMap<String, MonthState> = month_order
            .iter()
            .map(|month| (month.clone(), MonthState::Queued))
            .collect();
        let mut next_idx = 0usize;
        let mut downloads_done = false;

        loop {
            while next_idx < month_order.len() {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let next_month = &month_order[next_idx];
                if failed.contains(next_month) {
                    next_idx += 1;
                    continue;
                }
                let Some(job) = ready.remove(next_month) else {
                    if downloads_done {
                        // The workers are gone; this month can never arrive.
                        warn!("[{next_month}] archive never became ready; skipping");
                        self.set_month_state(&mut states, next_month, MonthState::Failed);
                        self.metrics.inc_failed_month();
                        next_idx += 1;
                        continue;
                    }
                    break;
                };
                self.metrics.set_queue_depth("ready", ready.len());

                let estimated = estimate_month_memory(job.csv_size);
                if !self.arbiter.reserve(estimated, cancel).await {
                    return Ok(());
                }
                self.metrics.set_memory_reserved(self.arbiter.stats().reserved);
                self.set_month_state(&mut states, next_month, MonthState::Processing);

                let result = self.process_month(&job, state).await;
                self.arbiter.release(estimated);
                self.metrics.set_memory_reserved(self.arbiter.stats().reserved);

                match result {
                    Ok((hours, trades)) => {
                        self.set_month_state(&mut states, next_month, MonthState::Checkpointed);
                        self.metrics.inc_completed_month();
                        self.metrics.set_pipeline_status(format!(
                            "Ingested {}: {hours} hours, {trades} trades",
                            job.month
                        ));
                        info!("[{}] checkpointed {hours} hours ({trades} trades)", job.month);
                    }
                    Err(MonthError::Skip(err)) => {
                        error!("[{}] processing failed: {err}", job.month);
                        self.set_month_state(&mut states, next_month, MonthState::Failed);
                        self.metrics.inc_failed_month();
                    }
                    Err(MonthError::Fatal(err)) => return Err(err),
                }
                next_idx += 1;
            }

            if next_idx >= month_order.len() {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events_rx.recv() => match event {
                    Some(DownloadEvent::Ready(job)) => {
                        self.set_month_state(&mut states, &job.month, MonthState::Ready);
                        ready.insert(job.month.clone(), job);
                        self.metrics.set_queue_depth("ready", ready.len());
                    }
                    Some(DownloadEvent::Failed(month)) => {
                        self.set_month_state(&mut states, &month, MonthState::Failed);
                        self.metrics.inc_failed_month();
                        failed.insert(month);
                    }
                    None => downloads_done = true,
                },
                _ = tokio::time::sleep(std::time::Duration::from_millis(DISPATCH_POLL_MS)) => {}
            }
        }
    }

    fn set_month_state(
        &self,
        states: &mut HashMap<String, MonthState>,
        month: &str,
        new_state: MonthState,
    ) {
        let previous = states.insert(month.to_string(), new_state);
        debug!("[{month}] {previous:?} -> {new_state:?}");
    }

    /// Streams one month's CSV through the aggregator, removes the CSV and
    /// takes the three-file checkpoint. Returns (hours, trades).
    async fn process_month(
        &self,
        job: &MonthJob,
        state: &mut PipelineState,
    ) -> Result<(usize, u64), MonthError> {
        let metrics = &self.metrics;
        let summary = parse_csv(&job.csv_path, self.config.batch_size, |batch| {
            self.aggregator.lock().process_trades(batch);
            metrics.inc_batches(1);
            metrics.inc_trades(batch.len() as u64);
        })
        .await
        .map_err(|err| MonthError::Skip(err.into()))?;

        if summary.skipped > 0 {
            warn!("[{}] skipped {} malformed lines", job.month, summary.skipped);
        }

        if let Err(err) = std::fs::remove_file(&job.csv_path) {
            warn!("failed to remove {}: {err}", job.csv_path.display());
        }

        let hours = self.save_checkpoint(&job.month, state)?;
        Ok((hours, summary.parsed))
    }

    /// Order matters: bars, then detector, then state. `state.json` is the
    /// commit record, so a crash mid-checkpoint re-processes the month
    /// instead of skipping it.
    fn save_checkpoint(&self, month: &str, state: &mut PipelineState) -> Result<usize, MonthError> {
        let mut aggregator = self.aggregator.lock();
        let bars = aggregator.get_bars_for_month(month);
        if let Some(next_month_start) = first_day_of_next_month(month) {
            aggregator.detector_mut().prune(next_month_start);
        }

        self.checkpoints
            .save_month_bars(month, &bars)
            .map_err(|err| MonthError::Fatal(err.into()))?;
        self.checkpoints
            .save_detector(aggregator.detector())
            .map_err(|err| MonthError::Fatal(err.into()))?;
        state.completed_months.push(month.to_string());
        self.checkpoints
            .save_state(state)
            .map_err(|err| MonthError::Fatal(err.into()))?;
        Ok(bars.len())
    }
}

enum MonthError {
    /// The month is lost but the pipeline continues.
    Skip(PipelineError),
    /// Checkpoint durability is broken; stop the run.
    Fatal(PipelineError),
}

/// First calendar day after the given `YYYY-MM` month.
fn first_day_of_next_month(month: &str) -> Option<NaiveDate> {
    let first = parse_month(month).ok()?;
    first.checked_add_months(chrono::Months::new(1))
}
