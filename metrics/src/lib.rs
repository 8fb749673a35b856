// Copyright (c) James Kassemi, SC, US. All rights reserved.
//! Prometheus metrics. hyper v1.+
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;

/// Pipeline metrics, exposed in Prometheus text format via [`Metrics::serve`].
///
/// Hot counters are mirrored into plain atomics so in-process readers avoid
/// the prometheus read path. Each instance owns its registry, so tests can
/// build as many as they like.
pub struct Metrics {
    registry: Registry,
    pipeline_status: Arc<Mutex<String>>,
    planned_months: AtomicU64,
    completed_months: AtomicU64,
    failed_months: AtomicU64,
    ingested_batches: AtomicU64,
    ingested_trades: AtomicU64,
    current_files: Arc<Mutex<HashMap<u64, CurrentFileState>>>,
    current_file_seq: AtomicU64,
    planned_months_gauge: IntGauge,
    completed_months_gauge: IntGauge,
    failed_months_gauge: IntGauge,
    ingested_batches_counter: IntCounter,
    ingested_trades_counter: IntCounter,
    active_files_gauge: IntGauge,
    queue_depth_gauges: IntGaugeVec,
    download_bytes_counter: IntCounter,
    memory_reserved_gauge: IntGauge,
    uptime_gauge: IntGauge,
    start_time: Instant,
}

#[derive(Clone)]
pub struct CurrentFileSnapshot {
    pub id: u64,
    pub name: String,
    pub total: u64,
    pub read: u64,
    pub started_ns: i64,
}

/// Tracks one in-flight transfer; unregisters itself on drop.
pub struct FileProgressGuard {
    metrics: Arc<Metrics>,
    id: u64,
}

struct CurrentFileState {
    name: String,
    total: u64,
    read: u64,
    started_ns: i64,
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(Opts::new(name, help)).unwrap();
    registry.register(Box::new(gauge.clone())).unwrap();
    gauge
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help)).unwrap();
    registry.register(Box::new(counter.clone())).unwrap();
    counter
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let planned_months_gauge = int_gauge(
            &registry,
            "ingest_planned_months",
            "Total number of months scheduled for ingestion",
        );
        let completed_months_gauge = int_gauge(
            &registry,
            "ingest_completed_months",
            "Number of months fully processed and checkpointed",
        );
        let failed_months_gauge = int_gauge(
            &registry,
            "ingest_failed_months",
            "Number of months skipped after download or extraction failures",
        );
        let ingested_batches_counter = int_counter(
            &registry,
            "ingest_batches_total",
            "Total number of trade batches fed to the aggregator",
        );
        let ingested_trades_counter = int_counter(
            &registry,
            "ingest_trades_total",
            "Total number of trades fed to the aggregator",
        );
        let active_files_gauge = int_gauge(
            &registry,
            "ingest_active_files",
            "Number of archive downloads currently in flight",
        );
        let queue_depth_gauges = IntGaugeVec::new(
            Opts::new(
                "ingest_queue_depth",
                "Buffered items waiting in internal ingestion queues",
            ),
            &["queue"],
        )
        .unwrap();
        registry
            .register(Box::new(queue_depth_gauges.clone()))
            .unwrap();
        let download_bytes_counter = int_counter(
            &registry,
            "ingest_archive_download_bytes_total",
            "Total bytes downloaded by the archive prefetcher",
        );
        let memory_reserved_gauge = int_gauge(
            &registry,
            "ingest_memory_reserved_bytes",
            "Bytes currently promised to in-flight month processing",
        );
        let uptime_gauge = int_gauge(
            &registry,
            "process_uptime_seconds",
            "Wall-clock seconds since the pipeline process started",
        );
        Self {
            registry,
            pipeline_status: Arc::new(Mutex::new("Not started".to_string())),
            planned_months: AtomicU64::new(0),
            completed_months: AtomicU64::new(0),
            failed_months: AtomicU64::new(0),
            ingested_batches: AtomicU64::new(0),
            ingested_trades: AtomicU64::new(0),
            current_files: Arc::new(Mutex::new(HashMap::new())),
            current_file_seq: AtomicU64::new(0),
            planned_months_gauge,
            completed_months_gauge,
            failed_months_gauge,
            ingested_batches_counter,
            ingested_trades_counter,
            active_files_gauge,
            queue_depth_gauges,
            download_bytes_counter,
            memory_reserved_gauge,
            uptime_gauge,
            start_time: Instant::now(),
        }
    }

    pub fn pipeline_status(&self) -> String {
        self.pipeline_status.lock().unwrap().clone()
    }

    pub fn set_pipeline_status(&self, status: String) {
        *self.pipeline_status.lock().unwrap() = status;
    }

    // planned/completed/failed months
    pub fn add_planned_months(&self, n: u64) {
        let total = self.planned_months.fetch_add(n, Ordering::Relaxed) + n;
        self.planned_months_gauge.set(total as i64);
    }
    pub fn inc_completed_month(&self) {
        let total = self.completed_months.fetch_add(1, Ordering::Relaxed) + 1;
        self.completed_months_gauge.set(total as i64);
    }
    pub fn inc_failed_month(&self) {
        let total = self.failed_months.fetch_add(1, Ordering::Relaxed) + 1;
        self.failed_months_gauge.set(total as i64);
    }
    pub fn planned_months(&self) -> u64 {
        self.planned_months.load(Ordering::Relaxed)
    }
    pub fn completed_months(&self) -> u64 {
        self.completed_months.load(Ordering::Relaxed)
    }
    pub fn failed_months(&self) -> u64 {
        self.failed_months.load(Ordering::Relaxed)
    }

    // ingestion progress
    pub fn inc_batches(&self, n: u64) {
        self.ingested_batches.fetch_add(n, Ordering::Relaxed);
        self.ingested_batches_counter.inc_by(n);
    }
    pub fn inc_trades(&self, n: u64) {
        self.ingested_trades.fetch_add(n, Ordering::Relaxed);
        self.ingested_trades_counter.inc_by(n);
    }
    pub fn ingested_batches(&self) -> u64 {
        self.ingested_batches.load(Ordering::Relaxed)
    }
    pub fn ingested_trades(&self) -> u64 {
        self.ingested_trades.load(Ordering::Relaxed)
    }

    pub fn current_files(&self) -> Vec<CurrentFileSnapshot> {
        let files = self.current_files.lock().unwrap();
        let mut snapshots: Vec<_> = files
            .iter()
            .map(|(id, state)| CurrentFileSnapshot {
                id: *id,
                name: state.name.clone(),
                total: state.total,
                read: state.read,
                started_ns: state.started_ns,
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.started_ns);
        snapshots
    }

    pub fn track_current_file(self: &Arc<Self>, name: String, total: u64) -> FileProgressGuard {
        let id = self.current_file_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;
        let mut files = self.current_files.lock().unwrap();
        files.insert(
            id,
            CurrentFileState {
                name,
                total,
                read: 0,
                started_ns: now,
            },
        );
        self.active_files_gauge.inc();
        FileProgressGuard {
            metrics: Arc::clone(self),
            id,
        }
    }

    fn update_current_file_read(&self, id: u64, read: u64) {
        if let Some(entry) = self.current_files.lock().unwrap().get_mut(&id) {
            entry.read = read;
        }
    }

    fn finish_current_file(&self, id: u64) {
        if self.current_files.lock().unwrap().remove(&id).is_some() {
            self.active_files_gauge.dec();
        }
    }

    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        self.queue_depth_gauges
            .with_label_values(&[queue])
            .set(depth as i64);
    }

    pub fn add_downloaded_bytes(&self, bytes: u64) {
        if bytes > 0 {
            self.download_bytes_counter.inc_by(bytes);
        }
    }

    pub fn set_memory_reserved(&self, bytes: i64) {
        self.memory_reserved_gauge.set(bytes);
    }

    /// Rendered Prometheus text exposition for this instance's registry.
    pub fn render(&self) -> String {
        self.uptime_gauge
            .set(self.start_time.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            buffer.clear();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    async fn handle_metrics(
        &self,
        _req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let body = self.render();
        let response = Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(body)))
            .unwrap();
        Ok(response)
    }

    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        loop {
            let (socket, _) = listener.accept().await?;
            let io = TokioIo::new(socket);
            let metrics = self.clone();
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                async move { metrics.handle_metrics(req).await }
            });
            tokio::spawn(async move {
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    eprintln!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FileProgressGuard {
    pub fn update_read(&self, read: u64) {
        self.metrics.update_current_file_read(self.id, read);
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for FileProgressGuard {
    fn drop(&mut self) {
        self.metrics.finish_current_file(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.add_planned_months(12);
        metrics.inc_completed_month();
        metrics.inc_completed_month();
        metrics.inc_failed_month();
        assert_eq!(metrics.planned_months(), 12);
        assert_eq!(metrics.completed_months(), 2);
        assert_eq!(metrics.failed_months(), 1);
    }

    #[test]
    fn file_progress_guard_unregisters_on_drop() {
        let metrics = Arc::new(Metrics::new());
        {
            let guard = metrics.track_current_file("2020-01.zip".to_string(), 1_000);
            guard.update_read(250);
            let files = metrics.current_files();
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].read, 250);
            assert_eq!(files[0].total, 1_000);
        }
        assert!(metrics.current_files().is_empty());
    }

    #[test]
    fn render_includes_registered_series() {
        let metrics = Metrics::new();
        metrics.add_planned_months(3);
        metrics.inc_trades(42);
        metrics.set_queue_depth("ready", 2);
        let body = metrics.render();
        assert!(body.contains("ingest_planned_months 3"));
        assert!(body.contains("ingest_trades_total 42"));
        assert!(body.contains("ingest_queue_depth{queue=\"ready\"} 2"));
    }
}
