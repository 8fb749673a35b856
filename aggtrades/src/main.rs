// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Main runtime with Tokio.

use std::sync::Arc;

use archive_ingestion_service::{ArchiveIngestionService, IngestionConfig};
use archive_source::{ArchiveSource, BinanceVisionSource};
use core_types::config::AppConfig;
use log::{error, info};
use memory_arbiter::MemoryArbiter;
use metrics::Metrics;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let mut config = AppConfig::load().unwrap_or_else(|err| {
        eprintln!("failed to load config, using defaults: {err}");
        AppConfig::default()
    });
    if let Err(err) = config.validate() {
        error!("invalid configuration: {err}");
        std::process::exit(1);
    }

    let metrics = Arc::new(Metrics::new());
    match TcpListener::bind(("127.0.0.1", config.metrics_port)).await {
        Ok(listener) => {
            let metrics = metrics.clone();
            tokio::spawn(async move {
                if let Err(err) = metrics.serve(listener).await {
                    error!("metrics server error: {err}");
                }
            });
        }
        Err(err) => error!("failed to bind metrics port {}: {err}", config.metrics_port),
    }

    let source = match BinanceVisionSource::new() {
        Ok(source) => Arc::new(source),
        Err(err) => {
            error!("failed to build archive source: {err}");
            std::process::exit(1);
        }
    };

    let months = match resolve_months(&config, source.as_ref()).await {
        Ok(months) if months.is_empty() => {
            error!("no months to process; set start_month/end_month");
            std::process::exit(1);
        }
        Ok(months) => months,
        Err(err) => {
            error!("failed to resolve month range: {err}");
            std::process::exit(1);
        }
    };
    info!(
        "symbol {} | {} months ({} .. {}) | {} workers | {:.1} GiB ceiling",
        config.symbol,
        months.len(),
        months.first().map(String::as_str).unwrap_or("-"),
        months.last().map(String::as_str).unwrap_or("-"),
        config.download_workers,
        config.max_memory_bytes as f64 / (1u64 << 30) as f64,
    );

    let arbiter = Arc::new(MemoryArbiter::new(config.max_memory_bytes));
    let service = ArchiveIngestionService::new(
        IngestionConfig::from_app_config(&config, months),
        source,
        arbiter,
        metrics.clone(),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; finishing in-flight checkpoint");
                cancel.cancel();
            }
        });
    }

    match service.run(cancel).await {
        Ok(bars) => {
            info!(
                "pipeline finished: {} hourly bars ready for the output writer",
                bars.len()
            );
        }
        Err(err) => {
            error!("pipeline failed: {err}");
            std::process::exit(1);
        }
    }
}

/// Months to ingest: the configured range when both bounds are set,
/// otherwise the source catalogue clipped to whichever bounds exist.
async fn resolve_months(
    config: &AppConfig,
    source: &dyn ArchiveSource,
) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
    if config.start_month.is_some() && config.end_month.is_some() {
        return Ok(config.generate_months()?);
    }
    let mut months = source.list_available(&config.symbol).await?;
    if let Some(start) = &config.start_month {
        months.retain(|month| month >= start);
    }
    if let Some(end) = &config.end_month {
        months.retain(|month| month <= end);
    }
    Ok(months)
}
