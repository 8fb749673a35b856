use std::path::{Path, PathBuf};
use std::sync::Arc;

use archive_source::{extract_and_remove_archive, ArchiveSource, SourceError};
use core_types::retry::{RetryError, RetryPolicy};
use futures::StreamExt;
use log::{debug, warn};
use metrics::Metrics;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// A month whose CSV is extracted on local disk, ready for processing.
#[derive(Clone, Debug)]
pub struct MonthJob {
    pub month: String,
    pub csv_path: PathBuf,
    pub csv_size: i64,
}

/// What a download worker reports back to the dispatcher.
#[derive(Debug)]
pub enum DownloadEvent {
    Ready(MonthJob),
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,
    #[error(transparent)]
    Source(#[from] SourceError),
}

pub(crate) struct Downloader {
    pub source: Arc<dyn ArchiveSource>,
    pub metrics: Arc<Metrics>,
    pub retry: RetryPolicy,
    pub symbol: String,
    pub temp_dir: PathBuf,
}

impl Downloader {
    fn zip_path(&self, month: &str) -> PathBuf {
        self.temp_dir.join(format!("{month}.zip"))
    }

    fn csv_path(&self, month: &str) -> PathBuf {
        self.temp_dir.join(format!("{month}.csv"))
    }

    /// Fetches and extracts one month. Idempotent against leftovers from an
    /// interrupted run: complete CSVs and ZIPs are reused, `.tmp` partials
    /// are discarded.
    pub async fn download_month(
        &self,
        month: &str,
        cancel: &CancellationToken,
    ) -> Result<MonthJob, DownloadError> {
        let zip_path = self.zip_path(month);
        let csv_path = self.csv_path(month);

        remove_quietly(&tmp_sibling(&zip_path));
        remove_quietly(&tmp_sibling(&csv_path));

        if let Some(size) = file_size(&csv_path) {
            debug!("[{month}] reusing extracted csv ({size} bytes)");
            return Ok(MonthJob {
                month: month.to_string(),
                csv_path,
                csv_size: size,
            });
        }

        if file_size(&zip_path).is_none() {
            let fetched = self
                .retry
                .retry_async(cancel, |attempt| {
                    if attempt > 0 {
                        debug!("[{month}] download attempt {}", attempt + 1);
                    }
                    self.fetch_to_file(month, &zip_path, cancel)
                })
                .await;
            match fetched {
                Ok(bytes) => debug!("[{month}] downloaded {bytes} bytes"),
                Err(RetryError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(RetryError::Exhausted(DownloadError::Cancelled)) => {
                    return Err(DownloadError::Cancelled)
                }
                Err(RetryError::Exhausted(err)) => return Err(err),
            }
        }

        let zip_for_blocking = zip_path.clone();
        let csv_for_blocking = csv_path.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract_and_remove_archive(&zip_for_blocking, &csv_for_blocking)
        })
        .await
        .map_err(|err| {
            SourceError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
        })?;

        match extracted {
            Ok(size) => Ok(MonthJob {
                month: month.to_string(),
                csv_path,
                csv_size: size as i64,
            }),
            Err(err) => {
                // A corrupt archive is useless; drop it so the next run
                // re-downloads instead of failing the same way.
                remove_quietly(&zip_path);
                Err(err.into())
            }
        }
    }

    /// Streams the archive body into `<zip>.tmp`, then renames. One attempt;
    /// retries are the caller's policy.
    async fn fetch_to_file(
        &self,
        month: &str,
        zip_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let tmp = tmp_sibling(zip_path);
        let result = self.fetch_to_tmp(month, &tmp, cancel).await;
        match result {
            Ok(total) => {
                tokio::fs::rename(&tmp, zip_path)
                    .await
                    .map_err(SourceError::Io)?;
                Ok(total)
            }
            Err(err) => {
                remove_quietly(&tmp);
                Err(err)
            }
        }
    }

    async fn fetch_to_tmp(
        &self,
        month: &str,
        tmp: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            fetched = self.source.fetch(&self.symbol, month) => {
                fetched.map_err(DownloadError::Source)?
            }
        };
        let mut file = tokio::fs::File::create(tmp).await.map_err(SourceError::Io)?;
        let progress = self
            .metrics
            .track_current_file(format!("{month}.zip"), 0);

        let mut total: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes).await.map_err(SourceError::Io)?;
                        total += bytes.len() as u64;
                        progress.update_read(total);
                        self.metrics.add_downloaded_bytes(bytes.len() as u64);
                    }
                    Some(Err(err)) => return Err(DownloadError::Source(err.into())),
                    None => break,
                },
            }
        }
        file.sync_all().await.map_err(SourceError::Io)?;
        Ok(total)
    }
}

pub(crate) fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

pub(crate) fn file_size(path: &Path) -> Option<i64> {
    std::fs::metadata(path).ok().map(|meta| meta.len() as i64)
}

fn remove_quietly(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {err}", path.display());
        }
    }
}
