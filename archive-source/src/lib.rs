// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Monthly trade-archive access: an abstract source trait, the Binance
//! Data Vision HTTP implementation, ZIP extraction and the CSV stream
//! parser.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

mod binance;
mod extract;
mod parser;

pub use binance::BinanceVisionSource;
pub use extract::{extract_and_remove_archive, extract_archive};
pub use parser::{parse_csv, ParseSummary, READ_BUFFER_SIZE};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status} fetching {month}")]
    Status { status: u16, month: String },
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("archive for {0} has no members")]
    EmptyArchive(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Provider of monthly aggregated-trade archives.
#[async_trait]
pub trait ArchiveSource: Send + Sync + 'static {
    /// Months with an archive available for `symbol`, ascending `YYYY-MM`.
    async fn list_available(&self, symbol: &str) -> Result<Vec<String>, SourceError>;

    /// Opens a byte stream over the month's ZIP archive.
    async fn fetch(&self, symbol: &str, month: &str) -> Result<ByteStream, SourceError>;
}
