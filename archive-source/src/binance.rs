use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use core_types::config::{month_range, parse_month, BASE_URL};
use futures::TryStreamExt;
use reqwest::Client;

use crate::{ArchiveSource, ByteStream, SourceError};

/// Per-download ceiling; covers connect plus the whole body read.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// First month Binance published spot aggTrades archives.
const EARLIEST_SPOT_MONTH: &str = "2017-08";

/// Fetches monthly aggTrades ZIP archives from Binance Data Vision.
pub struct BinanceVisionSource {
    client: Client,
    base_url: String,
}

impl BinanceVisionSource {
    pub fn new() -> Result<Self, SourceError> {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn archive_url(&self, symbol: &str, month: &str) -> String {
        format!(
            "{}/{}/{}-aggTrades-{}.zip",
            self.base_url, symbol, symbol, month
        )
    }
}

#[async_trait]
impl ArchiveSource for BinanceVisionSource {
    /// Months from the spot archive's first publication through the last
    /// complete calendar month. Per-symbol catalogue discovery against the
    /// bucket listing is the external catalogue tool's job; a 404 on fetch
    /// marks the month failed and the pipeline moves on.
    async fn list_available(&self, _symbol: &str) -> Result<Vec<String>, SourceError> {
        let today = Utc::now().date_naive();
        let last_complete = today
            .with_day(1)
            .and_then(|first| first.pred_opt())
            .unwrap_or(today);
        let start = parse_month(EARLIEST_SPOT_MONTH)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
        Ok(month_range(start, last_complete))
    }

    async fn fetch(&self, symbol: &str, month: &str) -> Result<ByteStream, SourceError> {
        let url = self.archive_url(symbol, month);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Status {
                status: response.status().as_u16(),
                month: month.to_string(),
            });
        }
        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_url_shape() {
        let source = BinanceVisionSource::new().unwrap();
        assert_eq!(
            source.archive_url("BTCUSDT", "2020-01"),
            "https://data.binance.vision/data/spot/monthly/aggTrades/BTCUSDT/BTCUSDT-aggTrades-2020-01.zip"
        );
    }

    #[tokio::test]
    async fn listing_is_sorted_and_starts_at_genesis() {
        let source = BinanceVisionSource::new().unwrap();
        let months = source.list_available("BTCUSDT").await.unwrap();
        assert_eq!(months.first().map(String::as_str), Some("2017-08"));
        assert!(months.windows(2).all(|w| w[0] < w[1]));
    }
}
