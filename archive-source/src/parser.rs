use std::path::Path;

use core_types::types::{RawTrade, Trade};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Read buffer for streaming multi-gigabyte CSVs.
pub const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Known Binance aggTrades header prefix.
const HEADER_PREFIX: &str = "agg_trade_id";

/// agg_id, price, qty, first_id, last_id, time, is_buyer_maker.
const MIN_COLUMNS: usize = 7;

const COL_AGG_ID: usize = 0;
const COL_PRICE: usize = 1;
const COL_QTY: usize = 2;
const COL_TIME: usize = 5;
const COL_IS_BUYER_MAKER: usize = 6;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParseSummary {
    /// Trades handed to the callback.
    pub parsed: u64,
    /// Malformed lines dropped.
    pub skipped: u64,
}

/// Streams a trade CSV, invoking `callback` with every `batch_size` parsed
/// trades (and once more with the remainder).
///
/// A leading header line is detected and skipped; malformed lines are
/// counted and dropped. Only I/O errors are fatal.
pub async fn parse_csv<F>(
    path: &Path,
    batch_size: usize,
    mut callback: F,
) -> std::io::Result<ParseSummary>
where
    F: FnMut(&[Trade]),
{
    let file = File::open(path).await?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

    let batch_size = batch_size.max(1);
    let mut batch: Vec<Trade> = Vec::with_capacity(batch_size);
    let mut summary = ParseSummary::default();
    let mut line = String::new();
    let mut first_content_line = true;

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if first_content_line {
            first_content_line = false;
            if is_header_line(trimmed) {
                continue;
            }
        }
        match parse_line(trimmed) {
            Some(trade) => {
                batch.push(trade);
                summary.parsed += 1;
                if batch.len() >= batch_size {
                    callback(&batch);
                    batch.clear();
                }
            }
            None => summary.skipped += 1,
        }
    }

    if !batch.is_empty() {
        callback(&batch);
    }
    Ok(summary)
}

fn parse_line(line: &str) -> Option<Trade> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < MIN_COLUMNS {
        return None;
    }
    let raw = RawTrade {
        agg_id: parts[COL_AGG_ID].parse().ok()?,
        price: parts[COL_PRICE].parse().ok()?,
        qty: parts[COL_QTY].parse().ok()?,
        timestamp: parts[COL_TIME].parse().ok()?,
        is_buyer_maker: parts[COL_IS_BUYER_MAKER].eq_ignore_ascii_case("true"),
    };
    raw.to_trade()
}

/// Binance CSVs usually ship without a header; detect one anyway.
fn is_header_line(line: &str) -> bool {
    if line.starts_with(HEADER_PREFIX) {
        return true;
    }
    match line.split(',').next() {
        Some(first) => first.parse::<i64>().is_err(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    async fn collect(content: &str, batch_size: usize) -> (ParseSummary, Vec<Trade>) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let mut trades = Vec::new();
        let summary = parse_csv(file.path(), batch_size, |batch| {
            trades.extend_from_slice(batch);
        })
        .await
        .unwrap();
        (summary, trades)
    }

    #[tokio::test]
    async fn parses_headerless_data() {
        let (summary, trades) = collect(
            "1,30000.0,0.5,1,1,1577836800000,false\n\
             2,30001.0,1.5,2,2,1577836801000,true\n",
            100,
        )
        .await;
        assert_eq!(summary, ParseSummary { parsed: 2, skipped: 0 });
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].price, 30_000.0);
        assert!(trades[0].is_buy());
        assert!(trades[1].is_sell());
    }

    #[tokio::test]
    async fn skips_header_line() {
        let (summary, trades) = collect(
            "agg_trade_id,price,quantity,first_trade_id,last_trade_id,transact_time,is_buyer_maker\n\
             1,30000.0,0.5,1,1,1577836800000,false\n",
            100,
        )
        .await;
        assert_eq!(summary.parsed, 1);
        assert_eq!(trades.len(), 1);
    }

    #[tokio::test]
    async fn skips_malformed_lines_without_failing() {
        let (summary, trades) = collect(
            "1,30000.0,0.5,1,1,1577836800000,false\n\
             not,a,trade\n\
             2,abc,1.0,2,2,1577836801000,false\n\
             3,30002.0,1.0,3,3,1577836802000,false\n",
            100,
        )
        .await;
        assert_eq!(summary, ParseSummary { parsed: 2, skipped: 2 });
        assert_eq!(trades.len(), 2);
    }

    #[tokio::test]
    async fn empty_file_yields_zero_trades() {
        let (summary, trades) = collect("", 100).await;
        assert_eq!(summary, ParseSummary::default());
        assert!(trades.is_empty());
    }

    #[tokio::test]
    async fn batches_are_delivered_at_batch_size() {
        let mut content = String::new();
        for i in 0..25 {
            content.push_str(&format!("{i},100.0,1.0,{i},{i},{},false\n", 1_577_836_800_000i64 + i));
        }
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();

        let mut batch_sizes = Vec::new();
        let summary = parse_csv(file.path(), 10, |batch| batch_sizes.push(batch.len()))
            .await
            .unwrap();
        assert_eq!(summary.parsed, 25);
        assert_eq!(batch_sizes, vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn microsecond_timestamps_are_normalized() {
        let (_, trades) = collect("1,100.0,1.0,1,1,1577836800000000,False\n", 100).await;
        assert_eq!(trades[0].time.to_rfc3339(), "2020-01-01T00:00:00+00:00");
        assert!(trades[0].is_buy());
    }

    #[tokio::test]
    async fn first_data_line_is_not_eaten_by_header_check() {
        // Headerless file whose first line must be parsed as data.
        let (summary, _) = collect("7,100.0,1.0,7,7,1577836800000,true\n", 100).await;
        assert_eq!(summary.parsed, 1);
    }
}
