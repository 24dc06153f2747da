//! Bulk archival downloads: monthly (daily for aggTrades) ZIP files, one
//! CSV per archive. Files are decompressed on a blocking thread and
//! stream-parsed into fixed-size batches that flow through a channel to
//! the async writer, so the full decompressed dataset never materializes.

use bytes::Bytes;
use chrono::{Datelike, NaiveDate};
use std::io::Cursor;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{QuantError, Result};
use crate::types::{AggTrade, Candle, DataType, FundingRate, MarketType, Timeframe};

/// Rows per store transaction while ingesting an archive.
pub const INGEST_BATCH_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub enum ArchiveBatch {
    Candles(Vec<Candle>),
    AggTrades(Vec<AggTrade>),
    Funding(Vec<FundingRate>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub rows: u64,
    pub skipped: u64,
}

pub struct ArchiveClient {
    http: reqwest::Client,
    base_url: String,
}

impl ArchiveClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.archive_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Monthly archive URL. Candles carry the timeframe as an extra path
    /// segment and in the file tag; every other data type uses its archive
    /// name directly.
    pub fn monthly_url(
        &self,
        symbol: &str,
        data_type: DataType,
        market_type: MarketType,
        timeframe: Option<Timeframe>,
        year: i32,
        month: u32,
    ) -> String {
        let market_segment = match market_type {
            MarketType::Spot => "spot",
            MarketType::Perp => "futures/um",
        };
        match (data_type, timeframe) {
            (DataType::Candles, Some(tf)) => format!(
                "{}/{}/monthly/klines/{}/{}/{}-{}-{:04}-{:02}.zip",
                self.base_url,
                market_segment,
                symbol,
                tf.as_str(),
                symbol,
                tf.as_str(),
                year,
                month
            ),
            _ => format!(
                "{}/{}/monthly/{}/{}/{}-{}-{:04}-{:02}.zip",
                self.base_url,
                market_segment,
                data_type.archive_name(),
                symbol,
                symbol,
                data_type.archive_name(),
                year,
                month
            ),
        }
    }

    /// Daily archive URL; only aggTrades use daily files (the monthly
    /// variants are too large to pull routinely).
    pub fn daily_url(&self, symbol: &str, data_type: DataType, date: NaiveDate) -> String {
        format!(
            "{}/spot/daily/{}/{}/{}-{}-{:04}-{:02}-{:02}.zip",
            self.base_url,
            data_type.archive_name(),
            symbol,
            symbol,
            data_type.archive_name(),
            date.year(),
            date.month(),
            date.day()
        )
    }

    /// Download one archive. 404 means the period simply has no file
    /// (young listing, delisted symbol) and is not an error.
    pub async fn download(&self, url: &str) -> Result<Option<Bytes>> {
        debug!("Downloading archive {url}");
        let response = self.http.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("Archive absent (404): {url}");
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.bytes().await?))
    }
}

/// Decompress and parse an archive on a blocking thread, delivering
/// batches of `INGEST_BATCH_SIZE` rows through `tx`. Returns row/skip
/// counts once the file is drained.
pub async fn parse_archive(
    data: Bytes,
    data_type: DataType,
    tx: mpsc::Sender<ArchiveBatch>,
) -> Result<ParseStats> {
    let handle =
        tokio::task::spawn_blocking(move || parse_zip_csv(data, data_type, INGEST_BATCH_SIZE, tx));
    handle
        .await
        .map_err(|e| QuantError::Fetch(format!("archive parse task failed: {e}")))?
}

fn parse_zip_csv(
    data: Bytes,
    data_type: DataType,
    batch_size: usize,
    tx: mpsc::Sender<ArchiveBatch>,
) -> Result<ParseStats> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    if archive.len() == 0 {
        return Err(QuantError::Parse("archive contains no entries".to_string()));
    }
    let entry = archive.by_index(0)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(entry);

    let mut stats = ParseStats::default();
    let mut batcher = Batcher::new(data_type, batch_size, tx);

    for (row_index, record) in reader.records().enumerate() {
        let record = record?;
        match batcher.push(&record) {
            Ok(()) => stats.rows += 1,
            Err(err) => {
                // Some archive generations ship a header line; a parse
                // failure on the very first record is treated as one.
                if row_index == 0 {
                    debug!("Skipping header row: {err}");
                } else {
                    warn!("Skipping malformed archive row {row_index}: {err}");
                    stats.skipped += 1;
                }
            }
        }
    }
    batcher.flush()?;
    Ok(stats)
}

struct Batcher {
    data_type: DataType,
    batch_size: usize,
    tx: mpsc::Sender<ArchiveBatch>,
    candles: Vec<Candle>,
    agg_trades: Vec<AggTrade>,
    funding: Vec<FundingRate>,
}

impl Batcher {
    fn new(data_type: DataType, batch_size: usize, tx: mpsc::Sender<ArchiveBatch>) -> Self {
        Self {
            data_type,
            batch_size,
            tx,
            candles: Vec::new(),
            agg_trades: Vec::new(),
            funding: Vec::new(),
        }
    }

    fn push(&mut self, record: &csv::StringRecord) -> Result<()> {
        match self.data_type {
            DataType::Candles => {
                let candle = parse_kline_record(record)?;
                self.candles.push(candle);
                if self.candles.len() >= self.batch_size {
                    let batch = std::mem::take(&mut self.candles);
                    self.send(ArchiveBatch::Candles(batch))?;
                }
            }
            DataType::AggTrades => {
                let trade = parse_agg_trade_record(record)?;
                self.agg_trades.push(trade);
                if self.agg_trades.len() >= self.batch_size {
                    let batch = std::mem::take(&mut self.agg_trades);
                    self.send(ArchiveBatch::AggTrades(batch))?;
                }
            }
            DataType::FundingRates => {
                let rate = parse_funding_record(record)?;
                self.funding.push(rate);
                if self.funding.len() >= self.batch_size {
                    let batch = std::mem::take(&mut self.funding);
                    self.send(ArchiveBatch::Funding(batch))?;
                }
            }
            other => {
                return Err(QuantError::Parse(format!(
                    "no archive parser for data type '{other}'"
                )))
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.candles.is_empty() {
            let batch = std::mem::take(&mut self.candles);
            self.send(ArchiveBatch::Candles(batch))?;
        }
        if !self.agg_trades.is_empty() {
            let batch = std::mem::take(&mut self.agg_trades);
            self.send(ArchiveBatch::AggTrades(batch))?;
        }
        if !self.funding.is_empty() {
            let batch = std::mem::take(&mut self.funding);
            self.send(ArchiveBatch::Funding(batch))?;
        }
        Ok(())
    }

    fn send(&self, batch: ArchiveBatch) -> Result<()> {
        self.tx
            .blocking_send(batch)
            .map_err(|_| QuantError::Fetch("archive ingest receiver dropped".to_string()))
    }
}

fn field<'a>(record: &'a csv::StringRecord, i: usize) -> Result<&'a str> {
    record
        .get(i)
        .ok_or_else(|| QuantError::Parse(format!("missing column {i}")))
}

fn num(record: &csv::StringRecord, i: usize) -> Result<f64> {
    let s = field(record, i)?;
    s.trim()
        .parse()
        .map_err(|_| QuantError::Parse(format!("column {i}: bad number '{s}'")))
}

fn int(record: &csv::StringRecord, i: usize) -> Result<i64> {
    let s = field(record, i)?;
    s.trim()
        .parse()
        .map_err(|_| QuantError::Parse(format!("column {i}: bad integer '{s}'")))
}

/// Kline CSV column order matches the REST arrays:
/// open_time, open, high, low, close, volume, close_time, quote_volume,
/// count, taker_buy_volume, taker_buy_quote_volume, ignore.
fn parse_kline_record(record: &csv::StringRecord) -> Result<Candle> {
    let candle = Candle {
        open_time: int(record, 0)?,
        open: num(record, 1)?,
        high: num(record, 2)?,
        low: num(record, 3)?,
        close: num(record, 4)?,
        volume: num(record, 5)?,
        trade_count: int(record, 8).ok().map(|v| v as u64),
        quote_volume: num(record, 7).ok(),
        taker_buy_volume: num(record, 9).ok(),
        taker_buy_quote_volume: num(record, 10).ok(),
    };
    candle.validate()?;
    Ok(candle)
}

/// aggTrades CSV: agg_id, price, quantity, first_trade_id, last_trade_id,
/// transact_time, is_buyer_maker[, is_best_match].
fn parse_agg_trade_record(record: &csv::StringRecord) -> Result<AggTrade> {
    Ok(AggTrade {
        agg_id: int(record, 0)?,
        price: num(record, 1)?,
        quantity: num(record, 2)?,
        first_trade_id: int(record, 3)?,
        last_trade_id: int(record, 4)?,
        transact_time: int(record, 5)?,
        is_buyer_maker: parse_bool(field(record, 6)?)?,
    })
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim() {
        "true" | "True" | "TRUE" | "1" => Ok(true),
        "false" | "False" | "FALSE" | "0" => Ok(false),
        other => Err(QuantError::Parse(format!("bad boolean '{other}'"))),
    }
}

/// Funding CSVs exist in two historical layouts. Sniff the first token:
/// numeric means timestamp-first (`calc_time, funding_interval_hours,
/// funding_rate`), alphabetic means symbol-first (`symbol, funding_time,
/// funding_rate[, mark_price]`).
fn parse_funding_record(record: &csv::StringRecord) -> Result<FundingRate> {
    let first = field(record, 0)?.trim();
    if first.parse::<i64>().is_ok() {
        // Timestamp-first. Two-column variants put the rate right after
        // the timestamp; the three-column variant inserts the funding
        // interval in between.
        let rate_idx = if record.len() >= 3 { 2 } else { 1 };
        Ok(FundingRate {
            funding_time: int(record, 0)?,
            rate: num(record, rate_idx)?,
            mark_price: None,
        })
    } else {
        Ok(FundingRate {
            funding_time: int(record, 1)?,
            rate: num(record, 2)?,
            mark_price: record.get(3).and_then(|s| s.trim().parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_of(csv_content: &str) -> Bytes {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            writer
                .start_file("data.csv", zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(csv_content.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        Bytes::from(buf)
    }

    async fn collect(
        data: Bytes,
        data_type: DataType,
    ) -> (Vec<ArchiveBatch>, ParseStats) {
        let (tx, mut rx) = mpsc::channel(16);
        let stats = parse_archive(data, data_type, tx).await.unwrap();
        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
        (batches, stats)
    }

    #[tokio::test]
    async fn parses_kline_archive() {
        let csv = "\
1700000000000,100.0,101.0,99.0,100.5,12.0,1700000059999,1206.0,42,6.0,603.0,0
1700000060000,100.5,102.0,100.0,101.5,8.0,1700000119999,812.0,17,4.0,406.0,0
";
        let (batches, stats) = collect(zip_of(csv), DataType::Candles).await;
        assert_eq!(stats, ParseStats { rows: 2, skipped: 0 });
        match &batches[0] {
            ArchiveBatch::Candles(candles) => {
                assert_eq!(candles.len(), 2);
                assert_eq!(candles[0].open_time, 1_700_000_000_000);
                assert_eq!(candles[1].close, 101.5);
                assert_eq!(candles[0].trade_count, Some(42));
            }
            other => panic!("unexpected batch {other:?}"),
        }
    }

    #[tokio::test]
    async fn header_row_is_tolerated_and_bad_rows_counted() {
        let csv = "\
open_time,open,high,low,close,volume,close_time,qv,n,tb,tq,ig
1700000000000,100.0,101.0,99.0,100.5,12.0,1700000059999,1206.0,42,6.0,603.0,0
garbage,row,here
1700000060000,100.5,102.0,100.0,101.5,8.0,1700000119999,812.0,17,4.0,406.0,0
";
        let (_batches, stats) = collect(zip_of(csv), DataType::Candles).await;
        assert_eq!(stats, ParseStats { rows: 2, skipped: 1 });
    }

    #[tokio::test]
    async fn parses_agg_trade_archive() {
        let csv = "\
1,100.5,0.25,10,12,1700000000000,true
2,100.6,0.50,13,13,1700000000100,False
";
        let (batches, stats) = collect(zip_of(csv), DataType::AggTrades).await;
        assert_eq!(stats.rows, 2);
        match &batches[0] {
            ArchiveBatch::AggTrades(trades) => {
                assert!(trades[0].is_buyer_maker);
                assert!(!trades[1].is_buyer_maker);
            }
            other => panic!("unexpected batch {other:?}"),
        }
    }

    #[tokio::test]
    async fn funding_sniffs_timestamp_first_layout() {
        let csv = "\
1700000000000,8,0.00010000
1700028800000,8,-0.00020000
";
        let (batches, stats) = collect(zip_of(csv), DataType::FundingRates).await;
        assert_eq!(stats.rows, 2);
        match &batches[0] {
            ArchiveBatch::Funding(rates) => {
                assert_eq!(rates[0].funding_time, 1_700_000_000_000);
                assert_eq!(rates[0].rate, 0.0001);
                assert_eq!(rates[1].rate, -0.0002);
            }
            other => panic!("unexpected batch {other:?}"),
        }
    }

    #[tokio::test]
    async fn funding_sniffs_symbol_first_layout() {
        let csv = "\
BTCUSDT,1700000000000,0.00010000,50000.0
BTCUSDT,1700028800000,0.00030000,50100.0
";
        let (batches, _) = collect(zip_of(csv), DataType::FundingRates).await;
        match &batches[0] {
            ArchiveBatch::Funding(rates) => {
                assert_eq!(rates[0].funding_time, 1_700_000_000_000);
                assert_eq!(rates[0].rate, 0.0001);
                assert_eq!(rates[0].mark_price, Some(50_000.0));
            }
            other => panic!("unexpected batch {other:?}"),
        }
    }

    #[tokio::test]
    async fn batches_are_bounded() {
        let mut csv = String::new();
        for i in 0..(INGEST_BATCH_SIZE + 10) {
            csv.push_str(&format!(
                "{},100.0,101.0,99.0,100.5,1.0,{},100.0,1,0.5,50.0,0\n",
                1_700_000_000_000i64 + i as i64 * 60_000,
                1_700_000_059_999i64 + i as i64 * 60_000,
            ));
        }
        let (batches, stats) = collect(zip_of(&csv), DataType::Candles).await;
        assert_eq!(stats.rows as usize, INGEST_BATCH_SIZE + 10);
        assert_eq!(batches.len(), 2);
        match &batches[0] {
            ArchiveBatch::Candles(candles) => assert_eq!(candles.len(), INGEST_BATCH_SIZE),
            other => panic!("unexpected batch {other:?}"),
        }
    }

    #[test]
    fn monthly_url_shapes() {
        let settings = Settings::default();
        let client = ArchiveClient::new(&settings).unwrap();
        assert_eq!(
            client.monthly_url(
                "BTCUSDT",
                DataType::Candles,
                MarketType::Spot,
                Some(Timeframe::H1),
                2024,
                3
            ),
            "https://data.binance.vision/data/spot/monthly/klines/BTCUSDT/1h/BTCUSDT-1h-2024-03.zip"
        );
        assert_eq!(
            client.monthly_url(
                "BTCUSDT",
                DataType::FundingRates,
                MarketType::Perp,
                None,
                2024,
                11
            ),
            "https://data.binance.vision/data/futures/um/monthly/fundingRate/BTCUSDT/BTCUSDT-fundingRate-2024-11.zip"
        );
        assert_eq!(
            client.daily_url(
                "ETHUSDT",
                DataType::AggTrades,
                NaiveDate::from_ymd_opt(2024, 2, 9).unwrap()
            ),
            "https://data.binance.vision/data/spot/daily/aggTrades/ETHUSDT/ETHUSDT-aggTrades-2024-02-09.zip"
        );
    }
}
