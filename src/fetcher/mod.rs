//! Coverage-driven data acquisition. Given a symbol/data-type/range, the
//! fetcher asks the store for gaps, fills large gaps from bulk archives
//! (up to four parallel downloads) and the remainder through paginated
//! REST, then returns the materialized rows. Every successful fill is
//! recorded in the coverage ledger; ranges touching the current interval
//! are recorded incomplete so they are re-requested later.

pub mod archive;
pub mod rest;

pub use archive::{ArchiveBatch, ArchiveClient, ParseStats};
pub use rest::{MarketApi, MarketDataApi, PAGE_LIMIT};

use bytes::Bytes;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{QuantError, Result};
use crate::store::{candle_sub_key, SymbolStore};
use crate::types::{
    AggTrade, Candle, DataType, FundingRate, MarketType, OpenInterest, Timeframe,
};

const MS_PER_DAY: i64 = 86_400_000;
const MS_PER_HOUR: i64 = 3_600_000;
const FUNDING_WINDOW_MS: i64 = 8 * MS_PER_HOUR;

/// Gap sizes at which bulk archives beat paginated REST.
const BULK_CANDLES_MIN_MS: i64 = 30 * MS_PER_DAY;
const BULK_FUNDING_MIN_MS: i64 = 60 * MS_PER_DAY;
const BULK_AGG_TRADES_MIN_MS: i64 = 3 * MS_PER_DAY;

const MAX_PARALLEL_DOWNLOADS: usize = 4;
const ARCHIVE_FILL_TIMEOUT: Duration = Duration::from_secs(600);

pub struct DataFetcher<A: MarketDataApi = MarketApi> {
    store: Arc<SymbolStore>,
    archive: ArchiveClient,
    api: A,
    cancel: Arc<AtomicBool>,
}

impl<A: MarketDataApi> DataFetcher<A> {
    pub fn with_api(store: Arc<SymbolStore>, archive: ArchiveClient, api: A) -> Self {
        Self {
            store,
            archive,
            api,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation flag, checked between archive months,
    /// REST pages and store writes.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(QuantError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Make `[start_ms, end_ms]` fully covered for candles and return them.
    pub async fn ensure_candles(
        &self,
        timeframe: Timeframe,
        market_type: MarketType,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let sub_key = candle_sub_key(timeframe, market_type);
        self.store
            .prune_incomplete(DataType::Candles, &sub_key, start_ms, end_ms)
            .await?;

        let gaps = self
            .store
            .find_gaps(DataType::Candles, &sub_key, start_ms, end_ms)
            .await?;
        let has_bulk_gap = gaps.iter().any(|(s, e)| e - s >= BULK_CANDLES_MIN_MS);
        if has_bulk_gap {
            let fill = self.fill_candles_from_archive(timeframe, market_type, &sub_key, &gaps);
            timeout(ARCHIVE_FILL_TIMEOUT, fill)
                .await
                .map_err(|_| QuantError::Fetch("archive fill timed out".to_string()))??;
        }

        // Whatever the archives did not cover (404 months, edges, the
        // current month) goes through paginated REST.
        let gaps = self
            .store
            .find_gaps(DataType::Candles, &sub_key, start_ms, end_ms)
            .await?;
        for (gap_start, gap_end) in gaps {
            self.fill_candles_from_api(timeframe, market_type, &sub_key, gap_start, gap_end)
                .await?;
        }

        let candles = self
            .store
            .get_candles(timeframe, market_type, start_ms, end_ms)
            .await?;
        info!(
            "{}: {} candles materialized for {}/{} [{start_ms}, {end_ms}]",
            self.store.symbol(),
            candles.len(),
            timeframe,
            market_type
        );
        Ok(candles)
    }

    async fn fill_candles_from_archive(
        &self,
        timeframe: Timeframe,
        market_type: MarketType,
        sub_key: &str,
        gaps: &[(i64, i64)],
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        for &(gap_start, gap_end) in gaps {
            if gap_end - gap_start < BULK_CANDLES_MIN_MS {
                continue;
            }
            let months = archived_months(gap_start, gap_end, now);
            if months.is_empty() {
                continue;
            }
            debug!(
                "Filling candle gap [{gap_start}, {gap_end}] from {} monthly archives",
                months.len()
            );

            let downloads = stream::iter(months)
                .map(|month| {
                    let url = self.archive.monthly_url(
                        self.store.symbol(),
                        DataType::Candles,
                        market_type,
                        Some(timeframe),
                        month.year,
                        month.month,
                    );
                    let client = &self.archive;
                    async move { (month, client.download(&url).await) }
                })
                .buffered(MAX_PARALLEL_DOWNLOADS)
                .collect::<Vec<_>>()
                .await;

            for (month, result) in downloads {
                self.check_cancel()?;
                let Some(data) = result? else { continue };
                let stats = self
                    .ingest_archive(data, DataType::Candles, Some((timeframe, market_type)))
                    .await?;
                if stats.skipped > 0 {
                    warn!(
                        "{}-{:02}: {} malformed rows skipped",
                        month.year, month.month, stats.skipped
                    );
                }
                self.store
                    .add_coverage(DataType::Candles, sub_key, month.start_ms, month.end_ms, true)
                    .await?;
            }
        }
        Ok(())
    }

    async fn fill_candles_from_api(
        &self,
        timeframe: Timeframe,
        market_type: MarketType,
        sub_key: &str,
        gap_start: i64,
        gap_end: i64,
    ) -> Result<()> {
        let mut cursor = gap_start;
        let mut last_saved: Option<i64> = None;
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                // Record what actually landed so a retry resumes here.
                if let Some(t) = last_saved {
                    self.store
                        .add_coverage(DataType::Candles, sub_key, gap_start, t, false)
                        .await?;
                }
                return Err(QuantError::Cancelled);
            }
            let page = self
                .api
                .klines_page(self.store.symbol(), timeframe, market_type, cursor, gap_end)
                .await?;
            if page.is_empty() {
                break;
            }
            self.store
                .save_candles(timeframe, market_type, &page)
                .await?;
            let last = page[page.len() - 1].open_time;
            last_saved = Some(last);
            cursor = last + timeframe.interval_ms();
            if page.len() < PAGE_LIMIT as usize || cursor > gap_end {
                break;
            }
        }
        let complete = gap_end < current_hour_start();
        self.store
            .add_coverage(DataType::Candles, sub_key, gap_start, gap_end, complete)
            .await?;
        Ok(())
    }

    /// Make `[start_ms, end_ms]` fully covered for funding and return it.
    pub async fn ensure_funding(&self, start_ms: i64, end_ms: i64) -> Result<Vec<FundingRate>> {
        let sub_key = "";
        self.store
            .prune_incomplete(DataType::FundingRates, sub_key, start_ms, end_ms)
            .await?;

        let gaps = self
            .store
            .find_gaps(DataType::FundingRates, sub_key, start_ms, end_ms)
            .await?;
        let has_bulk_gap = gaps.iter().any(|(s, e)| e - s >= BULK_FUNDING_MIN_MS);
        if has_bulk_gap {
            let now = Utc::now().timestamp_millis();
            for &(gap_start, gap_end) in &gaps {
                if gap_end - gap_start < BULK_FUNDING_MIN_MS {
                    continue;
                }
                let fill = self.fill_funding_from_archive(sub_key, gap_start, gap_end, now);
                timeout(ARCHIVE_FILL_TIMEOUT, fill)
                    .await
                    .map_err(|_| QuantError::Fetch("archive fill timed out".to_string()))??;
            }
        }

        let gaps = self
            .store
            .find_gaps(DataType::FundingRates, sub_key, start_ms, end_ms)
            .await?;
        for (gap_start, gap_end) in gaps {
            let mut cursor = gap_start;
            let mut last_saved: Option<i64> = None;
            loop {
                if self.cancel.load(Ordering::Relaxed) {
                    if let Some(t) = last_saved {
                        self.store
                            .add_coverage(DataType::FundingRates, sub_key, gap_start, t, false)
                            .await?;
                    }
                    return Err(QuantError::Cancelled);
                }
                let page = self
                    .api
                    .funding_page(self.store.symbol(), cursor, gap_end)
                    .await?;
                if page.is_empty() {
                    break;
                }
                self.store.save_funding_rates(&page).await?;
                let last = page[page.len() - 1].funding_time;
                last_saved = Some(last);
                cursor = last + 1;
                if page.len() < PAGE_LIMIT as usize || cursor > gap_end {
                    break;
                }
            }
            let complete = gap_end < current_funding_window_start();
            self.store
                .add_coverage(DataType::FundingRates, sub_key, gap_start, gap_end, complete)
                .await?;
        }

        self.store.get_funding_rates(start_ms, end_ms).await
    }

    async fn fill_funding_from_archive(
        &self,
        sub_key: &str,
        gap_start: i64,
        gap_end: i64,
        now: i64,
    ) -> Result<()> {
        let months = archived_months(gap_start, gap_end, now);
        let downloads = stream::iter(months)
            .map(|month| {
                let url = self.archive.monthly_url(
                    self.store.symbol(),
                    DataType::FundingRates,
                    MarketType::Perp,
                    None,
                    month.year,
                    month.month,
                );
                let client = &self.archive;
                async move { (month, client.download(&url).await) }
            })
            .buffered(MAX_PARALLEL_DOWNLOADS)
            .collect::<Vec<_>>()
            .await;

        for (month, result) in downloads {
            self.check_cancel()?;
            let Some(data) = result? else { continue };
            let stats = self
                .ingest_archive(data, DataType::FundingRates, None)
                .await?;
            if stats.skipped > 0 {
                warn!(
                    "{}-{:02}: {} malformed funding rows skipped",
                    month.year, month.month, stats.skipped
                );
            }
            self.store
                .add_coverage(
                    DataType::FundingRates,
                    sub_key,
                    month.start_ms,
                    month.end_ms,
                    true,
                )
                .await?;
        }
        Ok(())
    }

    /// Make `[start_ms, end_ms]` fully covered for aggTrades and return
    /// them. Bulk fills use daily archives; monthly aggTrade files are
    /// too large to pull routinely.
    pub async fn ensure_agg_trades(&self, start_ms: i64, end_ms: i64) -> Result<Vec<AggTrade>> {
        let sub_key = "";
        self.store
            .prune_incomplete(DataType::AggTrades, sub_key, start_ms, end_ms)
            .await?;

        let gaps = self
            .store
            .find_gaps(DataType::AggTrades, sub_key, start_ms, end_ms)
            .await?;
        for &(gap_start, gap_end) in &gaps {
            if gap_end - gap_start < BULK_AGG_TRADES_MIN_MS {
                continue;
            }
            let fill = self.fill_agg_trades_from_archive(sub_key, gap_start, gap_end);
            timeout(ARCHIVE_FILL_TIMEOUT, fill)
                .await
                .map_err(|_| QuantError::Fetch("archive fill timed out".to_string()))??;
        }

        let gaps = self
            .store
            .find_gaps(DataType::AggTrades, sub_key, start_ms, end_ms)
            .await?;
        for (gap_start, gap_end) in gaps {
            let mut cursor = gap_start;
            let mut last_saved: Option<i64> = None;
            loop {
                if self.cancel.load(Ordering::Relaxed) {
                    if let Some(t) = last_saved {
                        self.store
                            .add_coverage(DataType::AggTrades, sub_key, gap_start, t, false)
                            .await?;
                    }
                    return Err(QuantError::Cancelled);
                }
                let page = self
                    .api
                    .agg_trades_page(self.store.symbol(), cursor, gap_end)
                    .await?;
                if page.is_empty() {
                    break;
                }
                self.store.save_agg_trades(&page).await?;
                let last = page[page.len() - 1].transact_time;
                last_saved = Some(last);
                // Multiple trades can share a millisecond; never move the
                // cursor backwards or stall.
                cursor = cursor.max(last + 1);
                if page.len() < PAGE_LIMIT as usize || cursor > gap_end {
                    break;
                }
            }
            let complete = gap_end < current_hour_start();
            self.store
                .add_coverage(DataType::AggTrades, sub_key, gap_start, gap_end, complete)
                .await?;
        }

        self.store.get_agg_trades(start_ms, end_ms).await
    }

    async fn fill_agg_trades_from_archive(
        &self,
        sub_key: &str,
        gap_start: i64,
        gap_end: i64,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let days = archived_days(gap_start, gap_end, now);
        if days.is_empty() {
            return Ok(());
        }
        debug!(
            "Filling aggTrade gap [{gap_start}, {gap_end}] from {} daily archives",
            days.len()
        );

        let downloads = stream::iter(days)
            .map(|day| {
                let url = self
                    .archive
                    .daily_url(self.store.symbol(), DataType::AggTrades, day.date);
                let client = &self.archive;
                async move { (day, client.download(&url).await) }
            })
            .buffered(MAX_PARALLEL_DOWNLOADS)
            .collect::<Vec<_>>()
            .await;

        for (day, result) in downloads {
            self.check_cancel()?;
            let Some(data) = result? else { continue };
            let stats = self.ingest_archive(data, DataType::AggTrades, None).await?;
            if stats.skipped > 0 {
                warn!("{}: {} malformed aggTrade rows skipped", day.date, stats.skipped);
            }
            self.store
                .add_coverage(DataType::AggTrades, sub_key, day.start_ms, day.end_ms, true)
                .await?;
        }
        Ok(())
    }

    /// Open interest has no archival feed worth pulling; REST only.
    pub async fn ensure_open_interest(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<OpenInterest>> {
        let sub_key = "";
        self.store
            .prune_incomplete(DataType::OpenInterest, sub_key, start_ms, end_ms)
            .await?;

        let gaps = self
            .store
            .find_gaps(DataType::OpenInterest, sub_key, start_ms, end_ms)
            .await?;
        for (gap_start, gap_end) in gaps {
            let mut cursor = gap_start;
            let mut last_saved: Option<i64> = None;
            loop {
                if self.cancel.load(Ordering::Relaxed) {
                    if let Some(t) = last_saved {
                        self.store
                            .add_coverage(DataType::OpenInterest, sub_key, gap_start, t, false)
                            .await?;
                    }
                    return Err(QuantError::Cancelled);
                }
                let page = self
                    .api
                    .open_interest_page(self.store.symbol(), cursor, gap_end)
                    .await?;
                if page.is_empty() {
                    break;
                }
                self.store.save_open_interest(&page).await?;
                let last = page[page.len() - 1].timestamp;
                last_saved = Some(last);
                cursor = cursor.max(last + 1);
                if page.len() < rest::OPEN_INTEREST_PAGE_LIMIT as usize || cursor > gap_end {
                    break;
                }
            }
            let complete = gap_end < current_hour_start();
            self.store
                .add_coverage(DataType::OpenInterest, sub_key, gap_start, gap_end, complete)
                .await?;
        }

        self.store.get_open_interest(start_ms, end_ms).await
    }

    /// Decompress-and-parse runs on a blocking thread; batches arrive
    /// over a bounded channel and are written transactionally as they do.
    async fn ingest_archive(
        &self,
        data: Bytes,
        data_type: DataType,
        candle_context: Option<(Timeframe, MarketType)>,
    ) -> Result<ParseStats> {
        let (tx, mut rx) = mpsc::channel(4);
        let parse = tokio::spawn(archive::parse_archive(data, data_type, tx));

        while let Some(batch) = rx.recv().await {
            match batch {
                ArchiveBatch::Candles(candles) => {
                    let (timeframe, market_type) = candle_context.ok_or_else(|| {
                        QuantError::Fetch("candle batch without timeframe context".to_string())
                    })?;
                    self.store
                        .save_candles(timeframe, market_type, &candles)
                        .await?;
                }
                ArchiveBatch::AggTrades(trades) => self.store.save_agg_trades(&trades).await?,
                ArchiveBatch::Funding(rates) => self.store.save_funding_rates(&rates).await?,
            }
        }

        parse
            .await
            .map_err(|e| QuantError::Fetch(format!("archive parse task failed: {e}")))?
    }
}

impl DataFetcher<MarketApi> {
    pub fn new(store: Arc<SymbolStore>, settings: &crate::config::Settings) -> Result<Self> {
        Ok(Self::with_api(
            store,
            ArchiveClient::new(settings)?,
            MarketApi::new(settings)?,
        ))
    }
}

#[derive(Debug, Clone, Copy)]
struct ArchiveMonth {
    year: i32,
    month: u32,
    start_ms: i64,
    end_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct ArchiveDay {
    date: NaiveDate,
    start_ms: i64,
    end_ms: i64,
}

fn current_hour_start() -> i64 {
    let now = Utc::now().timestamp_millis();
    now - now.rem_euclid(MS_PER_HOUR)
}

fn current_funding_window_start() -> i64 {
    let now = Utc::now().timestamp_millis();
    now - now.rem_euclid(FUNDING_WINDOW_MS)
}

/// UTC calendar months overlapping `[start, end]` whose archives can
/// exist: the current (incomplete) month is capped away at yesterday.
fn archived_months(start: i64, end: i64, now: i64) -> Vec<ArchiveMonth> {
    let yesterday_end = now - now.rem_euclid(MS_PER_DAY) - 1;
    let end = end.min(yesterday_end);
    if end < start {
        return Vec::new();
    }

    let mut months = Vec::new();
    let mut date = month_floor(start);
    loop {
        let month_start = Utc
            .with_ymd_and_hms(date.year(), date.month(), 1, 0, 0, 0)
            .single()
            .map(|d| d.timestamp_millis())
            .unwrap_or(i64::MAX);
        let next = next_month(date);
        let month_end = Utc
            .with_ymd_and_hms(next.year(), next.month(), 1, 0, 0, 0)
            .single()
            .map(|d| d.timestamp_millis() - 1)
            .unwrap_or(i64::MAX);
        if month_start > end {
            break;
        }
        // Only whole months are published; a month still in progress (or
        // truncated by the yesterday cap) is left to the REST path.
        if month_end <= end {
            months.push(ArchiveMonth {
                year: date.year(),
                month: date.month(),
                start_ms: month_start,
                end_ms: month_end,
            });
        }
        date = next;
    }
    months
}

fn archived_days(start: i64, end: i64, now: i64) -> Vec<ArchiveDay> {
    let yesterday_end = now - now.rem_euclid(MS_PER_DAY) - 1;
    let end = end.min(yesterday_end);
    if end < start {
        return Vec::new();
    }

    let mut days = Vec::new();
    let first = ms_to_date(start);
    let last = ms_to_date(end);
    let mut date = first;
    while date <= last {
        let day_start = Utc
            .with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
            .single()
            .map(|d| d.timestamp_millis())
            .unwrap_or(i64::MAX);
        let day_end = day_start + MS_PER_DAY - 1;
        if day_end <= end {
            days.push(ArchiveDay {
                date,
                start_ms: day_start,
                end_ms: day_end,
            });
        }
        date += ChronoDuration::days(1);
    }
    days
}

fn ms_to_date(ms: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|d| d.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

fn month_floor(ms: i64) -> NaiveDate {
    let date = ms_to_date(ms);
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(NaiveDate::MIN)
}

fn next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn ms(y: i32, m: u32, d: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn archived_months_cover_whole_months_only() {
        let now = ms(2024, 6, 15);
        // Mid-January through mid-April: only Feb and Mar are whole.
        let months = archived_months(ms(2024, 1, 15), ms(2024, 4, 10), now);
        let labels: Vec<(i32, u32)> = months.iter().map(|m| (m.year, m.month)).collect();
        assert_eq!(labels, vec![(2024, 2), (2024, 3)]);
    }

    #[test]
    fn archived_months_skip_current_month() {
        let now = ms(2024, 6, 15);
        let months = archived_months(ms(2024, 5, 1), ms(2024, 6, 30), now);
        let labels: Vec<(i32, u32)> = months.iter().map(|m| (m.year, m.month)).collect();
        assert_eq!(labels, vec![(2024, 5)]);
    }

    #[test]
    fn archived_days_cap_at_yesterday() {
        let now = ms(2024, 6, 15) + 5 * MS_PER_HOUR;
        let days = archived_days(ms(2024, 6, 12), ms(2024, 6, 20), now);
        let dates: Vec<NaiveDate> = days.iter().map(|d| d.date).collect();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2024, 6, 12).unwrap(),
                NaiveDate::from_ymd_opt(2024, 6, 13).unwrap(),
                NaiveDate::from_ymd_opt(2024, 6, 14).unwrap(),
            ]
        );
    }

    /// Stub exchange producing one synthetic candle per interval.
    struct StubApi {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl MarketDataApi for StubApi {
        async fn klines_page(
            &self,
            _symbol: &str,
            timeframe: Timeframe,
            _market_type: MarketType,
            start_ms: i64,
            end_ms: i64,
        ) -> crate::error::Result<Vec<Candle>> {
            *self.calls.lock().unwrap() += 1;
            let step = timeframe.interval_ms();
            let mut out = Vec::new();
            let mut t = start_ms - start_ms.rem_euclid(step);
            if t < start_ms {
                t += step;
            }
            while t <= end_ms && out.len() < PAGE_LIMIT as usize {
                out.push(Candle::new(t, 100.0, 101.0, 99.0, 100.5, 1.0));
                t += step;
            }
            Ok(out)
        }

        async fn agg_trades_page(
            &self,
            _symbol: &str,
            _start_ms: i64,
            _end_ms: i64,
        ) -> crate::error::Result<Vec<AggTrade>> {
            Ok(Vec::new())
        }

        async fn funding_page(
            &self,
            _symbol: &str,
            start_ms: i64,
            end_ms: i64,
        ) -> crate::error::Result<Vec<FundingRate>> {
            let mut out = Vec::new();
            let mut t = start_ms - start_ms.rem_euclid(FUNDING_WINDOW_MS);
            if t < start_ms {
                t += FUNDING_WINDOW_MS;
            }
            while t <= end_ms && out.len() < PAGE_LIMIT as usize {
                out.push(FundingRate {
                    funding_time: t,
                    rate: 0.0001,
                    mark_price: None,
                });
                t += FUNDING_WINDOW_MS;
            }
            Ok(out)
        }

        async fn open_interest_page(
            &self,
            _symbol: &str,
            _start_ms: i64,
            _end_ms: i64,
        ) -> crate::error::Result<Vec<OpenInterest>> {
            Ok(Vec::new())
        }
    }

    async fn fetcher_with_stub() -> DataFetcher<StubApi> {
        let store = Arc::new(SymbolStore::open_in_memory("BTCUSDT").await.unwrap());
        let archive = ArchiveClient::new(&Settings::default()).unwrap();
        DataFetcher::with_api(
            store,
            archive,
            StubApi {
                calls: Mutex::new(0),
            },
        )
    }

    #[tokio::test]
    async fn rest_fill_records_coverage_and_materializes() {
        let fetcher = fetcher_with_stub().await;
        let start = ms(2023, 1, 1);
        let end = start + 10 * MS_PER_HOUR - 1;

        let candles = fetcher
            .ensure_candles(Timeframe::H1, MarketType::Spot, start, end)
            .await
            .unwrap();
        assert_eq!(candles.len(), 10);

        let sub_key = candle_sub_key(Timeframe::H1, MarketType::Spot);
        assert!(fetcher
            .store
            .is_fully_covered(DataType::Candles, &sub_key, start, end)
            .await
            .unwrap());

        // Second call is served from the store: no further API calls.
        let before = *fetcher.api.calls.lock().unwrap();
        let again = fetcher
            .ensure_candles(Timeframe::H1, MarketType::Spot, start, end)
            .await
            .unwrap();
        assert_eq!(again.len(), 10);
        assert_eq!(*fetcher.api.calls.lock().unwrap(), before);
    }

    #[tokio::test]
    async fn cancelled_fetch_returns_cancelled() {
        let fetcher = fetcher_with_stub().await;
        fetcher.cancel_flag().store(true, Ordering::Relaxed);
        let start = ms(2023, 1, 1);
        let result = fetcher
            .ensure_candles(Timeframe::H1, MarketType::Spot, start, start + MS_PER_HOUR)
            .await;
        assert!(matches!(result, Err(QuantError::Cancelled)));
    }

    #[tokio::test]
    async fn funding_fill_round_trips() {
        let fetcher = fetcher_with_stub().await;
        let start = ms(2023, 1, 1);
        let end = start + 3 * FUNDING_WINDOW_MS - 1;
        let rates = fetcher.ensure_funding(start, end).await.unwrap();
        assert_eq!(rates.len(), 3);
        assert!(fetcher
            .store
            .is_fully_covered(DataType::FundingRates, "", start, end)
            .await
            .unwrap());
    }
}
