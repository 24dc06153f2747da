//! Incremental REST access to the exchange market-data endpoints. Pages
//! are capped at 1000 records and paced through a rate limiter so two
//! requests are never closer than 100ms. Pagination and cancellation live
//! in the fetcher; this layer only knows how to get one page.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use std::time::Duration;

use crate::config::Settings;
use crate::error::{QuantError, Result};
use crate::types::{AggTrade, Candle, FundingRate, MarketType, OpenInterest, Timeframe};

pub const PAGE_LIMIT: u32 = 1000;
pub const OPEN_INTEREST_PAGE_LIMIT: u32 = 500;
const MIN_REQUEST_SPACING: Duration = Duration::from_millis(100);

/// One-page market-data access, seam for stubbing the exchange in tests.
#[async_trait]
pub trait MarketDataApi: Send + Sync {
    async fn klines_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        market_type: MarketType,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>>;

    async fn agg_trades_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<AggTrade>>;

    async fn funding_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingRate>>;

    async fn open_interest_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<OpenInterest>>;
}

pub struct MarketApi {
    http: reqwest::Client,
    spot_base: String,
    futures_base: String,
    limiter: governor::DefaultDirectRateLimiter,
}

impl MarketApi {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()?;
        let quota =
            Quota::with_period(MIN_REQUEST_SPACING).expect("request spacing is non-zero");
        Ok(Self {
            http,
            spot_base: settings.spot_api_url.clone(),
            futures_base: settings.futures_api_url.clone(),
            limiter: RateLimiter::direct(quota),
        })
    }

    async fn throttle(&self) {
        self.limiter.until_ready().await;
    }
}

#[async_trait]
impl MarketDataApi for MarketApi {
    async fn klines_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        market_type: MarketType,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        self.throttle().await;
        let url = match market_type {
            MarketType::Spot => format!("{}/api/v3/klines", self.spot_base),
            MarketType::Perp => format!("{}/fapi/v1/klines", self.futures_base),
        };
        let rows: Vec<Vec<serde_json::Value>> = self
            .http
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", timeframe.as_str().to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        rows.into_iter().map(|row| parse_kline_row(&row)).collect()
    }

    async fn agg_trades_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<AggTrade>> {
        self.throttle().await;
        let url = format!("{}/api/v3/aggTrades", self.spot_base);
        let rows: Vec<AggTradeRow> = self
            .http
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        rows.into_iter().map(AggTradeRow::into_agg_trade).collect()
    }

    async fn funding_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingRate>> {
        self.throttle().await;
        let url = format!("{}/fapi/v1/fundingRate", self.futures_base);
        let rows: Vec<FundingRow> = self
            .http
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        rows.into_iter().map(FundingRow::into_funding_rate).collect()
    }

    async fn open_interest_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<OpenInterest>> {
        self.throttle().await;
        let url = format!("{}/futures/data/openInterestHist", self.futures_base);
        let rows: Vec<OpenInterestRow> = self
            .http
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("period", "5m".to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", OPEN_INTEREST_PAGE_LIMIT.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        rows.into_iter()
            .map(OpenInterestRow::into_open_interest)
            .collect()
    }
}

/// Kline arrays come back positional:
/// `[open_time, open, high, low, close, volume, close_time, quote_volume,
///   trade_count, taker_buy_volume, taker_buy_quote_volume, _ignore]`.
fn parse_kline_row(row: &[serde_json::Value]) -> Result<Candle> {
    let int_at = |i: usize| -> Result<i64> {
        row.get(i)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| QuantError::Parse(format!("kline row: missing integer field {i}")))
    };
    let num_at = |i: usize| -> Result<f64> {
        let v = row
            .get(i)
            .ok_or_else(|| QuantError::Parse(format!("kline row: missing field {i}")))?;
        match v {
            serde_json::Value::String(s) => s
                .parse()
                .map_err(|_| QuantError::Parse(format!("kline row: bad number '{s}'"))),
            serde_json::Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| QuantError::Parse("kline row: bad number".to_string())),
            _ => Err(QuantError::Parse(format!(
                "kline row: unexpected value in field {i}"
            ))),
        }
    };

    let candle = Candle {
        open_time: int_at(0)?,
        open: num_at(1)?,
        high: num_at(2)?,
        low: num_at(3)?,
        close: num_at(4)?,
        volume: num_at(5)?,
        trade_count: row.get(8).and_then(|v| v.as_u64()),
        quote_volume: num_at(7).ok(),
        taker_buy_volume: num_at(9).ok(),
        taker_buy_quote_volume: num_at(10).ok(),
    };
    candle.validate()?;
    Ok(candle)
}

#[derive(Debug, Deserialize)]
struct AggTradeRow {
    #[serde(rename = "a")]
    agg_id: i64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "f")]
    first_trade_id: i64,
    #[serde(rename = "l")]
    last_trade_id: i64,
    #[serde(rename = "T")]
    transact_time: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

impl AggTradeRow {
    fn into_agg_trade(self) -> Result<AggTrade> {
        Ok(AggTrade {
            agg_id: self.agg_id,
            price: parse_decimal_str(&self.price, "aggTrade price")?,
            quantity: parse_decimal_str(&self.quantity, "aggTrade quantity")?,
            first_trade_id: self.first_trade_id,
            last_trade_id: self.last_trade_id,
            transact_time: self.transact_time,
            is_buyer_maker: self.is_buyer_maker,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FundingRow {
    #[serde(rename = "fundingTime")]
    funding_time: i64,
    #[serde(rename = "fundingRate")]
    funding_rate: String,
    #[serde(rename = "markPrice", default)]
    mark_price: Option<String>,
}

impl FundingRow {
    fn into_funding_rate(self) -> Result<FundingRate> {
        let mark_price = match self.mark_price.as_deref() {
            None | Some("") => None,
            Some(s) => Some(parse_decimal_str(s, "funding markPrice")?),
        };
        Ok(FundingRate {
            funding_time: self.funding_time,
            rate: parse_decimal_str(&self.funding_rate, "fundingRate")?,
            mark_price,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenInterestRow {
    #[serde(rename = "sumOpenInterest")]
    open_interest: String,
    #[serde(rename = "sumOpenInterestValue")]
    open_interest_value: String,
    timestamp: i64,
}

impl OpenInterestRow {
    fn into_open_interest(self) -> Result<OpenInterest> {
        Ok(OpenInterest {
            timestamp: self.timestamp,
            open_interest: parse_decimal_str(&self.open_interest, "sumOpenInterest")?,
            open_interest_value: parse_decimal_str(
                &self.open_interest_value,
                "sumOpenInterestValue",
            )?,
        })
    }
}

fn parse_decimal_str(s: &str, field: &str) -> Result<f64> {
    s.parse()
        .map_err(|_| QuantError::Parse(format!("{field}: bad number '{s}'")))
}
