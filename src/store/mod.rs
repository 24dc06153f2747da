pub mod coverage;

pub use coverage::CoverageRange;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::Result;
use crate::types::{
    AggTrade, Candle, FundingRate, MarketType, OpenInterest, PremiumIndexKline, Timeframe,
};

/// Coverage sub-key for candle data: one coverage track per
/// `(timeframe, market_type)` pair within the symbol's store.
pub fn candle_sub_key(timeframe: Timeframe, market_type: MarketType) -> String {
    format!("{}:{}", timeframe.as_str(), market_type.as_str())
}

/// Per-symbol persistent store: one SQLite file per symbol holding
/// candles, aggTrades, funding, open interest, premium-index klines and
/// the coverage ledger. Batch writes run in a single transaction; either
/// the whole batch lands or none of it.
pub struct SymbolStore {
    symbol: String,
    pool: SqlitePool,
}

impl SymbolStore {
    pub async fn open(data_dir: &Path, symbol: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(format!("{symbol}.db"));
        info!("Opening symbol store at {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            symbol: symbol.to_string(),
            pool,
        };
        store.create_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps the shared
    /// `:memory:` database alive for the pool's lifetime.
    pub async fn open_in_memory(symbol: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self {
            symbol: symbol.to_string(),
            pool,
        };
        store.create_schema().await?;
        Ok(store)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                timeframe TEXT NOT NULL,
                market_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                trade_count INTEGER,
                quote_volume REAL,
                taker_buy_volume REAL,
                taker_buy_quote_volume REAL,
                PRIMARY KEY (timeframe, market_type, timestamp)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agg_trades (
                agg_id INTEGER PRIMARY KEY,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                first_trade_id INTEGER NOT NULL,
                last_trade_id INTEGER NOT NULL,
                transact_time INTEGER NOT NULL,
                is_buyer_maker INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_agg_trades_time ON agg_trades(transact_time)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS funding_rates (
                funding_time INTEGER PRIMARY KEY,
                funding_rate REAL NOT NULL,
                mark_price REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS open_interest (
                timestamp INTEGER PRIMARY KEY,
                open_interest REAL NOT NULL,
                open_interest_value REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS premium_index (
                interval TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                close_time INTEGER NOT NULL,
                PRIMARY KEY (interval, open_time)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS data_coverage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data_type TEXT NOT NULL,
                sub_key TEXT NOT NULL,
                range_start INTEGER NOT NULL,
                range_end INTEGER NOT NULL,
                is_complete INTEGER NOT NULL,
                last_updated TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_coverage_key
                ON data_coverage(data_type, sub_key, range_start)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert a candle batch in one transaction.
    pub async fn save_candles(
        &self,
        timeframe: Timeframe,
        market_type: MarketType,
        candles: &[Candle],
    ) -> Result<()> {
        if candles.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for c in candles {
            sqlx::query(
                r#"
                INSERT INTO candles (
                    timeframe, market_type, timestamp, open, high, low, close, volume,
                    trade_count, quote_volume, taker_buy_volume, taker_buy_quote_volume
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(timeframe, market_type, timestamp) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    trade_count = excluded.trade_count,
                    quote_volume = excluded.quote_volume,
                    taker_buy_volume = excluded.taker_buy_volume,
                    taker_buy_quote_volume = excluded.taker_buy_quote_volume
                "#,
            )
            .bind(timeframe.as_str())
            .bind(market_type.as_str())
            .bind(c.open_time)
            .bind(c.open)
            .bind(c.high)
            .bind(c.low)
            .bind(c.close)
            .bind(c.volume)
            .bind(c.trade_count.map(|v| v as i64))
            .bind(c.quote_volume)
            .bind(c.taker_buy_volume)
            .bind(c.taker_buy_quote_volume)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_candles(
        &self,
        timeframe: Timeframe,
        market_type: MarketType,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, open, high, low, close, volume,
                   trade_count, quote_volume, taker_buy_volume, taker_buy_quote_volume
            FROM candles
            WHERE timeframe = ? AND market_type = ? AND timestamp BETWEEN ? AND ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(timeframe.as_str())
        .bind(market_type.as_str())
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Candle {
                open_time: row.get("timestamp"),
                open: row.get("open"),
                high: row.get("high"),
                low: row.get("low"),
                close: row.get("close"),
                volume: row.get("volume"),
                trade_count: row
                    .get::<Option<i64>, _>("trade_count")
                    .map(|v| v as u64),
                quote_volume: row.get("quote_volume"),
                taker_buy_volume: row.get("taker_buy_volume"),
                taker_buy_quote_volume: row.get("taker_buy_quote_volume"),
            })
            .collect())
    }

    pub async fn count_candles(
        &self,
        timeframe: Timeframe,
        market_type: MarketType,
    ) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM candles WHERE timeframe = ? AND market_type = ?",
        )
        .bind(timeframe.as_str())
        .bind(market_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    pub async fn save_agg_trades(&self, trades: &[AggTrade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for t in trades {
            sqlx::query(
                r#"
                INSERT INTO agg_trades (
                    agg_id, price, quantity, first_trade_id, last_trade_id,
                    transact_time, is_buyer_maker
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(agg_id) DO UPDATE SET
                    price = excluded.price,
                    quantity = excluded.quantity,
                    first_trade_id = excluded.first_trade_id,
                    last_trade_id = excluded.last_trade_id,
                    transact_time = excluded.transact_time,
                    is_buyer_maker = excluded.is_buyer_maker
                "#,
            )
            .bind(t.agg_id)
            .bind(t.price)
            .bind(t.quantity)
            .bind(t.first_trade_id)
            .bind(t.last_trade_id)
            .bind(t.transact_time)
            .bind(if t.is_buyer_maker { 1 } else { 0 })
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_agg_trades(&self, start_ms: i64, end_ms: i64) -> Result<Vec<AggTrade>> {
        let rows = sqlx::query(
            r#"
            SELECT agg_id, price, quantity, first_trade_id, last_trade_id,
                   transact_time, is_buyer_maker
            FROM agg_trades
            WHERE transact_time BETWEEN ? AND ?
            ORDER BY agg_id ASC
            "#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AggTrade {
                agg_id: row.get("agg_id"),
                price: row.get("price"),
                quantity: row.get("quantity"),
                first_trade_id: row.get("first_trade_id"),
                last_trade_id: row.get("last_trade_id"),
                transact_time: row.get("transact_time"),
                is_buyer_maker: row.get::<i64, _>("is_buyer_maker") == 1,
            })
            .collect())
    }

    pub async fn save_funding_rates(&self, rates: &[FundingRate]) -> Result<()> {
        if rates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for r in rates {
            sqlx::query(
                r#"
                INSERT INTO funding_rates (funding_time, funding_rate, mark_price)
                VALUES (?, ?, ?)
                ON CONFLICT(funding_time) DO UPDATE SET
                    funding_rate = excluded.funding_rate,
                    mark_price = excluded.mark_price
                "#,
            )
            .bind(r.funding_time)
            .bind(r.rate)
            .bind(r.mark_price)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_funding_rates(&self, start_ms: i64, end_ms: i64) -> Result<Vec<FundingRate>> {
        let rows = sqlx::query(
            r#"
            SELECT funding_time, funding_rate, mark_price
            FROM funding_rates
            WHERE funding_time BETWEEN ? AND ?
            ORDER BY funding_time ASC
            "#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FundingRate {
                funding_time: row.get("funding_time"),
                rate: row.get("funding_rate"),
                mark_price: row.get("mark_price"),
            })
            .collect())
    }

    pub async fn save_open_interest(&self, samples: &[OpenInterest]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for s in samples {
            sqlx::query(
                r#"
                INSERT INTO open_interest (timestamp, open_interest, open_interest_value)
                VALUES (?, ?, ?)
                ON CONFLICT(timestamp) DO UPDATE SET
                    open_interest = excluded.open_interest,
                    open_interest_value = excluded.open_interest_value
                "#,
            )
            .bind(s.timestamp)
            .bind(s.open_interest)
            .bind(s.open_interest_value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_open_interest(&self, start_ms: i64, end_ms: i64) -> Result<Vec<OpenInterest>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, open_interest, open_interest_value
            FROM open_interest
            WHERE timestamp BETWEEN ? AND ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| OpenInterest {
                timestamp: row.get("timestamp"),
                open_interest: row.get("open_interest"),
                open_interest_value: row.get("open_interest_value"),
            })
            .collect())
    }

    pub async fn save_premium_index(&self, klines: &[PremiumIndexKline]) -> Result<()> {
        if klines.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for k in klines {
            sqlx::query(
                r#"
                INSERT INTO premium_index (interval, open_time, open, high, low, close, close_time)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(interval, open_time) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    close_time = excluded.close_time
                "#,
            )
            .bind(&k.interval)
            .bind(k.open_time)
            .bind(k.open)
            .bind(k.high)
            .bind(k.low)
            .bind(k.close)
            .bind(k.close_time)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_premium_index(
        &self,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<PremiumIndexKline>> {
        let rows = sqlx::query(
            r#"
            SELECT interval, open_time, open, high, low, close, close_time
            FROM premium_index
            WHERE interval = ? AND open_time BETWEEN ? AND ?
            ORDER BY open_time ASC
            "#,
        )
        .bind(interval)
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PremiumIndexKline {
                interval: row.get("interval"),
                open_time: row.get("open_time"),
                open: row.get("open"),
                high: row.get("high"),
                low: row.get("low"),
                close: row.get("close"),
                close_time: row.get("close_time"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn candle(ts: i64, close: f64) -> Candle {
        Candle::new(ts, close, close, close, close, 1.0)
    }

    #[tokio::test]
    async fn candle_upsert_round_trip() {
        let store = SymbolStore::open_in_memory("BTCUSDT").await.unwrap();
        let candles = vec![candle(0, 100.0), candle(60_000, 101.0)];
        assert_ok!(
            store
                .save_candles(Timeframe::M1, MarketType::Spot, &candles)
                .await
        );

        let loaded = store
            .get_candles(Timeframe::M1, MarketType::Spot, 0, 120_000)
            .await
            .unwrap();
        assert_eq!(loaded, candles);

        // Upsert semantics: same key overwrites.
        let replacement = vec![candle(0, 99.0)];
        store
            .save_candles(Timeframe::M1, MarketType::Spot, &replacement)
            .await
            .unwrap();
        let loaded = store
            .get_candles(Timeframe::M1, MarketType::Spot, 0, 0)
            .await
            .unwrap();
        assert_eq!(loaded[0].close, 99.0);
        assert_eq!(
            store
                .count_candles(Timeframe::M1, MarketType::Spot)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn candles_are_keyed_by_timeframe_and_market() {
        let store = SymbolStore::open_in_memory("BTCUSDT").await.unwrap();
        store
            .save_candles(Timeframe::M1, MarketType::Spot, &[candle(0, 1.0)])
            .await
            .unwrap();
        store
            .save_candles(Timeframe::H1, MarketType::Spot, &[candle(0, 2.0)])
            .await
            .unwrap();
        store
            .save_candles(Timeframe::M1, MarketType::Perp, &[candle(0, 3.0)])
            .await
            .unwrap();

        let spot_m1 = store
            .get_candles(Timeframe::M1, MarketType::Spot, 0, 0)
            .await
            .unwrap();
        assert_eq!(spot_m1[0].close, 1.0);
        let perp_m1 = store
            .get_candles(Timeframe::M1, MarketType::Perp, 0, 0)
            .await
            .unwrap();
        assert_eq!(perp_m1[0].close, 3.0);
    }

    #[tokio::test]
    async fn agg_trades_keyed_by_agg_id() {
        let store = SymbolStore::open_in_memory("BTCUSDT").await.unwrap();
        let trades = vec![
            AggTrade {
                agg_id: 10,
                price: 100.0,
                quantity: 0.5,
                first_trade_id: 100,
                last_trade_id: 101,
                transact_time: 1_000,
                is_buyer_maker: true,
            },
            AggTrade {
                agg_id: 11,
                price: 100.5,
                quantity: 0.25,
                first_trade_id: 102,
                last_trade_id: 102,
                transact_time: 1_500,
                is_buyer_maker: false,
            },
        ];
        store.save_agg_trades(&trades).await.unwrap();
        let loaded = store.get_agg_trades(0, 2_000).await.unwrap();
        assert_eq!(loaded, trades);
    }

    #[tokio::test]
    async fn funding_and_open_interest_round_trip() {
        let store = SymbolStore::open_in_memory("BTCUSDT").await.unwrap();
        let funding = vec![FundingRate {
            funding_time: 8 * 3_600_000,
            rate: 0.0001,
            mark_price: Some(50_000.0),
        }];
        store.save_funding_rates(&funding).await.unwrap();
        assert_eq!(
            store.get_funding_rates(0, i64::MAX).await.unwrap(),
            funding
        );

        let oi = vec![OpenInterest {
            timestamp: 300_000,
            open_interest: 123.0,
            open_interest_value: 6_150_000.0,
        }];
        store.save_open_interest(&oi).await.unwrap();
        assert_eq!(store.get_open_interest(0, i64::MAX).await.unwrap(), oi);
    }

    #[tokio::test]
    async fn premium_index_keyed_by_interval() {
        let store = SymbolStore::open_in_memory("BTCUSDT").await.unwrap();
        let klines = vec![PremiumIndexKline {
            interval: "1h".to_string(),
            open_time: 0,
            open: 0.0001,
            high: 0.0002,
            low: 0.0,
            close: 0.00015,
            close_time: 3_599_999,
        }];
        store.save_premium_index(&klines).await.unwrap();
        assert_eq!(
            store.get_premium_index("1h", 0, i64::MAX).await.unwrap(),
            klines
        );
        assert!(store
            .get_premium_index("8h", 0, i64::MAX)
            .await
            .unwrap()
            .is_empty());
    }
}
