use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use quantbot::config::Settings;
use quantbot::engine::{BacktestEngine, Phase, RunConfig};
use quantbot::fetcher::DataFetcher;
use quantbot::store::SymbolStore;
use quantbot::types::{DataType, MarketType, Strategy, StrategySpec, Timeframe};

#[derive(Parser)]
#[command(name = "quantbot")]
#[command(version = "0.1.0")]
#[command(about = "Market-data mirror and strategy backtest engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a strategy over historical candles
    Backtest {
        /// Strategy specification file (JSON)
        #[arg(long)]
        strategy: String,
        /// Symbol, e.g. BTCUSDT
        #[arg(long)]
        symbol: String,
        /// Timeframe, e.g. 1h
        #[arg(long, default_value = "1h")]
        timeframe: String,
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// End date (YYYY-MM-DD, inclusive)
        #[arg(long)]
        end: String,
        /// Initial capital
        #[arg(long, default_value = "10000")]
        capital: f64,
        /// Warm-up bars excluded from trading
        #[arg(long, default_value = "0")]
        warmup: usize,
        /// Optional phases file (JSON array)
        #[arg(long)]
        phases: Option<String>,
        /// Write the full result JSON here
        #[arg(long)]
        out: Option<String>,
    },
    /// Ensure local coverage for a symbol/data-type/range
    Fetch {
        #[arg(long)]
        symbol: String,
        /// candles | agg_trades | funding_rates | open_interest
        #[arg(long, default_value = "candles")]
        data_type: String,
        #[arg(long, default_value = "1h")]
        timeframe: String,
        /// spot | perp
        #[arg(long, default_value = "spot")]
        market: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    /// Show the coverage ledger for a symbol
    Coverage {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        data_type: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = Settings::load(Some(&cli.config))?;

    match cli.command {
        Commands::Backtest {
            strategy,
            symbol,
            timeframe,
            start,
            end,
            capital,
            warmup,
            phases,
            out,
        } => {
            run_backtest(
                &settings, &strategy, &symbol, &timeframe, &start, &end, capital, warmup,
                phases.as_deref(), out.as_deref(),
            )
            .await?;
        }
        Commands::Fetch {
            symbol,
            data_type,
            timeframe,
            market,
            start,
            end,
        } => {
            run_fetch(&settings, &symbol, &data_type, &timeframe, &market, &start, &end).await?;
        }
        Commands::Coverage { symbol, data_type } => {
            show_coverage(&settings, &symbol, data_type.as_deref()).await?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_backtest(
    settings: &Settings,
    strategy_path: &str,
    symbol: &str,
    timeframe: &str,
    start: &str,
    end: &str,
    capital: f64,
    warmup: usize,
    phases_path: Option<&str>,
    out_path: Option<&str>,
) -> Result<()> {
    let timeframe = parse_timeframe(timeframe)?;
    let start_ms = parse_date_start(start)?;
    let end_ms = parse_date_end(end)?;

    let spec: StrategySpec = read_json(strategy_path)
        .with_context(|| format!("reading strategy file {strategy_path}"))?;
    let strategy = Strategy::try_from(spec)?;
    let market_type = strategy.market_type;

    let phases: Option<Vec<Phase>> = match phases_path {
        Some(path) => {
            Some(read_json(path).with_context(|| format!("reading phases file {path}"))?)
        }
        None => None,
    };

    // Warm-up candles are pulled ahead of the requested window so the
    // first tradable bar already has its indicators defined.
    let warmup_ms = warmup as i64 * timeframe.interval_ms();
    let store = Arc::new(SymbolStore::open(Path::new(&settings.data_dir), symbol).await?);
    let fetcher = DataFetcher::new(Arc::clone(&store), settings)?;
    let candles = fetcher
        .ensure_candles(timeframe, market_type, start_ms - warmup_ms, end_ms)
        .await?;

    let config = RunConfig {
        symbol: symbol.to_string(),
        timeframe,
        start_ms: start_ms - warmup_ms,
        end_ms,
        initial_capital: capital,
        warmup_bars: warmup,
        sizing: None,
        position_size: None,
        commission_rate: None,
        market_type: Some(market_type),
        margin_interest_rate: None,
    };

    let engine = BacktestEngine::new(strategy, config)?;
    let result = engine.run(&candles, phases.as_deref())?;
    result.print_summary();

    if let Some(path) = out_path {
        std::fs::write(path, serde_json::to_string_pretty(&result)?)?;
        info!("Result written to {path}");
    }
    Ok(())
}

async fn run_fetch(
    settings: &Settings,
    symbol: &str,
    data_type: &str,
    timeframe: &str,
    market: &str,
    start: &str,
    end: &str,
) -> Result<()> {
    let data_type = DataType::parse(data_type)
        .ok_or_else(|| anyhow!("unknown data type '{data_type}'"))?;
    let start_ms = parse_date_start(start)?;
    let end_ms = parse_date_end(end)?;

    let store = Arc::new(SymbolStore::open(Path::new(&settings.data_dir), symbol).await?);
    let fetcher = DataFetcher::new(Arc::clone(&store), settings)?;

    match data_type {
        DataType::Candles => {
            let timeframe = parse_timeframe(timeframe)?;
            let market_type = MarketType::parse(market)
                .ok_or_else(|| anyhow!("unknown market type '{market}'"))?;
            let candles = fetcher
                .ensure_candles(timeframe, market_type, start_ms, end_ms)
                .await?;
            info!("{} candles covered for {symbol}", candles.len());
        }
        DataType::AggTrades => {
            let trades = fetcher.ensure_agg_trades(start_ms, end_ms).await?;
            info!("{} aggTrades covered for {symbol}", trades.len());
        }
        DataType::FundingRates => {
            let rates = fetcher.ensure_funding(start_ms, end_ms).await?;
            info!("{} funding rates covered for {symbol}", rates.len());
        }
        DataType::OpenInterest => {
            let samples = fetcher.ensure_open_interest(start_ms, end_ms).await?;
            info!("{} open-interest samples covered for {symbol}", samples.len());
        }
        DataType::PremiumIndex => {
            return Err(anyhow!("premium index has no fetch path; ingest it via the store API"));
        }
    }
    Ok(())
}

async fn show_coverage(
    settings: &Settings,
    symbol: &str,
    data_type: Option<&str>,
) -> Result<()> {
    let data_type = match data_type {
        Some(s) => Some(DataType::parse(s).ok_or_else(|| anyhow!("unknown data type '{s}'"))?),
        None => None,
    };
    let store = SymbolStore::open(Path::new(&settings.data_dir), symbol).await?;
    let ranges = store.coverage_ranges(data_type).await?;

    if ranges.is_empty() {
        println!("No coverage recorded for {symbol}");
        return Ok(());
    }
    println!(
        "{:<16} {:<12} {:<26} {:<26} {}",
        "data_type", "sub_key", "from", "to", "complete"
    );
    for range in ranges {
        println!(
            "{:<16} {:<12} {:<26} {:<26} {}",
            range.data_type,
            range.sub_key,
            format_ms(range.range_start),
            format_ms(range.range_end),
            range.is_complete
        );
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn parse_timeframe(s: &str) -> Result<Timeframe> {
    Timeframe::parse(s).ok_or_else(|| anyhow!("unknown timeframe '{s}'"))
}

fn parse_date_start(s: &str) -> Result<i64> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow!("bad date '{s}': {e}"))?;
    Ok(date
        .and_time(NaiveTime::MIN)
        .and_utc()
        .timestamp_millis())
}

fn parse_date_end(s: &str) -> Result<i64> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow!("bad date '{s}': {e}"))?;
    let next = date
        .succ_opt()
        .ok_or_else(|| anyhow!("date '{s}' out of range"))?;
    Ok(next.and_time(NaiveTime::MIN).and_utc().timestamp_millis() - 1)
}

fn format_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}
