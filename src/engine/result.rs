use serde::{Deserialize, Serialize};

use crate::engine::metrics::Metrics;
use crate::types::Trade;

/// One point of the per-bar equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub bar: usize,
    pub equity: f64,
}

/// Everything a finished run produces. Serializing and deserializing a
/// result is lossless, including float-exact trade fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub run_id: String,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: Metrics,
    pub bars_processed: u64,
    pub duration_ms: u64,
}

impl BacktestResult {
    /// Console summary in the house style.
    pub fn print_summary(&self) {
        let m = &self.metrics;
        println!("\n{}", "=".repeat(60));
        println!("                    BACKTEST RESULTS");
        println!("{}", "=".repeat(60));
        println!("Run:                {}", self.run_id);
        println!("Bars Processed:     {}", self.bars_processed);
        println!("Duration:           {} ms", self.duration_ms);
        println!("{}", "-".repeat(60));
        println!("PERFORMANCE");
        println!("  Final Equity:       ${:.2}", m.final_equity);
        println!("  Total Return:       {:.2}%", m.total_return_pct);
        println!("  Max Drawdown:       {:.2}%", m.max_drawdown_pct);
        println!("  Sharpe Ratio:       {:.2}", m.sharpe_ratio);
        println!("{}", "-".repeat(60));
        println!("TRADES");
        println!("  Total Trades:       {}", m.total_trades);
        println!("  Winning Trades:     {} ({:.1}%)", m.winning_trades, m.win_rate_pct);
        println!("  Losing Trades:      {}", m.losing_trades);
        println!("  Profit Factor:      {:.2}", m.profit_factor);
        println!("  Average Win:        ${:.2}", m.average_win);
        println!("  Average Loss:       ${:.2}", m.average_loss);
        println!("  Largest Win:        ${:.2}", m.largest_win);
        println!("  Largest Loss:       ${:.2}", m.largest_loss);
        println!("  Total Commission:   ${:.2}", m.total_commission);
        println!("{}", "=".repeat(60));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, TradeSide};

    #[test]
    fn result_serde_round_trip_is_lossless() {
        let result = BacktestResult {
            run_id: "run-1".to_string(),
            trades: vec![Trade {
                id: "t-1".to_string(),
                group_id: "dca-abc".to_string(),
                side: TradeSide::Long,
                entry_bar: 101,
                entry_time: 1_700_000_000_000,
                entry_price: 100.000000000001,
                quantity: 0.333333333333333,
                exit_bar: Some(150),
                exit_time: Some(1_700_000_060_000),
                exit_price: Some(104.99999999999),
                exit_reason: ExitReason::TakeProfit,
                exit_zone: Some("profit".to_string()),
                pnl: Some(1.6666616666),
                pnl_pct: Some(4.99999999999),
                commission_paid: 0.0666,
            }],
            equity_curve: vec![EquityPoint {
                bar: 0,
                equity: 10_000.0,
            }],
            metrics: crate::engine::metrics::compute(
                &[],
                &[],
                10_000.0,
                crate::types::Timeframe::H1,
            ),
            bars_processed: 200,
            duration_ms: 12,
        };

        let json = serde_json::to_string(&result).unwrap();
        let back: BacktestResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);

        // Exit reasons use the stable wire strings.
        assert!(json.contains("\"take_profit\""));
    }
}
