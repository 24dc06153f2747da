//! Post-run aggregation over the closed-trade list and the equity curve.
//! All math is f64; reported percentages are rounded to two decimals here,
//! at the API boundary. Edge cases never panic: no trades or a flat
//! equity curve produce zeroed metrics.

use serde::{Deserialize, Serialize};

use crate::engine::result::EquityPoint;
use crate::types::{ExitReason, Timeframe, Trade};

/// Sentinel reported when there are winning trades and no losing ones;
/// the true profit factor is unbounded but must survive JSON.
pub const PROFIT_FACTOR_CAP: f64 = 9999.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub final_equity: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub total_commission: f64,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Aggregate a finished run. Rejected fills stay in the trade list for
/// the caller but do not count toward performance statistics.
pub fn compute(
    trades: &[Trade],
    equity_curve: &[EquityPoint],
    initial_capital: f64,
    timeframe: Timeframe,
) -> Metrics {
    let executed: Vec<&Trade> = trades
        .iter()
        .filter(|t| t.exit_reason != ExitReason::Rejected && t.exit_reason != ExitReason::Open)
        .collect();

    let mut winning = 0u64;
    let mut losing = 0u64;
    let mut gross_profit = 0.0;
    let mut gross_loss = 0.0;
    let mut largest_win = 0.0f64;
    let mut largest_loss = 0.0f64;
    for trade in &executed {
        let pnl = trade.pnl.unwrap_or(0.0);
        if pnl > 0.0 {
            winning += 1;
            gross_profit += pnl;
            largest_win = largest_win.max(pnl);
        } else if pnl < 0.0 {
            losing += 1;
            gross_loss += pnl.abs();
            largest_loss = largest_loss.max(pnl.abs());
        }
    }

    let decided = winning + losing;
    let win_rate_pct = if decided > 0 {
        winning as f64 / decided as f64 * 100.0
    } else {
        0.0
    };

    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        PROFIT_FACTOR_CAP
    } else {
        0.0
    };

    let final_equity = equity_curve
        .last()
        .map(|p| p.equity)
        .unwrap_or(initial_capital);
    let total_return_pct = if initial_capital != 0.0 {
        (final_equity - initial_capital) / initial_capital * 100.0
    } else {
        0.0
    };

    let total_commission = trades.iter().map(|t| t.commission_paid).sum();

    Metrics {
        total_trades: executed.len() as u64,
        winning_trades: winning,
        losing_trades: losing,
        win_rate_pct: round2(win_rate_pct),
        profit_factor,
        total_return_pct: round2(total_return_pct),
        max_drawdown_pct: round2(max_drawdown_pct(equity_curve)),
        sharpe_ratio: sharpe_ratio(equity_curve, timeframe),
        final_equity,
        average_win: if winning > 0 {
            gross_profit / winning as f64
        } else {
            0.0
        },
        average_loss: if losing > 0 {
            gross_loss / losing as f64
        } else {
            0.0
        },
        largest_win,
        largest_loss,
        gross_profit,
        gross_loss,
        total_commission,
    }
}

/// Peak-to-trough scan, left to right.
fn max_drawdown_pct(equity_curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0f64;
    for point in equity_curve {
        peak = peak.max(point.equity);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - point.equity) / peak * 100.0);
        }
    }
    max_dd
}

/// Annualized Sharpe over per-bar equity returns, risk-free rate zero.
/// Sample standard deviation; zero variance yields zero.
fn sharpe_ratio(equity_curve: &[EquityPoint], timeframe: Timeframe) -> f64 {
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter(|w| w[0].equity > 0.0)
        .map(|w| (w[1].equity - w[0].equity) / w[0].equity)
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    mean / std_dev * timeframe.bars_per_year().sqrt()
}
