//! Deterministic bar-by-bar replay. Given the same strategy, config,
//! candles and phases, every invocation yields bit-identical trades,
//! equity curve and metrics: the loop has no suspension points, group and
//! trade IDs derive from the run key, and every fill is emitted in
//! strictly increasing `(bar, within-bar priority)` order.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::metrics::{self, Metrics};
use crate::engine::result::{BacktestResult, EquityPoint};
use crate::engine::zones::{evaluate_zones, global_exit, ZoneAction};
use crate::error::{QuantError, Result};
use crate::eval::{prepare, ConditionEvaluator};
use crate::indicators::atr;
use crate::types::{
    Candle, DcaMode, ExitReason, MarketType, Position, PositionSizing, Strategy, Timeframe,
    Trade, TradeSide,
};

const MS_PER_YEAR: f64 = 365.0 * 24.0 * 3_600_000.0;
const QTY_EPSILON: f64 = 1e-12;

/// Per-run configuration. Sizing, commission and market parameters
/// default to the strategy's own values; a run may override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_ms: i64,
    pub end_ms: i64,
    pub initial_capital: f64,
    #[serde(default)]
    pub warmup_bars: usize,
    #[serde(default)]
    pub sizing: Option<PositionSizing>,
    #[serde(default)]
    pub position_size: Option<f64>,
    #[serde(default)]
    pub commission_rate: Option<f64>,
    #[serde(default)]
    pub market_type: Option<MarketType>,
    #[serde(default)]
    pub margin_interest_rate: Option<f64>,
}

impl RunConfig {
    fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(QuantError::Config("symbol must not be empty".to_string()));
        }
        if self.start_ms >= self.end_ms {
            return Err(QuantError::Config(format!(
                "start_ms {} must be before end_ms {}",
                self.start_ms, self.end_ms
            )));
        }
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(QuantError::Config(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if let Some(size) = self.position_size {
            if !(size.is_finite() && size > 0.0) {
                return Err(QuantError::Config(format!(
                    "position_size override must be positive, got {size}"
                )));
            }
        }
        if let Some(rate) = self.commission_rate {
            if !(0.0..1.0).contains(&rate) {
                return Err(QuantError::Config(format!(
                    "commission_rate override must be a fraction in [0, 1), got {rate}"
                )));
            }
        }
        Ok(())
    }
}

/// Named backtest phase: while phases are supplied, entries are admitted
/// only inside one of the windows. Exits always run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub start_ms: Option<i64>,
    #[serde(default)]
    pub end_ms: Option<i64>,
}

impl Phase {
    pub fn contains(&self, time_ms: i64) -> bool {
        self.start_ms.map_or(true, |s| time_ms >= s)
            && self.end_ms.map_or(true, |e| time_ms <= e)
    }
}

/// Effective run parameters after applying config overrides.
#[derive(Debug, Clone, Copy)]
struct Effective {
    sizing: PositionSizing,
    position_size: f64,
    commission_rate: f64,
    margin_interest_rate: Option<f64>,
}

#[derive(Debug, Clone)]
enum EntryTarget {
    NewGroup,
    DcaLeg { group_id: String, replace: bool },
}

pub struct BacktestEngine {
    strategy: Strategy,
    config: RunConfig,
}

impl BacktestEngine {
    pub fn new(strategy: Strategy, config: RunConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { strategy, config })
    }

    /// Parse the strategy's entry/exit conditions against `candles` and
    /// replay. Condition parse errors surface here, before the loop.
    pub fn run(&self, candles: &[Candle], phases: Option<&[Phase]>) -> Result<BacktestResult> {
        let sliced = self.slice(candles)?;
        let entry = prepare(&self.strategy.entry_condition, &sliced)?;
        let exit = prepare(&self.strategy.exit_condition, &sliced)?;
        self.replay(&sliced, phases, &entry, &exit)
    }

    /// Replay with caller-supplied evaluators; the engine treats them as
    /// opaque boolean oracles and maps per-bar errors to `false`.
    pub fn run_with_evaluators(
        &self,
        candles: &[Candle],
        phases: Option<&[Phase]>,
        entry: &dyn ConditionEvaluator,
        exit: &dyn ConditionEvaluator,
    ) -> Result<BacktestResult> {
        let sliced = self.slice(candles)?;
        self.replay(&sliced, phases, entry, exit)
    }

    fn slice(&self, candles: &[Candle]) -> Result<Vec<Candle>> {
        let sliced: Vec<Candle> = candles
            .iter()
            .filter(|c| c.open_time >= self.config.start_ms && c.open_time <= self.config.end_ms)
            .cloned()
            .collect();
        if sliced.is_empty() {
            return Err(QuantError::DataAvailability(format!(
                "no candles for {} {} in [{}, {}]",
                self.config.symbol,
                self.config.timeframe,
                self.config.start_ms,
                self.config.end_ms
            )));
        }
        Ok(sliced)
    }

    fn replay(
        &self,
        candles: &[Candle],
        phases: Option<&[Phase]>,
        entry: &dyn ConditionEvaluator,
        exit: &dyn ConditionEvaluator,
    ) -> Result<BacktestResult> {
        let started = Instant::now();
        let strategy = &self.strategy;
        let config = &self.config;

        if config.warmup_bars >= candles.len() {
            return Err(QuantError::DataAvailability(format!(
                "{} candles do not cover the {}-bar warm-up",
                candles.len(),
                config.warmup_bars
            )));
        }

        warn_on_gaps(candles, config.timeframe);

        let eff = Effective {
            sizing: config.sizing.unwrap_or(strategy.sizing),
            position_size: config.position_size.unwrap_or(strategy.position_size),
            commission_rate: config.commission_rate.unwrap_or(strategy.commission_rate),
            margin_interest_rate: config
                .margin_interest_rate
                .or(strategy.margin_interest_rate),
        };

        // Stable run identity: the same inputs always produce the same
        // trade and group IDs.
        let run_key = format!(
            "{}|{}|{}|{}|{}",
            strategy.name, config.symbol, config.timeframe, config.start_ms, config.end_ms
        );
        let run_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, run_key.as_bytes());

        let mut run = Run {
            candles,
            strategy,
            eff,
            interval_ms: config.timeframe.interval_ms(),
            cash: config.initial_capital,
            accrued_interest: 0.0,
            trades: Vec::new(),
            positions: Vec::new(),
            equity_curve: Vec::new(),
            pending: None,
            last_fill_bar: None,
            trade_seq: 0,
            group_seq: 0,
            run_id,
            atr: atr(candles, strategy.atr_period),
        };

        info!(
            "Starting backtest '{}' on {} {} ({} bars, {} warm-up)",
            strategy.name,
            config.symbol,
            config.timeframe,
            candles.len(),
            config.warmup_bars
        );

        let last_bar = candles.len() - 1;
        for i in config.warmup_bars..candles.len() {
            // 1. Fill the entry scheduled on the previous bar at this open.
            if let Some(target) = run.pending.take() {
                run.fill_entry(target, i, candles[i].open);
            }

            // 2. Exits for every open position, oldest first.
            let closed_all_this_bar = run.process_exits(i, exit);

            // 3. Entry gating. A bar that flattened a position does not
            //    also admit a new one, and the final bar has no next open
            //    to fill at.
            if !closed_all_this_bar
                && run.pending.is_none()
                && i < last_bar
                && phase_allows(phases, candles[i].open_time)
            {
                run.schedule_entry(i, entry);
            }

            // 4. Margin interest and the equity sample for this bar.
            run.accrue_interest();
            let equity = run.equity_at(candles[i].close);
            run.equity_curve.push(EquityPoint { bar: i, equity });
        }

        // End of data: everything still open goes out at the final close.
        run.close_everything(last_bar);
        let final_equity = run.equity_at(candles[last_bar].close);
        if let Some(point) = run.equity_curve.last_mut() {
            point.equity = final_equity;
        }

        let bars_processed = (candles.len() - config.warmup_bars) as u64;
        let metrics: Metrics = metrics::compute(
            &run.trades,
            &run.equity_curve,
            config.initial_capital,
            config.timeframe,
        );

        info!(
            "Backtest complete: {} trades, {:.2}% return",
            metrics.total_trades, metrics.total_return_pct
        );

        Ok(BacktestResult {
            run_id: run_id.to_string(),
            trades: run.trades,
            equity_curve: run.equity_curve,
            metrics,
            bars_processed,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn phase_allows(phases: Option<&[Phase]>, time_ms: i64) -> bool {
    match phases {
        None => true,
        Some(phases) if phases.is_empty() => true,
        Some(phases) => phases.iter().any(|p| p.contains(time_ms)),
    }
}

/// The engine does not interpolate gaps; it surfaces them.
fn warn_on_gaps(candles: &[Candle], timeframe: Timeframe) {
    let tolerance = (timeframe.interval_ms() as f64 * 1.1) as i64;
    for pair in candles.windows(2) {
        let delta = pair[1].open_time - pair[0].open_time;
        if delta > tolerance {
            warn!(
                "candle gap: {} -> {} ({}ms > {}ms tolerance)",
                pair[0].open_time, pair[1].open_time, delta, tolerance
            );
        }
    }
}

/// Mutable state of one replay; owns cash, open positions and the output.
struct Run<'a> {
    candles: &'a [Candle],
    strategy: &'a Strategy,
    eff: Effective,
    interval_ms: i64,
    cash: f64,
    accrued_interest: f64,
    trades: Vec<Trade>,
    positions: Vec<Position>,
    equity_curve: Vec<EquityPoint>,
    pending: Option<EntryTarget>,
    last_fill_bar: Option<usize>,
    trade_seq: u64,
    group_seq: u64,
    run_id: Uuid,
    atr: Vec<Option<f64>>,
}

impl<'a> Run<'a> {
    fn next_trade_id(&mut self) -> String {
        let id = Uuid::new_v5(&self.run_id, format!("trade-{}", self.trade_seq).as_bytes());
        self.trade_seq += 1;
        id.to_string()
    }

    fn next_group_id(&mut self) -> String {
        let id = Uuid::new_v5(&self.run_id, format!("group-{}", self.group_seq).as_bytes());
        self.group_seq += 1;
        format!("dca-{id}")
    }

    fn equity_at(&self, price: f64) -> f64 {
        let market_value: f64 = self.positions.iter().map(|p| p.market_value(price)).sum();
        self.cash + market_value - self.accrued_interest
    }

    fn accrue_interest(&mut self) {
        let Some(rate) = self.eff.margin_interest_rate else {
            return;
        };
        if rate <= 0.0 || self.positions.is_empty() {
            return;
        }
        let basis: f64 = self.positions.iter().map(|p| p.cost_basis()).sum();
        self.accrued_interest += basis * rate * self.interval_ms as f64 / MS_PER_YEAR;
    }

    /// Run exits for every open position at bar `i`. Returns true when at
    /// least one position went fully flat on this bar.
    fn process_exits(&mut self, i: usize, exit: &dyn ConditionEvaluator) -> bool {
        let candle = &self.candles[i];
        let atr_now = self.atr[i];
        let mut closed_all = false;

        let mut idx = 0;
        while idx < self.positions.len() {
            // A too-fresh position is exempt from every exit path,
            // including zone immediate exits.
            let fresh = i.saturating_sub(self.positions[idx].first_entry_bar)
                < self.strategy.min_bars_before_exit as usize;
            if fresh {
                idx += 1;
                continue;
            }

            let mut position = self.positions.remove(idx);

            if let Some(ZoneAction::CloseAll { price, reason, zone }) =
                global_exit(self.strategy, &mut position, candle, atr_now)
            {
                let qty = position.remaining_qty();
                self.close_quantity(&mut position, qty, price, i, reason, zone);
            } else {
                let actions = evaluate_zones(self.strategy, &mut position, candle, i, atr_now);
                for action in actions {
                    match action {
                        ZoneAction::CloseAll { price, reason, zone } => {
                            let qty = position.remaining_qty();
                            self.close_quantity(&mut position, qty, price, i, reason, zone);
                        }
                        ZoneAction::ClosePartial { qty, price, zone } => {
                            self.close_quantity(
                                &mut position,
                                qty,
                                price,
                                i,
                                ExitReason::ZoneExit,
                                Some(zone),
                            );
                        }
                    }
                }

                // Exit condition closes whatever survived the zones.
                if !position.is_empty() && exit.evaluate(i).unwrap_or(false) {
                    let qty = position.remaining_qty();
                    self.close_quantity(
                        &mut position,
                        qty,
                        candle.close,
                        i,
                        ExitReason::Signal,
                        None,
                    );
                }
            }

            if position.is_empty() {
                closed_all = true;
            } else {
                self.positions.insert(idx, position);
                idx += 1;
            }
        }
        closed_all
    }

    /// Entry gating at signal bar `i`; a successful check schedules a
    /// fill for the next bar's open. DCA averaging takes precedence over
    /// opening another group.
    fn schedule_entry(&mut self, i: usize, entry: &dyn ConditionEvaluator) {
        let fill_bar = i + 1;
        let dca = &self.strategy.dca;

        if dca.enabled {
            let target = self.positions.iter().find(|p| {
                p.side == self.strategy.direction
                    && p.entry_count < dca.max_entries
                    && fill_bar - p.last_entry_bar >= dca.bars_between as usize
            });
            if let Some(position) = target {
                // DCA legs honor the global entry spacing too.
                if let Some(last) = self.last_fill_bar {
                    if fill_bar - last < self.strategy.min_bars_between_trades as usize {
                        return;
                    }
                }
                if entry.evaluate(i).unwrap_or(false) {
                    self.pending = Some(EntryTarget::DcaLeg {
                        group_id: position.group_id.clone(),
                        replace: dca.mode == DcaMode::Replace,
                    });
                }
                return;
            }
        }

        if self.positions.len() >= self.strategy.max_open_trades as usize {
            return;
        }
        if let Some(last) = self.last_fill_bar {
            if fill_bar - last < self.strategy.min_bars_between_trades as usize {
                return;
            }
        }
        // A position inside its minimum holding window blocks new slots.
        let blocked = self.positions.iter().any(|p| {
            i.saturating_sub(p.first_entry_bar) < self.strategy.min_bars_before_exit as usize
        });
        if blocked {
            return;
        }

        if entry.evaluate(i).unwrap_or(false) {
            self.pending = Some(EntryTarget::NewGroup);
        }
    }

    /// Execute a scheduled entry at bar `i` and `price` (that bar's open).
    fn fill_entry(&mut self, target: EntryTarget, i: usize, price: f64) {
        let side = self.strategy.direction;
        let time = self.candles[i].open_time;

        let (group_id, leg_index, replace) = match target {
            EntryTarget::NewGroup => (self.next_group_id(), 0u32, false),
            EntryTarget::DcaLeg { group_id, replace } => {
                let count = self
                    .positions
                    .iter()
                    .find(|p| p.group_id == group_id)
                    .map(|p| p.entry_count)
                    .unwrap_or(0);
                (group_id, count, replace)
            }
        };

        if replace {
            if let Some(idx) = self.positions.iter().position(|p| p.group_id == group_id) {
                let mut position = self.positions.remove(idx);
                let qty = position.remaining_qty();
                self.close_quantity(&mut position, qty, price, i, ExitReason::Signal, None);
                self.positions.insert(idx, position);
            }
        }

        let multiplier = self.strategy.dca.size_multiplier.powi(leg_index as i32);
        let equity_now = self.equity_at(price);
        let (quantity, notional) = match self.eff.sizing {
            PositionSizing::FixedDollar => {
                let notional = self.eff.position_size * multiplier;
                (notional / price, notional)
            }
            PositionSizing::FixedQuantity => {
                let qty = self.eff.position_size * multiplier;
                (qty, qty * price)
            }
            PositionSizing::PercentEquity => {
                let notional = equity_now * self.eff.position_size / 100.0 * multiplier;
                (notional / price, notional)
            }
        };
        let commission = notional * self.eff.commission_rate;

        let affordable = match side {
            TradeSide::Long => notional + commission <= self.cash,
            TradeSide::Short => commission <= self.cash + notional,
        };
        if quantity <= QTY_EPSILON || !quantity.is_finite() || !affordable {
            debug!(
                "bar {i}: entry rejected (qty {quantity:.8}, notional {notional:.2}, cash {:.2})",
                self.cash
            );
            let id = self.next_trade_id();
            self.trades.push(Trade {
                id,
                group_id,
                side,
                entry_bar: i,
                entry_time: time,
                entry_price: price,
                quantity: 0.0,
                exit_bar: Some(i),
                exit_time: Some(time),
                exit_price: None,
                exit_reason: ExitReason::Rejected,
                exit_zone: None,
                pnl: None,
                pnl_pct: None,
                commission_paid: 0.0,
            });
            return;
        }

        match side {
            TradeSide::Long => self.cash -= notional,
            TradeSide::Short => self.cash += notional,
        }
        self.cash -= commission;

        let id = self.next_trade_id();
        let leg = Trade {
            id,
            group_id: group_id.clone(),
            side,
            entry_bar: i,
            entry_time: time,
            entry_price: price,
            quantity,
            exit_bar: None,
            exit_time: None,
            exit_price: None,
            exit_reason: ExitReason::Open,
            exit_zone: None,
            pnl: None,
            pnl_pct: None,
            commission_paid: commission,
        };
        debug!(
            "bar {i}: {} {:.8} @ {:.4} (group {})",
            side, quantity, price, group_id
        );

        if let Some(position) = self.positions.iter_mut().find(|p| p.group_id == group_id) {
            position.add_leg(leg);
        } else {
            self.positions.push(Position::new(leg, self.atr[i]));
        }
        self.last_fill_bar = Some(i);
    }

    /// Close `qty` out of `position` at `price`, FIFO across legs,
    /// emitting one trade record per consumed leg slice. Commission is
    /// charged on the exited notional; each record's `pnl` is net of the
    /// commissions attributed to it.
    fn close_quantity(
        &mut self,
        position: &mut Position,
        qty: f64,
        price: f64,
        bar: usize,
        reason: ExitReason,
        zone: Option<String>,
    ) {
        let qty = qty.min(position.remaining_qty());
        if qty <= QTY_EPSILON {
            return;
        }
        let time = self.candles[bar].open_time;
        let sign = position.side.sign();

        for (leg, entry_commission) in position.reduce(qty) {
            let exit_notional = leg.quantity * price;
            let exit_commission = exit_notional * self.eff.commission_rate;
            match position.side {
                TradeSide::Long => self.cash += exit_notional,
                TradeSide::Short => self.cash -= exit_notional,
            }
            self.cash -= exit_commission;

            let gross = sign * (price - leg.entry_price) * leg.quantity;
            let pnl = gross - entry_commission - exit_commission;
            let pnl_pct = if leg.entry_price != 0.0 {
                sign * (price - leg.entry_price) / leg.entry_price * 100.0
            } else {
                0.0
            };

            debug!(
                "bar {bar}: close {:.8} of {} @ {:.4} ({reason}, pnl {pnl:.4})",
                leg.quantity, leg.group_id, price
            );

            self.trades.push(Trade {
                exit_bar: Some(bar),
                exit_time: Some(time),
                exit_price: Some(price),
                exit_reason: reason,
                exit_zone: zone.clone(),
                pnl: Some(pnl),
                pnl_pct: Some(pnl_pct),
                commission_paid: entry_commission + exit_commission,
                ..leg
            });
        }

        if position.is_empty() {
            position.zone_state.leave_zones();
        }
    }

    /// Forced close of every open position at the final bar's close.
    fn close_everything(&mut self, last_bar: usize) {
        let price = self.candles[last_bar].close;
        let mut positions = std::mem::take(&mut self.positions);
        for position in positions.iter_mut() {
            let qty = position.remaining_qty();
            self.close_quantity(position, qty, price, last_bar, ExitReason::EndOfData, None);
        }
    }
}
