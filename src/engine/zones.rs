//! Exit-zone state machine. Each open position tracks which P&L zone it
//! currently sits in, which zones have already fired their partial exit,
//! and the trailing anchor for zone-level trailing stops. Evaluation is
//! pure over `(strategy, position, candle)` and returns the fills the
//! engine should apply, in order.

use tracing::debug;

use crate::types::{
    Candle, ExitBasis, ExitReason, ExitZone, Position, StopConfig, Strategy, TradeSide,
    ZoneEvaluation,
};

const QTY_EPSILON: f64 = 1e-12;

/// One exit decision produced by the zone machine for the current bar.
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneAction {
    CloseAll {
        price: f64,
        reason: ExitReason,
        zone: Option<String>,
    },
    ClosePartial {
        qty: f64,
        price: f64,
        zone: String,
    },
}

/// Price at which a position's unrealized P&L equals `pnl_pct`.
fn price_at_pnl(avg_entry: f64, side: TradeSide, pnl_pct: f64) -> f64 {
    avg_entry * (1.0 + side.sign() * pnl_pct / 100.0)
}

/// Evaluation prices for the bar. `candle_close` looks at the close only;
/// `intrabar` sweeps the adverse extreme first, then the favorable one,
/// so loss-side zones act before profit-side zones when both are touched.
fn evaluation_prices(candle: &Candle, side: TradeSide, mode: ZoneEvaluation) -> Vec<f64> {
    match mode {
        ZoneEvaluation::CandleClose => vec![candle.close],
        ZoneEvaluation::Intrabar => match side {
            TradeSide::Long => vec![candle.low, candle.high],
            TradeSide::Short => vec![candle.high, candle.low],
        },
    }
}

/// Run the zone machine for one bar. Mutates the position's zone state
/// (current zone, triggered set, trailing anchor) and returns the fills
/// to apply. `atr` is the current-bar ATR for ATR-distance stops.
pub fn evaluate_zones(
    strategy: &Strategy,
    position: &mut Position,
    candle: &Candle,
    bar: usize,
    atr: Option<f64>,
) -> Vec<ZoneAction> {
    if strategy.exit_zones.is_empty() || position.is_empty() {
        return Vec::new();
    }

    let side = position.side;
    let avg_entry = position.avg_entry_price();
    let mut actions = Vec::new();
    let mut sim_remaining = position.remaining_qty();

    let prices = evaluation_prices(candle, side, strategy.zone_evaluation);
    let favorable_pass_start = prices.len() - 1;

    for (pass, &eval_price) in prices.iter().enumerate() {
        if sim_remaining <= QTY_EPSILON {
            break;
        }
        let pnl_pct = side.sign() * (eval_price - avg_entry) / avg_entry * 100.0;
        position.zone_state.last_pnl_pct = Some(pnl_pct);

        let Some(zone) = strategy.zone_for(pnl_pct) else {
            position.zone_state.leave_zones();
            continue;
        };
        let zone = zone.clone();

        if position.zone_state.current_zone.as_deref() != Some(zone.name.as_str()) {
            debug!(
                "bar {bar}: position {} moves into zone '{}' at {:.2}%",
                position.group_id, zone.name, pnl_pct
            );
            position.zone_state.enter_zone(&zone, bar);
        }

        let bars_in_zone = bar.saturating_sub(position.zone_state.zone_entry_bar.unwrap_or(bar));
        let gated = bars_in_zone < zone.min_bars_in_zone as usize;

        // (a) Zone-level fixed stop / take-profit, stop first.
        if !gated {
            if let Some(action) = fixed_level_exit(
                &zone.stop_loss,
                avg_entry,
                side,
                candle,
                position.atr_at_entry.or(atr),
                true,
                Some(zone.name.clone()),
            ) {
                actions.push(action);
                return actions;
            }
            if let Some(action) = fixed_level_exit(
                &zone.take_profit,
                avg_entry,
                side,
                candle,
                position.atr_at_entry.or(atr),
                false,
                Some(zone.name.clone()),
            ) {
                actions.push(action);
                return actions;
            }
        }

        // (b) Zone-level trailing stop. The anchor ratchets toward the
        // favorable extreme and survives the min-bars gate; it resets
        // only per the zone's reentry policy. The trigger is computed
        // from the anchor as it stood before this bar, so the bar that
        // makes a new extreme cannot fire its own trail.
        if zone.stop_loss.is_trailing() || zone.take_profit.is_trailing() {
            let favorable = match side {
                TradeSide::Long => candle.high,
                TradeSide::Short => candle.low,
            };
            let prev_anchor = position.zone_state.trailing_anchor;
            position.zone_state.trailing_anchor = Some(match prev_anchor {
                Some(current) => match side {
                    TradeSide::Long => current.max(favorable),
                    TradeSide::Short => current.min(favorable),
                },
                None => favorable,
            });

            for (config, reason) in [
                (&zone.stop_loss, ExitReason::TrailingStop),
                (&zone.take_profit, ExitReason::TakeProfit),
            ] {
                if !config.is_trailing() {
                    continue;
                }
                let Some(anchor) = prev_anchor else { continue };
                let Some(trigger) = trailing_trigger(config, anchor, side, atr) else {
                    continue;
                };
                let crossed = match side {
                    TradeSide::Long => candle.low <= trigger,
                    TradeSide::Short => candle.high >= trigger,
                };
                if crossed {
                    let price = if candle.contains_price(trigger) {
                        trigger
                    } else {
                        candle.open
                    };
                    actions.push(ZoneAction::CloseAll {
                        price,
                        reason,
                        zone: Some(zone.name.clone()),
                    });
                    return actions;
                }
            }
        }

        // (c) Partial or immediate zone exit, at most once per zone visit.
        if !gated && !position.zone_state.triggered_exits.contains(&zone.name) {
            let fill_price = partial_fill_price(
                &zone,
                avg_entry,
                side,
                candle,
                eval_price,
                strategy.zone_evaluation,
                pass == favorable_pass_start,
            );
            if zone.exit_immediately {
                position
                    .zone_state
                    .triggered_exits
                    .insert(zone.name.clone());
                actions.push(ZoneAction::CloseAll {
                    price: fill_price,
                    reason: ExitReason::ZoneExit,
                    zone: Some(zone.name.clone()),
                });
                return actions;
            }
            if let Some(exit_pct) = zone.exit_pct {
                let basis = match zone.exit_basis {
                    ExitBasis::Original => position.original_qty,
                    ExitBasis::Remaining => sim_remaining,
                };
                let qty = (basis * exit_pct / 100.0).min(sim_remaining);
                if qty > QTY_EPSILON {
                    position
                        .zone_state
                        .triggered_exits
                        .insert(zone.name.clone());
                    sim_remaining -= qty;
                    actions.push(ZoneAction::ClosePartial {
                        qty,
                        price: fill_price,
                        zone: zone.name.clone(),
                    });
                }
            }
        }
    }

    actions
}

/// Strategy-level stop/TP, evaluated before any zone logic. A trigger
/// closes the whole position; when the bar satisfies both, the stop wins.
pub fn global_exit(
    strategy: &Strategy,
    position: &mut Position,
    candle: &Candle,
    atr: Option<f64>,
) -> Option<ZoneAction> {
    let side = position.side;
    let avg_entry = position.avg_entry_price();

    // The trail is anchored to the peak as it stood before this bar; the
    // bar that makes a new favorable extreme cannot fire its own trail.
    let prev_peak = position.peak_price;
    let favorable = match side {
        TradeSide::Long => candle.high,
        TradeSide::Short => candle.low,
    };
    position.peak_price = match side {
        TradeSide::Long => prev_peak.max(favorable),
        TradeSide::Short => prev_peak.min(favorable),
    };

    // Fixed stop ahead of trailing stop ahead of take-profit.
    if let Some(action) = fixed_level_exit(
        &strategy.stop_loss,
        avg_entry,
        side,
        candle,
        position.atr_at_entry.or(atr),
        true,
        None,
    ) {
        return Some(action);
    }

    for (config, reason) in [
        (&strategy.stop_loss, ExitReason::TrailingStop),
        (&strategy.take_profit, ExitReason::TakeProfit),
    ] {
        if !config.is_trailing() {
            continue;
        }
        if let Some(candidate) = trailing_trigger(config, prev_peak, side, atr) {
            // The stop only ratchets toward the price, never away.
            let trigger = match (position.global_trail_stop, side) {
                (Some(current), TradeSide::Long) => current.max(candidate),
                (Some(current), TradeSide::Short) => current.min(candidate),
                (None, _) => candidate,
            };
            position.global_trail_stop = Some(trigger);
            let crossed = match side {
                TradeSide::Long => candle.low <= trigger,
                TradeSide::Short => candle.high >= trigger,
            };
            if crossed {
                let price = if candle.contains_price(trigger) {
                    trigger
                } else {
                    candle.open
                };
                return Some(ZoneAction::CloseAll {
                    price,
                    reason,
                    zone: None,
                });
            }
        }
    }

    fixed_level_exit(
        &strategy.take_profit,
        avg_entry,
        side,
        candle,
        position.atr_at_entry.or(atr),
        false,
        None,
    )
}

/// Check a fixed (non-trailing) stop or take-profit level. `is_stop`
/// selects which side of the entry the trigger sits on and the crossing
/// direction. Fill at the trigger, or at the open when the bar gapped
/// through the level.
fn fixed_level_exit(
    config: &StopConfig,
    avg_entry: f64,
    side: TradeSide,
    candle: &Candle,
    atr: Option<f64>,
    is_stop: bool,
    zone: Option<String>,
) -> Option<ZoneAction> {
    let distance = match config {
        StopConfig::FixedPercent(pct) => avg_entry * pct / 100.0,
        StopConfig::FixedAtr(mult) => mult * atr?,
        _ => return None,
    };

    // A long stop sits below the entry, a long take-profit above;
    // mirrored for shorts.
    let below = (side == TradeSide::Long) == is_stop;
    let trigger = if below {
        avg_entry - distance
    } else {
        avg_entry + distance
    };
    let crossed = if below {
        candle.low <= trigger
    } else {
        candle.high >= trigger
    };
    if !crossed {
        return None;
    }

    let price = if candle.contains_price(trigger) {
        trigger
    } else {
        candle.open
    };
    Some(ZoneAction::CloseAll {
        price,
        reason: if is_stop {
            ExitReason::StopLoss
        } else {
            ExitReason::TakeProfit
        },
        zone,
    })
}

fn trailing_trigger(
    config: &StopConfig,
    anchor: f64,
    side: TradeSide,
    atr: Option<f64>,
) -> Option<f64> {
    let distance = match config {
        StopConfig::TrailingPercent(pct) => anchor * pct / 100.0,
        StopConfig::TrailingAtr(mult) => mult * atr?,
        _ => return None,
    };
    Some(match side {
        TradeSide::Long => anchor - distance,
        TradeSide::Short => anchor + distance,
    })
}

/// Fill price for a partial/immediate zone exit. In intrabar mode the
/// exit fills at the zone boundary the price path crossed to enter the
/// zone, when that boundary lies inside the bar; otherwise (and always at
/// candle close) it fills at the evaluation price.
fn partial_fill_price(
    zone: &ExitZone,
    avg_entry: f64,
    side: TradeSide,
    candle: &Candle,
    eval_price: f64,
    mode: ZoneEvaluation,
    favorable_pass: bool,
) -> f64 {
    if mode == ZoneEvaluation::CandleClose {
        return eval_price;
    }
    let boundary_pnl = if favorable_pass {
        zone.min_pnl_pct
    } else {
        zone.max_pnl_pct
    };
    match boundary_pnl {
        Some(pnl) => {
            let boundary = price_at_pnl(avg_entry, side, pnl);
            if candle.contains_price(boundary) {
                boundary
            } else {
                eval_price
            }
        }
        None => eval_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        DcaConfig, MarketType, PositionSizing, ReentryPolicy, Trade, ZoneState,
    };

    fn strategy_with_zones(zones: Vec<ExitZone>, mode: ZoneEvaluation) -> Strategy {
        Strategy {
            name: "zones".to_string(),
            entry_condition: "true".to_string(),
            exit_condition: "false".to_string(),
            direction: TradeSide::Long,
            max_open_trades: 1,
            min_bars_between_trades: 0,
            min_bars_before_exit: 0,
            sizing: PositionSizing::FixedQuantity,
            position_size: 1.0,
            commission_rate: 0.0,
            market_type: MarketType::Spot,
            margin_interest_rate: None,
            stop_loss: StopConfig::None,
            take_profit: StopConfig::None,
            dca: DcaConfig::default(),
            exit_zones: zones,
            zone_evaluation: mode,
            atr_period: 14,
        }
    }

    fn zone(name: &str, min: Option<f64>, max: Option<f64>) -> ExitZone {
        ExitZone {
            name: name.to_string(),
            min_pnl_pct: min,
            max_pnl_pct: max,
            stop_loss: StopConfig::None,
            take_profit: StopConfig::None,
            exit_immediately: false,
            exit_pct: None,
            exit_basis: ExitBasis::Remaining,
            reentry: ReentryPolicy::Continue,
            min_bars_in_zone: 0,
        }
    }

    fn long_position(qty: f64, entry: f64) -> Position {
        Position::new(
            Trade {
                id: "t0".to_string(),
                group_id: "dca-test".to_string(),
                side: TradeSide::Long,
                entry_bar: 0,
                entry_time: 0,
                entry_price: entry,
                quantity: qty,
                exit_bar: None,
                exit_time: None,
                exit_price: None,
                exit_reason: ExitReason::Open,
                exit_zone: None,
                pnl: None,
                pnl_pct: None,
                commission_paid: 0.0,
            },
            None,
        )
    }

    fn bar_at(price: f64) -> Candle {
        Candle::new(0, price, price, price, price, 1.0)
    }

    #[test]
    fn partial_exit_basis_original_vs_remaining() {
        let mut profit = zone("quarter", Some(5.0), None);
        profit.exit_pct = Some(25.0);
        profit.exit_basis = ExitBasis::Original;
        let strategy =
            strategy_with_zones(vec![zone("default", None, Some(5.0)), profit], ZoneEvaluation::CandleClose);

        let mut pos = long_position(4.0, 100.0);
        let actions = evaluate_zones(&strategy, &mut pos, &bar_at(106.0), 10, None);
        assert_eq!(
            actions,
            vec![ZoneAction::ClosePartial {
                qty: 1.0,
                price: 106.0,
                zone: "quarter".to_string()
            }]
        );

        // Remaining basis on a half-consumed position.
        let mut profit = zone("half", Some(5.0), None);
        profit.exit_pct = Some(50.0);
        profit.exit_basis = ExitBasis::Remaining;
        let strategy = strategy_with_zones(vec![profit], ZoneEvaluation::CandleClose);
        let mut pos = long_position(4.0, 100.0);
        pos.reduce(2.0);
        let actions = evaluate_zones(&strategy, &mut pos, &bar_at(106.0), 10, None);
        assert_eq!(
            actions,
            vec![ZoneAction::ClosePartial {
                qty: 1.0,
                price: 106.0,
                zone: "half".to_string()
            }]
        );
    }

    #[test]
    fn continue_zone_fires_partial_once() {
        let mut profit = zone("p", Some(5.0), None);
        profit.exit_pct = Some(25.0);
        let strategy = strategy_with_zones(vec![profit], ZoneEvaluation::CandleClose);

        let mut pos = long_position(4.0, 100.0);
        let first = evaluate_zones(&strategy, &mut pos, &bar_at(106.0), 10, None);
        assert_eq!(first.len(), 1);
        // Stay in the zone: no second partial.
        let second = evaluate_zones(&strategy, &mut pos, &bar_at(107.0), 11, None);
        assert!(second.is_empty());
        assert!(pos.zone_state.triggered_exits.contains("p"));
    }

    #[test]
    fn reset_reentry_rearms_partial() {
        let default = zone("default", None, Some(3.0));
        let mut profit = zone("p", Some(3.0), None);
        profit.exit_pct = Some(50.0);
        profit.reentry = ReentryPolicy::Reset;
        let strategy = strategy_with_zones(vec![default, profit], ZoneEvaluation::CandleClose);

        let mut pos = long_position(4.0, 100.0);
        assert_eq!(
            evaluate_zones(&strategy, &mut pos, &bar_at(105.0), 10, None).len(),
            1
        );
        // Dip back below 3%: the reset policy clears the trigger on
        // re-entering the zone.
        assert!(evaluate_zones(&strategy, &mut pos, &bar_at(101.0), 11, None).is_empty());
        let refire = evaluate_zones(&strategy, &mut pos, &bar_at(105.0), 12, None);
        assert_eq!(refire.len(), 1);
    }

    #[test]
    fn continue_reentry_does_not_rearm() {
        let default = zone("default", None, Some(3.0));
        let mut profit = zone("p", Some(3.0), None);
        profit.exit_pct = Some(50.0);
        let strategy = strategy_with_zones(vec![default, profit], ZoneEvaluation::CandleClose);

        let mut pos = long_position(4.0, 100.0);
        assert_eq!(
            evaluate_zones(&strategy, &mut pos, &bar_at(105.0), 10, None).len(),
            1
        );
        assert!(evaluate_zones(&strategy, &mut pos, &bar_at(101.0), 11, None).is_empty());
        assert!(evaluate_zones(&strategy, &mut pos, &bar_at(105.0), 12, None).is_empty());
    }

    #[test]
    fn min_bars_gate_delays_partial_exit() {
        let mut profit = zone("p", Some(5.0), None);
        profit.exit_pct = Some(25.0);
        profit.min_bars_in_zone = 2;
        let strategy = strategy_with_zones(vec![profit], ZoneEvaluation::CandleClose);

        let mut pos = long_position(4.0, 100.0);
        assert!(evaluate_zones(&strategy, &mut pos, &bar_at(106.0), 10, None).is_empty());
        assert!(evaluate_zones(&strategy, &mut pos, &bar_at(106.0), 11, None).is_empty());
        let fired = evaluate_zones(&strategy, &mut pos, &bar_at(106.0), 12, None);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn exit_immediately_closes_everything() {
        let mut danger = zone("danger", None, Some(-8.0));
        danger.exit_immediately = true;
        let strategy = strategy_with_zones(
            vec![danger, zone("default", Some(-8.0), None)],
            ZoneEvaluation::CandleClose,
        );

        let mut pos = long_position(4.0, 100.0);
        let actions = evaluate_zones(&strategy, &mut pos, &bar_at(90.0), 10, None);
        assert_eq!(
            actions,
            vec![ZoneAction::CloseAll {
                price: 90.0,
                reason: ExitReason::ZoneExit,
                zone: Some("danger".to_string())
            }]
        );
    }

    #[test]
    fn zone_stop_loss_fills_at_trigger() {
        let mut band = zone("band", None, None);
        band.stop_loss = StopConfig::FixedPercent(5.0);
        let strategy = strategy_with_zones(vec![band], ZoneEvaluation::CandleClose);

        let mut pos = long_position(1.0, 100.0);
        let candle = Candle::new(0, 98.0, 99.0, 93.0, 94.0, 1.0);
        let actions = evaluate_zones(&strategy, &mut pos, &candle, 10, None);
        assert_eq!(
            actions,
            vec![ZoneAction::CloseAll {
                price: 95.0,
                reason: ExitReason::StopLoss,
                zone: Some("band".to_string())
            }]
        );
    }

    #[test]
    fn zone_stop_gapped_through_fills_at_open() {
        let mut band = zone("band", None, None);
        band.stop_loss = StopConfig::FixedPercent(5.0);
        let strategy = strategy_with_zones(vec![band], ZoneEvaluation::CandleClose);

        let mut pos = long_position(1.0, 100.0);
        // Bar opens far below the 95 trigger.
        let candle = Candle::new(0, 90.0, 91.0, 89.0, 90.5, 1.0);
        let actions = evaluate_zones(&strategy, &mut pos, &candle, 10, None);
        assert_eq!(
            actions,
            vec![ZoneAction::CloseAll {
                price: 90.0,
                reason: ExitReason::StopLoss,
                zone: Some("band".to_string())
            }]
        );
    }

    #[test]
    fn zone_trailing_anchor_ratchets_and_fires() {
        let mut band = zone("band", None, None);
        band.stop_loss = StopConfig::TrailingPercent(5.0);
        let strategy = strategy_with_zones(vec![band], ZoneEvaluation::CandleClose);

        let mut pos = long_position(1.0, 100.0);
        // Run up: anchor follows the highs, no trigger yet.
        let up = Candle::new(0, 100.0, 120.0, 100.0, 119.0, 1.0);
        assert!(evaluate_zones(&strategy, &mut pos, &up, 10, None).is_empty());
        assert_eq!(pos.zone_state.trailing_anchor, Some(120.0));

        // Lower high must not lower the anchor.
        let drift = Candle::new(0, 119.0, 119.5, 116.0, 117.0, 1.0);
        assert!(evaluate_zones(&strategy, &mut pos, &drift, 11, None).is_empty());
        assert_eq!(pos.zone_state.trailing_anchor, Some(120.0));

        // Retrace through 120 * 0.95 = 114.
        let down = Candle::new(0, 117.0, 117.0, 112.0, 113.0, 1.0);
        let actions = evaluate_zones(&strategy, &mut pos, &down, 12, None);
        assert_eq!(
            actions,
            vec![ZoneAction::CloseAll {
                price: 114.0,
                reason: ExitReason::TrailingStop,
                zone: Some("band".to_string())
            }]
        );
    }

    #[test]
    fn intrabar_mode_fires_profit_zone_from_the_high() {
        let mut profit = zone("p", Some(5.0), None);
        profit.exit_pct = Some(50.0);
        let strategy = strategy_with_zones(
            vec![zone("default", None, Some(5.0)), profit],
            ZoneEvaluation::Intrabar,
        );

        let mut pos = long_position(2.0, 100.0);
        // Close is below the zone but the high sweeps through it.
        let candle = Candle::new(0, 100.0, 107.0, 99.5, 101.0, 1.0);
        let actions = evaluate_zones(&strategy, &mut pos, &candle, 10, None);
        assert_eq!(
            actions,
            vec![ZoneAction::ClosePartial {
                qty: 1.0,
                // Fill at the zone boundary (entry * 1.05), not the high.
                price: 105.0,
                zone: "p".to_string()
            }]
        );
    }

    #[test]
    fn global_stop_beats_take_profit_on_ambiguous_bar() {
        let mut strategy = strategy_with_zones(Vec::new(), ZoneEvaluation::CandleClose);
        strategy.stop_loss = StopConfig::FixedPercent(5.0);
        strategy.take_profit = StopConfig::FixedPercent(5.0);

        let mut pos = long_position(1.0, 100.0);
        // Bar range covers both 95 and 105.
        let candle = Candle::new(0, 100.0, 106.0, 94.0, 100.0, 1.0);
        let action = global_exit(&strategy, &mut pos, &candle, None).unwrap();
        assert_eq!(
            action,
            ZoneAction::CloseAll {
                price: 95.0,
                reason: ExitReason::StopLoss,
                zone: None
            }
        );
    }

    #[test]
    fn global_trailing_stop_locks_profit() {
        let mut strategy = strategy_with_zones(Vec::new(), ZoneEvaluation::CandleClose);
        strategy.stop_loss = StopConfig::TrailingPercent(5.0);

        let mut pos = long_position(1.0, 100.0);
        let up = Candle::new(0, 100.0, 120.0, 100.0, 119.0, 1.0);
        assert!(global_exit(&strategy, &mut pos, &up, None).is_none());
        assert_eq!(pos.peak_price, 120.0);
        // Trigger still derives from the pre-bar peak of 100.
        assert_eq!(pos.global_trail_stop, Some(95.0));

        let down = Candle::new(0, 118.0, 118.0, 112.0, 113.0, 1.0);
        let action = global_exit(&strategy, &mut pos, &down, None).unwrap();
        assert_eq!(
            action,
            ZoneAction::CloseAll {
                price: 114.0,
                reason: ExitReason::TrailingStop,
                zone: None
            }
        );
    }

    #[test]
    fn short_side_stop_sits_above_entry() {
        let mut strategy = strategy_with_zones(Vec::new(), ZoneEvaluation::CandleClose);
        strategy.stop_loss = StopConfig::FixedPercent(5.0);

        let mut pos = long_position(1.0, 100.0);
        pos.side = TradeSide::Short;
        pos.legs[0].side = TradeSide::Short;

        let candle = Candle::new(0, 102.0, 106.0, 101.0, 104.0, 1.0);
        let action = global_exit(&strategy, &mut pos, &candle, None).unwrap();
        assert_eq!(
            action,
            ZoneAction::CloseAll {
                price: 105.0,
                reason: ExitReason::StopLoss,
                zone: None
            }
        );
    }

    #[test]
    fn fixed_atr_stop_uses_entry_atr() {
        let mut strategy = strategy_with_zones(Vec::new(), ZoneEvaluation::CandleClose);
        strategy.stop_loss = StopConfig::FixedAtr(2.0);

        let mut pos = long_position(1.0, 100.0);
        pos.atr_at_entry = Some(1.5);
        // Trigger = 100 - 2 * 1.5 = 97.
        let candle = Candle::new(0, 99.0, 99.5, 96.0, 96.5, 1.0);
        let action = global_exit(&strategy, &mut pos, &candle, Some(9.0)).unwrap();
        assert_eq!(
            action,
            ZoneAction::CloseAll {
                price: 97.0,
                reason: ExitReason::StopLoss,
                zone: None
            }
        );
    }

    #[test]
    fn no_zones_means_no_actions_and_state_untouched() {
        let strategy = strategy_with_zones(Vec::new(), ZoneEvaluation::CandleClose);
        let mut pos = long_position(1.0, 100.0);
        assert!(evaluate_zones(&strategy, &mut pos, &bar_at(130.0), 5, None).is_empty());
        assert_eq!(pos.zone_state, ZoneState::default());
    }
}
