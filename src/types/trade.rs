use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::{ExitZone, ReentryPolicy, TradeSide};

/// Why a fill record is in the state it is in. The wire strings are stable
/// and consumed by external tooling; do not rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Open,
    Signal,
    StopLoss,
    TrailingStop,
    TakeProfit,
    ZoneExit,
    EndOfData,
    Rejected,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Open => "open",
            ExitReason::Signal => "signal",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::ZoneExit => "zone_exit",
            ExitReason::EndOfData => "end_of_data",
            ExitReason::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One fill record. An open leg has `exit_reason == Open` and no exit
/// fields; a partial exit splits a leg, producing a closed record for the
/// exited quantity while the remainder stays open. `pnl` is net of the
/// commissions attributed to the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub group_id: String,
    pub side: TradeSide,
    pub entry_bar: usize,
    pub entry_time: i64,
    pub entry_price: f64,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_bar: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    pub exit_reason: ExitReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl_pct: Option<f64>,
    pub commission_paid: f64,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.exit_reason == ExitReason::Open
    }
}

/// Per-position zone-machine state (see the engine's zone tracker).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneState {
    pub current_zone: Option<String>,
    pub zone_entry_bar: Option<usize>,
    pub triggered_exits: BTreeSet<String>,
    /// Most favorable price seen while the current zone has been active;
    /// drives the zone-level trailing stop.
    pub trailing_anchor: Option<f64>,
    pub last_pnl_pct: Option<f64>,
}

impl ZoneState {
    /// Apply the bookkeeping for moving into `zone` at `bar`.
    pub fn enter_zone(&mut self, zone: &ExitZone, bar: usize) {
        self.current_zone = Some(zone.name.clone());
        self.zone_entry_bar = Some(bar);
        if zone.reentry == ReentryPolicy::Reset {
            self.triggered_exits.remove(&zone.name);
            self.trailing_anchor = None;
        }
    }

    pub fn leave_zones(&mut self) {
        self.current_zone = None;
        self.zone_entry_bar = None;
        self.trailing_anchor = None;
    }
}

/// A group of same-side legs averaging into one logical position. The
/// group id carries the `dca-` prefix; the whole group occupies a single
/// slot against `max_open_trades`.
#[derive(Debug, Clone)]
pub struct Position {
    pub group_id: String,
    pub side: TradeSide,
    pub legs: Vec<Trade>,
    /// Total quantity ever entered into the group (first leg plus DCA
    /// legs). Exits never reduce it; this is the basis for
    /// `exit_basis = original`.
    pub original_qty: f64,
    /// Legs ever opened in this group, including replaced ones (DCA cap).
    pub entry_count: u32,
    pub first_entry_bar: usize,
    pub last_entry_bar: usize,
    pub zone_state: ZoneState,
    /// Most favorable price since the first entry; anchors the
    /// strategy-level trailing stop.
    pub peak_price: f64,
    /// Monotonic strategy-level trailing stop price, once armed.
    pub global_trail_stop: Option<f64>,
    /// ATR value at first entry, frozen for fixed-ATR stop distances.
    pub atr_at_entry: Option<f64>,
}

impl Position {
    pub fn new(first_leg: Trade, atr_at_entry: Option<f64>) -> Self {
        let entry_bar = first_leg.entry_bar;
        let entry_price = first_leg.entry_price;
        Self {
            group_id: first_leg.group_id.clone(),
            side: first_leg.side,
            original_qty: first_leg.quantity,
            entry_count: 1,
            first_entry_bar: entry_bar,
            last_entry_bar: entry_bar,
            legs: vec![first_leg],
            zone_state: ZoneState::default(),
            peak_price: entry_price,
            global_trail_stop: None,
            atr_at_entry,
        }
    }

    pub fn add_leg(&mut self, leg: Trade) {
        debug_assert_eq!(leg.group_id, self.group_id);
        debug_assert_eq!(leg.side, self.side);
        self.last_entry_bar = leg.entry_bar;
        self.entry_count += 1;
        self.original_qty += leg.quantity;
        self.legs.push(leg);
    }

    pub fn remaining_qty(&self) -> f64 {
        self.legs.iter().map(|l| l.quantity).sum()
    }

    /// Leg-weighted average entry price over currently open legs.
    pub fn avg_entry_price(&self) -> f64 {
        let qty = self.remaining_qty();
        if qty <= 0.0 {
            return 0.0;
        }
        self.legs
            .iter()
            .map(|l| l.quantity * l.entry_price)
            .sum::<f64>()
            / qty
    }

    /// Unrealized P&L percent at `price` vs the average entry, side-aware.
    pub fn unrealized_pnl_pct(&self, price: f64) -> f64 {
        let avg = self.avg_entry_price();
        if avg == 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - avg) / avg * 100.0
    }

    /// Cost basis of open legs (entry notional), for interest accrual.
    pub fn cost_basis(&self) -> f64 {
        self.legs
            .iter()
            .map(|l| l.quantity * l.entry_price)
            .sum::<f64>()
    }

    /// Signed market value contribution to equity at `price`. Long legs
    /// add `qty * price`; short legs are a liability of the same size
    /// (the proceeds were credited to cash at entry).
    pub fn market_value(&self, price: f64) -> f64 {
        self.side.sign() * self.remaining_qty() * price
    }

    /// Take up to `qty` out of the open legs, FIFO, splitting the last
    /// consumed leg if needed. Returns `(leg_entry_price, taken_qty,
    /// entry_commission_share)` slices for the caller to turn into closed
    /// trade records. Entry commission travels pro-rata with quantity so
    /// it is charged exactly once across splits.
    pub fn reduce(&mut self, qty: f64) -> Vec<(Trade, f64)> {
        let mut remaining = qty;
        let mut taken = Vec::new();
        while remaining > 1e-12 && !self.legs.is_empty() {
            let leg = &mut self.legs[0];
            if leg.quantity <= remaining + 1e-12 {
                remaining -= leg.quantity;
                let leg = self.legs.remove(0);
                let comm = leg.commission_paid;
                taken.push((leg, comm));
            } else {
                let fraction = remaining / leg.quantity;
                let comm_share = leg.commission_paid * fraction;
                let mut slice = leg.clone();
                slice.quantity = remaining;
                leg.quantity -= remaining;
                leg.commission_paid -= comm_share;
                taken.push((slice, comm_share));
                remaining = 0.0;
            }
        }
        taken
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }
}
