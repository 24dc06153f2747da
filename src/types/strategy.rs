use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{QuantError, Result};
use crate::types::MarketType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Long => "long",
            TradeSide::Short => "short",
        }
    }

    /// +1 for long, -1 for short. P&L math is written once and multiplied
    /// by this.
    pub fn sign(&self) -> f64 {
        match self {
            TradeSide::Long => 1.0,
            TradeSide::Short => -1.0,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizing {
    FixedDollar,
    FixedQuantity,
    PercentEquity,
}

/// Stop-loss configuration. Percent values are expressed in percent
/// (5.0 means 5%), ATR values are multiples of the ATR at work.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StopConfig {
    None,
    FixedPercent(f64),
    FixedAtr(f64),
    TrailingPercent(f64),
    TrailingAtr(f64),
}

impl StopConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, StopConfig::None)
    }

    pub fn is_trailing(&self) -> bool {
        matches!(self, StopConfig::TrailingPercent(_) | StopConfig::TrailingAtr(_))
    }

    fn from_parts(kind: &str, value: Option<f64>, field: &str) -> Result<Self> {
        let need = |v: Option<f64>| {
            v.filter(|x| x.is_finite() && *x > 0.0).ok_or_else(|| {
                QuantError::Config(format!("{field}: '{kind}' requires a positive value"))
            })
        };
        match kind {
            "none" | "" => Ok(StopConfig::None),
            "fixed_percent" => Ok(StopConfig::FixedPercent(need(value)?)),
            "fixed_atr" => Ok(StopConfig::FixedAtr(need(value)?)),
            "trailing_percent" => Ok(StopConfig::TrailingPercent(need(value)?)),
            "trailing_atr" => Ok(StopConfig::TrailingAtr(need(value)?)),
            other => Err(QuantError::Config(format!(
                "{field}: unknown type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcaMode {
    Continue,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcaConfig {
    pub enabled: bool,
    pub max_entries: u32,
    pub bars_between: u32,
    pub mode: DcaMode,
    pub size_multiplier: f64,
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: 1,
            bars_between: 0,
            mode: DcaMode::Continue,
            size_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitBasis {
    Original,
    Remaining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReentryPolicy {
    Continue,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneEvaluation {
    CandleClose,
    Intrabar,
}

/// A contiguous unrealized-P&L band with its own exit policy. Membership is
/// half-open `[min_pnl_pct, max_pnl_pct)`; a missing bound is unbounded.
/// Declaration order is precedence: the first matching zone wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitZone {
    pub name: String,
    pub min_pnl_pct: Option<f64>,
    pub max_pnl_pct: Option<f64>,
    #[serde(default = "StopConfig::default_none")]
    pub stop_loss: StopConfig,
    #[serde(default = "StopConfig::default_none")]
    pub take_profit: StopConfig,
    #[serde(default)]
    pub exit_immediately: bool,
    pub exit_pct: Option<f64>,
    pub exit_basis: ExitBasis,
    pub reentry: ReentryPolicy,
    #[serde(default)]
    pub min_bars_in_zone: u32,
}

impl StopConfig {
    fn default_none() -> Self {
        StopConfig::None
    }
}

impl ExitZone {
    pub fn contains(&self, pnl_pct: f64) -> bool {
        let min = self.min_pnl_pct.unwrap_or(f64::NEG_INFINITY);
        let max = self.max_pnl_pct.unwrap_or(f64::INFINITY);
        pnl_pct >= min && pnl_pct < max
    }
}

/// Fully-typed strategy model. Built from a [`StrategySpec`] (the wire form
/// written by the strategy-management API) with all enum and range checks
/// done up front so a run never starts on a bad configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub entry_condition: String,
    pub exit_condition: String,
    pub direction: TradeSide,
    pub max_open_trades: u32,
    pub min_bars_between_trades: u32,
    pub min_bars_before_exit: u32,
    pub sizing: PositionSizing,
    pub position_size: f64,
    pub commission_rate: f64,
    pub market_type: MarketType,
    pub margin_interest_rate: Option<f64>,
    pub stop_loss: StopConfig,
    pub take_profit: StopConfig,
    pub dca: DcaConfig,
    pub exit_zones: Vec<ExitZone>,
    pub zone_evaluation: ZoneEvaluation,
    pub atr_period: usize,
}

impl Strategy {
    /// Select the first declared zone containing `pnl_pct`.
    pub fn zone_for(&self, pnl_pct: f64) -> Option<&ExitZone> {
        self.exit_zones.iter().find(|z| z.contains(pnl_pct))
    }
}

/// Wire form of a strategy as stored by the management API: enum-like
/// fields are plain strings and the stop/TP/DCA blocks are flattened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    pub name: String,
    #[serde(default = "default_true_condition")]
    pub entry_condition: String,
    #[serde(default = "default_false_condition")]
    pub exit_condition: String,
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default = "default_one")]
    pub max_open_trades: u32,
    #[serde(default)]
    pub min_bars_between_trades: u32,
    #[serde(default)]
    pub min_bars_before_exit: u32,
    pub position_sizing_type: String,
    pub position_size: f64,
    #[serde(default)]
    pub commission_rate: f64,
    #[serde(default = "default_market_type")]
    pub market_type: String,
    #[serde(default)]
    pub margin_interest_rate: Option<f64>,
    #[serde(default = "default_none_kind")]
    pub stop_loss_type: String,
    #[serde(default)]
    pub stop_loss_value: Option<f64>,
    #[serde(default = "default_none_kind")]
    pub take_profit_type: String,
    #[serde(default)]
    pub take_profit_value: Option<f64>,
    #[serde(default)]
    pub dca_enabled: bool,
    #[serde(default = "default_one")]
    pub dca_max_entries: u32,
    #[serde(default)]
    pub dca_bars_between: u32,
    #[serde(default = "default_dca_mode")]
    pub dca_mode: String,
    #[serde(default = "default_multiplier")]
    pub dca_size_multiplier: f64,
    #[serde(default)]
    pub exit_zones: Vec<ExitZoneSpec>,
    #[serde(default = "default_zone_evaluation")]
    pub zone_evaluation: String,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitZoneSpec {
    pub name: String,
    #[serde(default)]
    pub min_pnl_pct: Option<f64>,
    #[serde(default)]
    pub max_pnl_pct: Option<f64>,
    #[serde(default = "default_none_kind")]
    pub stop_loss_type: String,
    #[serde(default)]
    pub stop_loss_value: Option<f64>,
    #[serde(default = "default_none_kind")]
    pub take_profit_type: String,
    #[serde(default)]
    pub take_profit_value: Option<f64>,
    #[serde(default)]
    pub exit_immediately: bool,
    #[serde(default)]
    pub exit_pct: Option<f64>,
    #[serde(default = "default_exit_basis")]
    pub exit_basis: String,
    #[serde(default = "default_reentry")]
    pub reentry: String,
    #[serde(default)]
    pub min_bars_in_zone: u32,
}

fn default_true_condition() -> String {
    "true".to_string()
}
fn default_false_condition() -> String {
    "false".to_string()
}
fn default_direction() -> String {
    "long".to_string()
}
fn default_one() -> u32 {
    1
}
fn default_market_type() -> String {
    "spot".to_string()
}
fn default_none_kind() -> String {
    "none".to_string()
}
fn default_dca_mode() -> String {
    "continue".to_string()
}
fn default_multiplier() -> f64 {
    1.0
}
fn default_exit_basis() -> String {
    "remaining".to_string()
}
fn default_reentry() -> String {
    "continue".to_string()
}
fn default_zone_evaluation() -> String {
    "candle_close".to_string()
}
fn default_atr_period() -> usize {
    14
}

impl TryFrom<StrategySpec> for Strategy {
    type Error = QuantError;

    fn try_from(spec: StrategySpec) -> Result<Strategy> {
        let direction = match spec.direction.as_str() {
            "long" => TradeSide::Long,
            "short" => TradeSide::Short,
            other => {
                return Err(QuantError::Config(format!(
                    "direction: unknown value '{other}'"
                )))
            }
        };

        let sizing = match spec.position_sizing_type.as_str() {
            "fixed_dollar" => PositionSizing::FixedDollar,
            "fixed_quantity" => PositionSizing::FixedQuantity,
            "percent_equity" => PositionSizing::PercentEquity,
            other => {
                return Err(QuantError::Config(format!(
                    "position_sizing_type: unknown value '{other}'"
                )))
            }
        };

        if !(spec.position_size.is_finite() && spec.position_size > 0.0) {
            return Err(QuantError::Config(format!(
                "position_size must be positive, got {}",
                spec.position_size
            )));
        }
        if sizing == PositionSizing::PercentEquity && spec.position_size > 100.0 {
            return Err(QuantError::Config(format!(
                "percent_equity position_size must be <= 100, got {}",
                spec.position_size
            )));
        }
        if !(0.0..1.0).contains(&spec.commission_rate) {
            return Err(QuantError::Config(format!(
                "commission_rate must be a fraction in [0, 1), got {}",
                spec.commission_rate
            )));
        }

        let market_type = MarketType::parse(&spec.market_type).ok_or_else(|| {
            QuantError::Config(format!("market_type: unknown value '{}'", spec.market_type))
        })?;
        if let Some(rate) = spec.margin_interest_rate {
            if !(rate.is_finite() && rate >= 0.0) {
                return Err(QuantError::Config(format!(
                    "margin_interest_rate must be >= 0, got {rate}"
                )));
            }
        }

        if spec.max_open_trades == 0 {
            return Err(QuantError::Config(
                "max_open_trades must be > 0".to_string(),
            ));
        }

        let dca = DcaConfig {
            enabled: spec.dca_enabled,
            max_entries: spec.dca_max_entries,
            bars_between: spec.dca_bars_between,
            mode: match spec.dca_mode.as_str() {
                "continue" => DcaMode::Continue,
                "replace" => DcaMode::Replace,
                other => {
                    return Err(QuantError::Config(format!(
                        "dca_mode: unknown value '{other}'"
                    )))
                }
            },
            size_multiplier: spec.dca_size_multiplier,
        };
        if dca.enabled && dca.max_entries == 0 {
            return Err(QuantError::Config(
                "dca_max_entries must be > 0 when DCA is enabled".to_string(),
            ));
        }
        if dca.enabled && !(dca.size_multiplier.is_finite() && dca.size_multiplier > 0.0) {
            return Err(QuantError::Config(format!(
                "dca_size_multiplier must be positive, got {}",
                dca.size_multiplier
            )));
        }

        let mut exit_zones = Vec::with_capacity(spec.exit_zones.len());
        for z in spec.exit_zones {
            if let Some(pct) = z.exit_pct {
                if !(pct > 0.0 && pct <= 100.0) {
                    return Err(QuantError::Config(format!(
                        "zone '{}': exit_pct must be in (0, 100], got {pct}",
                        z.name
                    )));
                }
            }
            if let (Some(min), Some(max)) = (z.min_pnl_pct, z.max_pnl_pct) {
                if min >= max {
                    return Err(QuantError::Config(format!(
                        "zone '{}': min_pnl_pct {min} must be < max_pnl_pct {max}",
                        z.name
                    )));
                }
            }
            exit_zones.push(ExitZone {
                stop_loss: StopConfig::from_parts(
                    &z.stop_loss_type,
                    z.stop_loss_value,
                    &format!("zone '{}' stop_loss", z.name),
                )?,
                take_profit: StopConfig::from_parts(
                    &z.take_profit_type,
                    z.take_profit_value,
                    &format!("zone '{}' take_profit", z.name),
                )?,
                exit_basis: match z.exit_basis.as_str() {
                    "original" => ExitBasis::Original,
                    "remaining" => ExitBasis::Remaining,
                    other => {
                        return Err(QuantError::Config(format!(
                            "zone '{}': unknown exit_basis '{other}'",
                            z.name
                        )))
                    }
                },
                reentry: match z.reentry.as_str() {
                    "continue" => ReentryPolicy::Continue,
                    "reset" => ReentryPolicy::Reset,
                    other => {
                        return Err(QuantError::Config(format!(
                            "zone '{}': unknown reentry '{other}'",
                            z.name
                        )))
                    }
                },
                name: z.name,
                min_pnl_pct: z.min_pnl_pct,
                max_pnl_pct: z.max_pnl_pct,
                exit_immediately: z.exit_immediately,
                exit_pct: z.exit_pct,
                min_bars_in_zone: z.min_bars_in_zone,
            });
        }

        Ok(Strategy {
            name: spec.name,
            entry_condition: spec.entry_condition,
            exit_condition: spec.exit_condition,
            direction,
            max_open_trades: spec.max_open_trades,
            min_bars_between_trades: spec.min_bars_between_trades,
            min_bars_before_exit: spec.min_bars_before_exit,
            sizing,
            position_size: spec.position_size,
            commission_rate: spec.commission_rate,
            market_type,
            margin_interest_rate: spec.margin_interest_rate,
            stop_loss: StopConfig::from_parts(
                &spec.stop_loss_type,
                spec.stop_loss_value,
                "stop_loss",
            )?,
            take_profit: StopConfig::from_parts(
                &spec.take_profit_type,
                spec.take_profit_value,
                "take_profit",
            )?,
            dca,
            exit_zones,
            zone_evaluation: match spec.zone_evaluation.as_str() {
                "candle_close" => ZoneEvaluation::CandleClose,
                "intrabar" => ZoneEvaluation::Intrabar,
                other => {
                    return Err(QuantError::Config(format!(
                        "zone_evaluation: unknown value '{other}'"
                    )))
                }
            },
            atr_period: spec.atr_period,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> StrategySpec {
        serde_json::from_value(serde_json::json!({
            "name": "test",
            "position_sizing_type": "fixed_dollar",
            "position_size": 1000.0
        }))
        .unwrap()
    }

    #[test]
    fn minimal_spec_converts_with_defaults() {
        let strategy = Strategy::try_from(base_spec()).unwrap();
        assert_eq!(strategy.direction, TradeSide::Long);
        assert_eq!(strategy.max_open_trades, 1);
        assert!(strategy.stop_loss.is_none());
        assert_eq!(strategy.zone_evaluation, ZoneEvaluation::CandleClose);
        assert!(!strategy.dca.enabled);
    }

    #[test]
    fn unknown_sizing_type_rejected() {
        let mut spec = base_spec();
        spec.position_sizing_type = "martingale".to_string();
        assert!(matches!(
            Strategy::try_from(spec),
            Err(QuantError::Config(_))
        ));
    }

    #[test]
    fn stop_loss_requires_value() {
        let mut spec = base_spec();
        spec.stop_loss_type = "fixed_percent".to_string();
        spec.stop_loss_value = None;
        assert!(Strategy::try_from(spec).is_err());

        let mut spec = base_spec();
        spec.stop_loss_type = "fixed_percent".to_string();
        spec.stop_loss_value = Some(-5.0);
        assert!(Strategy::try_from(spec).is_err());

        let mut spec = base_spec();
        spec.stop_loss_type = "trailing_percent".to_string();
        spec.stop_loss_value = Some(5.0);
        let strategy = Strategy::try_from(spec).unwrap();
        assert_eq!(strategy.stop_loss, StopConfig::TrailingPercent(5.0));
        assert!(strategy.stop_loss.is_trailing());
    }

    #[test]
    fn zone_membership_is_half_open() {
        let zone = ExitZone {
            name: "band".to_string(),
            min_pnl_pct: Some(5.0),
            max_pnl_pct: Some(10.0),
            stop_loss: StopConfig::None,
            take_profit: StopConfig::None,
            exit_immediately: false,
            exit_pct: None,
            exit_basis: ExitBasis::Remaining,
            reentry: ReentryPolicy::Continue,
            min_bars_in_zone: 0,
        };
        assert!(zone.contains(5.0));
        assert!(zone.contains(9.999));
        assert!(!zone.contains(10.0));
        assert!(!zone.contains(4.999));
    }

    #[test]
    fn unbounded_zone_ends() {
        let zone = ExitZone {
            name: "floor".to_string(),
            min_pnl_pct: None,
            max_pnl_pct: Some(0.0),
            stop_loss: StopConfig::None,
            take_profit: StopConfig::None,
            exit_immediately: false,
            exit_pct: None,
            exit_basis: ExitBasis::Remaining,
            reentry: ReentryPolicy::Continue,
            min_bars_in_zone: 0,
        };
        assert!(zone.contains(-1e9));
        assert!(!zone.contains(0.0));
    }

    #[test]
    fn first_matching_zone_wins() {
        let mut spec = base_spec();
        spec.exit_zones = vec![
            ExitZoneSpec {
                name: "a".to_string(),
                min_pnl_pct: None,
                max_pnl_pct: Some(10.0),
                stop_loss_type: "none".to_string(),
                stop_loss_value: None,
                take_profit_type: "none".to_string(),
                take_profit_value: None,
                exit_immediately: false,
                exit_pct: None,
                exit_basis: "remaining".to_string(),
                reentry: "continue".to_string(),
                min_bars_in_zone: 0,
            },
            ExitZoneSpec {
                name: "b".to_string(),
                min_pnl_pct: Some(-5.0),
                max_pnl_pct: None,
                stop_loss_type: "none".to_string(),
                stop_loss_value: None,
                take_profit_type: "none".to_string(),
                take_profit_value: None,
                exit_immediately: false,
                exit_pct: None,
                exit_basis: "remaining".to_string(),
                reentry: "continue".to_string(),
                min_bars_in_zone: 0,
            },
        ];
        let strategy = Strategy::try_from(spec).unwrap();
        // 2.0 is inside both; declaration order decides.
        assert_eq!(strategy.zone_for(2.0).unwrap().name, "a");
        assert_eq!(strategy.zone_for(50.0).unwrap().name, "b");
        assert!(strategy.zone_for(f64::NAN).is_none());
    }

    #[test]
    fn invalid_zone_bounds_rejected() {
        let mut spec = base_spec();
        spec.exit_zones = vec![ExitZoneSpec {
            name: "bad".to_string(),
            min_pnl_pct: Some(10.0),
            max_pnl_pct: Some(5.0),
            stop_loss_type: "none".to_string(),
            stop_loss_value: None,
            take_profit_type: "none".to_string(),
            take_profit_value: None,
            exit_immediately: false,
            exit_pct: None,
            exit_basis: "remaining".to_string(),
            reentry: "continue".to_string(),
            min_bars_in_zone: 0,
        }];
        assert!(Strategy::try_from(spec).is_err());
    }

    #[test]
    fn commission_must_be_fraction() {
        let mut spec = base_spec();
        spec.commission_rate = 1.5;
        assert!(Strategy::try_from(spec).is_err());
    }
}
