//! Window-based indicator series. Each function takes the full candle
//! slice and returns a series aligned to it, `None` while the indicator is
//! still warming up. The condition evaluator and the engine's ATR-based
//! stops read these series by bar index.

pub mod atr;
pub mod ema;
pub mod rsi;

pub use atr::atr;
pub use ema::{ema, sma};
pub use rsi::rsi;

use crate::error::{QuantError, Result};
use crate::types::Candle;

/// Indicator families the evaluator may reference by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    Sma,
    Ema,
    Rsi,
    Atr,
}

impl IndicatorKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "sma" => Some(IndicatorKind::Sma),
            "ema" => Some(IndicatorKind::Ema),
            "rsi" => Some(IndicatorKind::Rsi),
            "atr" => Some(IndicatorKind::Atr),
            _ => None,
        }
    }

    pub fn compute(&self, candles: &[Candle], period: usize) -> Result<Vec<Option<f64>>> {
        if period == 0 {
            return Err(QuantError::Config(format!(
                "indicator period must be > 0 (got {period})"
            )));
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        Ok(match self {
            IndicatorKind::Sma => sma(&closes, period),
            IndicatorKind::Ema => ema(&closes, period),
            IndicatorKind::Rsi => rsi(&closes, period),
            IndicatorKind::Atr => atr(candles, period),
        })
    }
}
