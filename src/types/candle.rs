use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};

/// One completed OHLCV bar. `open_time` is the bar's open timestamp in
/// epoch milliseconds and is unique per `(symbol, timeframe, market_type)`.
/// Extended exchange fields are optional; archival sources provide them,
/// synthesized sub-minute bars may not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_buy_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_buy_quote_volume: Option<f64>,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            trade_count: None,
            quote_volume: None,
            taker_buy_volume: None,
            taker_buy_quote_volume: None,
        }
    }

    /// OHLC sanity check for rows coming from untrusted sources:
    /// `low <= min(open, close) <= max(open, close) <= high`, volume >= 0.
    pub fn validate(&self) -> Result<()> {
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if !(self.low <= body_low && body_high <= self.high) {
            return Err(QuantError::Parse(format!(
                "candle at {} violates OHLC ordering (o={} h={} l={} c={})",
                self.open_time, self.open, self.high, self.low, self.close
            )));
        }
        if self.volume < 0.0 || !self.volume.is_finite() {
            return Err(QuantError::Parse(format!(
                "candle at {} has invalid volume {}",
                self.open_time, self.volume
            )));
        }
        Ok(())
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body_size(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// True when `price` lies inside the bar's traded range.
    pub fn contains_price(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_well_formed_bar() {
        let c = Candle::new(0, 100.0, 105.0, 99.0, 103.0, 12.5);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let c = Candle::new(0, 100.0, 99.0, 105.0, 103.0, 12.5);
        assert!(c.validate().is_err());

        let c = Candle::new(0, 100.0, 101.0, 99.5, 102.0, 1.0);
        assert!(c.validate().is_err(), "close above high must be rejected");
    }

    #[test]
    fn validate_rejects_negative_volume() {
        let c = Candle::new(0, 100.0, 105.0, 99.0, 103.0, -1.0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn contains_price_is_inclusive() {
        let c = Candle::new(0, 100.0, 105.0, 99.0, 103.0, 1.0);
        assert!(c.contains_price(99.0));
        assert!(c.contains_price(105.0));
        assert!(!c.contains_price(98.999));
    }
}
