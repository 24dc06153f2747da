use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregated trade tick. Only loaded when orderflow indicators are
/// requested; the store keeps them keyed by `agg_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggTrade {
    pub agg_id: i64,
    pub price: f64,
    pub quantity: f64,
    pub first_trade_id: i64,
    pub last_trade_id: i64,
    pub transact_time: i64,
    pub is_buyer_maker: bool,
}

/// Perp funding event, one every 8 hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub funding_time: i64,
    pub rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<f64>,
}

/// Open-interest sample at 5-minute cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub timestamp: i64,
    pub open_interest: f64,
    pub open_interest_value: f64,
}

/// Premium-index kline (perp futures basis).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PremiumIndexKline {
    pub interval: String,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub close_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Perp,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Perp => "perp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spot" => Some(MarketType::Spot),
            "perp" => Some(MarketType::Perp),
            _ => None,
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored data families. `table_key` is the coverage-table discriminator,
/// `archive_name` the path segment in archival download URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Candles,
    AggTrades,
    FundingRates,
    OpenInterest,
    PremiumIndex,
}

impl DataType {
    pub fn table_key(&self) -> &'static str {
        match self {
            DataType::Candles => "candles",
            DataType::AggTrades => "agg_trades",
            DataType::FundingRates => "funding_rates",
            DataType::OpenInterest => "open_interest",
            DataType::PremiumIndex => "premium_index",
        }
    }

    pub fn archive_name(&self) -> &'static str {
        match self {
            DataType::Candles => "klines",
            DataType::AggTrades => "aggTrades",
            DataType::FundingRates => "fundingRate",
            DataType::OpenInterest => "openInterest",
            DataType::PremiumIndex => "premiumIndexKlines",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candles" => Some(DataType::Candles),
            "agg_trades" => Some(DataType::AggTrades),
            "funding_rates" => Some(DataType::FundingRates),
            "open_interest" => Some(DataType::OpenInterest),
            "premium_index" => Some(DataType::PremiumIndex),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_type_round_trip() {
        assert_eq!(MarketType::parse("spot"), Some(MarketType::Spot));
        assert_eq!(MarketType::parse("perp"), Some(MarketType::Perp));
        assert_eq!(MarketType::parse("margin"), None);
    }

    #[test]
    fn data_type_keys() {
        assert_eq!(DataType::Candles.table_key(), "candles");
        assert_eq!(DataType::AggTrades.archive_name(), "aggTrades");
        assert_eq!(DataType::parse("funding_rates"), Some(DataType::FundingRates));
    }
}
