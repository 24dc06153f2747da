pub mod backtest;
pub mod metrics;
pub mod result;
pub mod zones;

pub use backtest::{BacktestEngine, Phase, RunConfig};
pub use metrics::Metrics;
pub use result::{BacktestResult, EquityPoint};
pub use zones::{evaluate_zones, global_exit, ZoneAction};
