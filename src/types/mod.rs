pub mod candle;
pub mod market;
pub mod strategy;
pub mod timeframe;
pub mod trade;

pub use candle::*;
pub use market::*;
pub use strategy::*;
pub use timeframe::*;
pub use trade::*;
