use crate::types::Candle;

/// Average True Range with Wilder smoothing. The first value appears at
/// index `period - 1` as a plain average of the first `period` true
/// ranges; afterwards `atr = (prev * (n - 1) + tr) / n`.
pub fn atr(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; candles.len()];
    if candles.is_empty() || period == 0 {
        return out;
    }

    let mut prev_close: Option<f64> = None;
    let mut sum = 0.0;
    let mut value: Option<f64> = None;

    for (i, candle) in candles.iter().enumerate() {
        let tr = true_range(candle, prev_close);
        prev_close = Some(candle.close);

        match value {
            None => {
                sum += tr;
                if i + 1 == period {
                    value = Some(sum / period as f64);
                }
            }
            Some(prev) => {
                value = Some((prev * (period as f64 - 1.0) + tr) / period as f64);
            }
        }
        out[i] = value;
    }
    out
}

fn true_range(candle: &Candle, prev_close: Option<f64>) -> f64 {
    let hl = candle.high - candle.low;
    match prev_close {
        Some(pc) => {
            let hc = (candle.high - pc).abs();
            let lc = (candle.low - pc).abs();
            hl.max(hc).max(lc)
        }
        None => hl,
    }
}
