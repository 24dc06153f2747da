/// Relative Strength Index with Wilder smoothing over close-to-close
/// changes. First value at index `period` (one change per bar).
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() <= period {
        return out;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = values[i] - values[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss += -change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..values.len() {
        let change = values[i] - values[i - 1];
        let (gain, loss) = if change > 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_gains_pins_at_100() {
        let values: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let series = rsi(&values, 14);
        assert_eq!(series[20], Some(100.0));
    }

    #[test]
    fn flat_series_neutral() {
        let values = vec![100.0; 30];
        let series = rsi(&values, 14);
        // No gains and no losses: avg_loss == 0 pins the ratio at 100.
        assert_eq!(series[20], Some(100.0));
    }

    #[test]
    fn alternating_moves_land_mid_range() {
        let values: Vec<f64> = (0..40)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let series = rsi(&values, 14);
        let v = series[30].unwrap();
        assert!(v > 40.0 && v < 60.0, "rsi {v} should be near 50");
    }
}
