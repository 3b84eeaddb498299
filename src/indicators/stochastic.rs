// =============================================================================
// Stochastic Oscillator (14, 3, 3)
// =============================================================================
//
// Raw %K  = (close - lowest_low(k_period)) / (highest_high - lowest_low) * 100
// %K      = SMA(k_smooth) of raw %K        ("slow" stochastic)
// %D      = SMA(d_period) of %K
// =============================================================================

use crate::market_data::Candle;

/// Most recent smoothed %K / %D pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

/// Compute the slow stochastic oscillator for the last candle.
///
/// Returns `None` when there are fewer than
/// `k_period + k_smooth + d_period - 2` candles, any parameter is zero, or
/// a window is degenerate (all prices identical => raw %K defined as 50).
pub fn calculate_stochastic(
    candles: &[Candle],
    k_period: usize,
    k_smooth: usize,
    d_period: usize,
) -> Option<Stochastic> {
    if k_period == 0 || k_smooth == 0 || d_period == 0 {
        return None;
    }
    let needed = k_period + k_smooth + d_period - 2;
    if candles.len() < needed {
        return None;
    }

    // Raw %K for every window position.
    let mut raw_k = Vec::with_capacity(candles.len() - k_period + 1);
    for i in k_period - 1..candles.len() {
        let window = &candles[i + 1 - k_period..=i];
        let highest = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let close = candles[i].close;

        let span = highest - lowest;
        let k = if span > 0.0 {
            ((close - lowest) / span * 100.0).clamp(0.0, 100.0)
        } else {
            50.0 // Flat window — neutral.
        };
        if !k.is_finite() {
            return None;
        }
        raw_k.push(k);
    }

    let k_series = sma_series(&raw_k, k_smooth)?;
    let d_series = sma_series(&k_series, d_period)?;

    Some(Stochastic {
        k: *k_series.last()?,
        d: *d_series.last()?,
    })
}

/// Simple moving average series; `None` when input is shorter than `period`.
fn sma_series(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if values.len() < period {
        return None;
    }
    Some(
        values
            .windows(period)
            .map(|w| w.iter().sum::<f64>() / period as f64)
            .collect(),
    )
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(i: i64, high: f64, low: f64, close: f64) -> Candle {
        let t = Utc.timestamp_opt(i * 60, 0).unwrap();
        Candle {
            open_time: t,
            close_time: t + chrono::Duration::seconds(59),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn stochastic_insufficient_data() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 101.0, 99.0, 100.0)).collect();
        assert!(calculate_stochastic(&candles, 14, 3, 3).is_none());
    }

    #[test]
    fn stochastic_zero_params() {
        let candles: Vec<Candle> = (0..30).map(|i| candle(i, 101.0, 99.0, 100.0)).collect();
        assert!(calculate_stochastic(&candles, 0, 3, 3).is_none());
        assert!(calculate_stochastic(&candles, 14, 0, 3).is_none());
        assert!(calculate_stochastic(&candles, 14, 3, 0).is_none());
    }

    #[test]
    fn stochastic_top_of_range() {
        // Closes pinned to the window high => %K near 100.
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(i, base + 1.0, base - 5.0, base + 1.0)
            })
            .collect();
        let s = calculate_stochastic(&candles, 14, 3, 3).unwrap();
        assert!(s.k > 85.0, "expected high %K, got {}", s.k);
        assert!(s.d > 85.0, "expected high %D, got {}", s.d);
    }

    #[test]
    fn stochastic_bottom_of_range() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 200.0 - i as f64;
                candle(i, base + 5.0, base - 1.0, base - 1.0)
            })
            .collect();
        let s = calculate_stochastic(&candles, 14, 3, 3).unwrap();
        assert!(s.k < 15.0, "expected low %K, got {}", s.k);
    }

    #[test]
    fn stochastic_flat_market_is_neutral() {
        let candles: Vec<Candle> = (0..30).map(|i| candle(i, 100.0, 100.0, 100.0)).collect();
        let s = calculate_stochastic(&candles, 14, 3, 3).unwrap();
        assert!((s.k - 50.0).abs() < 1e-10);
        assert!((s.d - 50.0).abs() < 1e-10);
    }

    #[test]
    fn stochastic_in_range() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.4).sin() * 8.0;
                candle(i, base + 2.0, base - 2.0, base)
            })
            .collect();
        let s = calculate_stochastic(&candles, 14, 3, 3).unwrap();
        assert!((0.0..=100.0).contains(&s.k));
        assert!((0.0..=100.0).contains(&s.d));
    }
}
