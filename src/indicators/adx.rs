// =============================================================================
// Average Directional Index (ADX) with +DI / -DI
// =============================================================================
//
// Calculation pipeline (Wilder's DMI):
//   1. Compute +DM (positive directional movement) and -DM per bar.
//   2. Compute True Range (TR) per bar.
//   3. Apply Wilder's smoothing (period) to +DM, -DM, and TR.
//   4. Derive +DI = smoothed(+DM) / smoothed(TR) * 100
//            -DI = smoothed(-DM) / smoothed(TR) * 100
//   5. DX  = |+DI - -DI| / (+DI + -DI) * 100
//   6. ADX = Wilder's smoothed average of DX over `period` bars.
//
// Interpretation:
//   ADX > 25  => trending market
//   ADX < 20  => ranging / choppy market
// =============================================================================

use crate::market_data::Candle;

/// Most recent ADX together with the directional index pair it derives from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dmi {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Compute the most recent ADX / +DI / -DI from a slice of candles.
///
/// Returns `None` when:
/// - `period` is zero.
/// - There are fewer than `2 * period + 1` candles (`period` bars for the
///   initial Wilder's smoothing **and** another `period` DX values to seed
///   the ADX average, plus the first candle that has no predecessor).
/// - Any intermediate calculation produces a non-finite result.
pub fn calculate_dmi(candles: &[Candle], period: usize) -> Option<Dmi> {
    if period == 0 {
        return None;
    }

    let min_candles = 2 * period + 1;
    if candles.len() < min_candles {
        return None;
    }

    let period_f = period as f64;

    // ------------------------------------------------------------------
    // Step 1 & 2: Raw +DM, -DM, and True Range for each consecutive pair
    // ------------------------------------------------------------------
    let n = candles.len();
    let bar_count = n - 1;

    let mut plus_dm = Vec::with_capacity(bar_count);
    let mut minus_dm = Vec::with_capacity(bar_count);
    let mut tr_vals = Vec::with_capacity(bar_count);

    for i in 1..n {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_high = candles[i - 1].high;
        let prev_low = candles[i - 1].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;

        let pdm = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        let mdm = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };

        plus_dm.push(pdm);
        minus_dm.push(mdm);
        tr_vals.push(tr);
    }

    // ------------------------------------------------------------------
    // Step 3: Wilder's smoothing of +DM, -DM, TR
    // ------------------------------------------------------------------
    let mut smooth_plus_dm: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus_dm: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values: Vec<f64> = Vec::with_capacity(bar_count - period + 1);
    let (mut plus_di, mut minus_di);

    match compute_di_dx(smooth_plus_dm, smooth_minus_dm, smooth_tr) {
        Some((p, m, dx)) => {
            plus_di = p;
            minus_di = m;
            dx_values.push(dx);
        }
        None => return None,
    }

    for i in period..bar_count {
        smooth_plus_dm = smooth_plus_dm - smooth_plus_dm / period_f + plus_dm[i];
        smooth_minus_dm = smooth_minus_dm - smooth_minus_dm / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];

        match compute_di_dx(smooth_plus_dm, smooth_minus_dm, smooth_tr) {
            Some((p, m, dx)) => {
                plus_di = p;
                minus_di = m;
                dx_values.push(dx);
            }
            None => return None,
        }
    }

    // ------------------------------------------------------------------
    // Step 6: ADX = Wilder's smoothed average of DX
    // ------------------------------------------------------------------
    if dx_values.len() < period {
        return None;
    }

    let adx_seed: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    if !adx_seed.is_finite() {
        return None;
    }

    let mut adx = adx_seed;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
        if !adx.is_finite() {
            return None;
        }
    }

    adx.is_finite().then_some(Dmi {
        adx,
        plus_di,
        minus_di,
    })
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Compute (+DI, -DI, DX) from smoothed +DM, -DM, and TR values.
///
/// Returns `None` if the divisor is zero or a result is non-finite.
fn compute_di_dx(
    smooth_plus_dm: f64,
    smooth_minus_dm: f64,
    smooth_tr: f64,
) -> Option<(f64, f64, f64)> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = (smooth_plus_dm / smooth_tr) * 100.0;
    let minus_di = (smooth_minus_dm / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    let dx = if di_sum == 0.0 {
        0.0 // No directional movement at all.
    } else {
        ((plus_di - minus_di).abs() / di_sum) * 100.0
    };

    (plus_di.is_finite() && minus_di.is_finite() && dx.is_finite())
        .then_some((plus_di, minus_di, dx))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        let t = Utc.timestamp_opt(i * 60, 0).unwrap();
        Candle {
            open_time: t,
            close_time: t + chrono::Duration::seconds(59),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn dmi_period_zero() {
        let candles: Vec<Candle> = (0..50).map(|i| candle(i, 1.0, 2.0, 0.5, 1.5)).collect();
        assert!(calculate_dmi(&candles, 0).is_none());
    }

    #[test]
    fn dmi_insufficient_data() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 1.0, 2.0, 0.5, 1.5)).collect();
        assert!(calculate_dmi(&candles, 14).is_none());
    }

    #[test]
    fn dmi_strong_uptrend() {
        // Consecutive higher highs and higher lows — a strong trend.
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(i, base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();

        let dmi = calculate_dmi(&candles, 14).unwrap();
        assert!(dmi.adx > 25.0, "expected ADX > 25 for strong trend, got {}", dmi.adx);
        assert!(dmi.plus_di > dmi.minus_di, "+DI should lead in an uptrend");
    }

    #[test]
    fn dmi_strong_downtrend() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 300.0 - i as f64 * 2.0;
                candle(i, base, base + 0.5, base - 1.5, base - 1.0)
            })
            .collect();

        let dmi = calculate_dmi(&candles, 14).unwrap();
        assert!(dmi.minus_di > dmi.plus_di, "-DI should lead in a downtrend");
    }

    #[test]
    fn dmi_flat_market() {
        // Identical candles — no directional movement, ADX converges to 0.
        let candles: Vec<Candle> = (0..60).map(|i| candle(i, 100.0, 101.0, 99.0, 100.0)).collect();
        let dmi = calculate_dmi(&candles, 14).unwrap();
        assert!(dmi.adx < 1.0, "expected ADX near 0 for flat market, got {}", dmi.adx);
    }

    #[test]
    fn dmi_result_range() {
        let candles: Vec<Candle> = (0..100)
            .map(|i| {
                let base = 50.0 + (i as f64 * 0.3).sin() * 10.0;
                candle(i, base - 0.5, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        if let Some(dmi) = calculate_dmi(&candles, 14) {
            assert!((0.0..=100.0).contains(&dmi.adx), "ADX {} out of range", dmi.adx);
            assert!(dmi.plus_di >= 0.0 && dmi.minus_di >= 0.0);
        }
    }

    #[test]
    fn dmi_minimum_candles_exact() {
        // Exactly 2*period + 1 candles should produce a result.
        let period = 5;
        let min = 2 * period + 1;
        let candles: Vec<Candle> = (0..min)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(i as i64, base, base + 1.0, base - 0.5, base + 0.5)
            })
            .collect();
        assert!(calculate_dmi(&candles, period).is_some());
        assert!(calculate_dmi(&candles[..min - 1], period).is_none());
    }
}
