// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// The true range of a bar widens its high-low span to cover any gap from
// the previous close:
//
//   TR = max(high, prev_close) - min(low, prev_close)
//
// ATR is Wilder's smoothing of the TR stream, seeded with the mean of the
// first `period` ranges and then updated in place:
//
//   atr += (tr - atr) / period
// =============================================================================

use crate::market_data::Candle;

/// True range of `bar` given the previous bar's close.
pub fn true_range(bar: &Candle, prev_close: f64) -> f64 {
    bar.high.max(prev_close) - bar.low.min(prev_close)
}

/// Full ATR series over a candle sequence. The first output corresponds to
/// candle index `period` (each range needs a predecessor, and `period`
/// ranges feed the seed); the series stops early on non-finite input.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() <= period {
        return Vec::new();
    }

    let period_len = period as f64;
    let mut series = Vec::with_capacity(candles.len() - period);
    let mut atr = 0.0;

    for (i, pair) in candles.windows(2).enumerate() {
        let tr = true_range(&pair[1], pair[0].close);
        if i < period {
            // Seed phase: accumulate the mean of the first `period` ranges.
            atr += tr / period_len;
            if i + 1 < period {
                continue;
            }
        } else {
            atr += (tr - atr) / period_len;
        }

        if !atr.is_finite() {
            break;
        }
        series.push(atr);
    }

    series
}

/// ATR at the most recent candle, if the series is long enough.
pub fn latest_atr(candles: &[Candle], period: usize) -> Option<f64> {
    atr_series(candles, period).last().copied()
}

/// ATR as a fraction of the latest close (0.012 = 1.2 %). Comparable
/// across assets with different price scales.
pub fn atr_fraction(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = latest_atr(candles, period)?;
    let close = candles.last()?.close;
    (close > 0.0).then(|| atr / close)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(i: i64, high: f64, low: f64, close: f64) -> Candle {
        let t = Utc.timestamp_opt(i * 60, 0).unwrap();
        Candle {
            open_time: t,
            close_time: t + chrono::Duration::seconds(59),
            open: (high + low) / 2.0,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn true_range_inside_bar_is_the_span() {
        // Previous close inside the bar: TR is just high - low.
        let tr = true_range(&bar(1, 105.0, 95.0, 100.0), 98.0);
        assert!((tr - 10.0).abs() < 1e-12);
    }

    #[test]
    fn true_range_covers_gap_up() {
        // Bar opens far above the previous close: the gap counts.
        let tr = true_range(&bar(1, 115.0, 108.0, 112.0), 95.0);
        assert!((tr - 20.0).abs() < 1e-12); // 115 - 95
    }

    #[test]
    fn true_range_covers_gap_down() {
        let tr = true_range(&bar(1, 92.0, 85.0, 88.0), 105.0);
        assert!((tr - 20.0).abs() < 1e-12); // 105 - 85
    }

    #[test]
    fn warm_up_consumes_period_plus_one_candles() {
        let candles: Vec<Candle> = (0..6).map(|i| bar(i, 101.0, 99.0, 100.0)).collect();
        assert!(atr_series(&candles[..3], 3).is_empty());
        assert_eq!(atr_series(&candles[..4], 3).len(), 1);
        assert_eq!(atr_series(&candles, 3).len(), 3);
        assert!(atr_series(&candles, 0).is_empty());
    }

    #[test]
    fn hand_computed_two_period() {
        // TRs: bar1 = 12-9 = 3, bar2 = 13-10 = 3, bar3 = 17-12 = 5.
        // Seed = (3 + 3) / 2 = 3; next = 3 + (5 - 3) / 2 = 4.
        let candles = vec![
            bar(0, 10.5, 9.5, 10.0),
            bar(1, 12.0, 9.0, 11.0),
            bar(2, 13.0, 10.0, 12.0),
            bar(3, 17.0, 12.0, 16.0),
        ];
        let series = atr_series(&candles, 2);
        assert_eq!(series.len(), 2);
        assert!((series[0] - 3.0).abs() < 1e-12, "got {}", series[0]);
        assert!((series[1] - 4.0).abs() < 1e-12, "got {}", series[1]);
    }

    #[test]
    fn steady_band_converges_to_its_width() {
        // Identical 8-wide bars around a slow drift: ATR settles at 8.
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let mid = 100.0 + i as f64 * 0.05;
                bar(i, mid + 4.0, mid - 4.0, mid)
            })
            .collect();
        let atr = latest_atr(&candles, 14).unwrap();
        assert!((atr - 8.0).abs() < 0.5, "expected ATR near 8, got {atr}");
    }

    #[test]
    fn widening_ranges_lift_the_average() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let spread = 1.0 + i as f64 * 0.4;
                bar(i, 100.0 + spread, 100.0 - spread, 100.0)
            })
            .collect();
        let series = atr_series(&candles, 6);
        // Strictly increasing once the ranges keep widening.
        assert!(series.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn fraction_scales_by_price() {
        // Same 2-wide bars at price 100 vs price 1000: the fraction differs
        // by exactly the price ratio.
        let cheap: Vec<Candle> = (0..20).map(|i| bar(i, 101.0, 99.0, 100.0)).collect();
        let dear: Vec<Candle> = (0..20).map(|i| bar(i, 1001.0, 999.0, 1000.0)).collect();

        let f_cheap = atr_fraction(&cheap, 5).unwrap();
        let f_dear = atr_fraction(&dear, 5).unwrap();
        assert!((f_cheap - 0.02).abs() < 1e-12);
        assert!((f_cheap / f_dear - 10.0).abs() < 1e-9);
    }

    #[test]
    fn fraction_rejects_nonpositive_close() {
        let mut candles: Vec<Candle> = (0..20).map(|i| bar(i, 101.0, 99.0, 100.0)).collect();
        candles.last_mut().unwrap().close = 0.0;
        assert!(atr_fraction(&candles, 5).is_none());
    }

    #[test]
    fn non_finite_bar_truncates_the_series() {
        let mut candles: Vec<Candle> = (0..25).map(|i| bar(i, 101.0, 99.0, 100.0)).collect();
        candles[15].high = f64::INFINITY;
        let series = atr_series(&candles, 5);
        assert!(!series.is_empty());
        assert!(series.len() < 25 - 5);
        assert!(series.iter().all(|v| v.is_finite()));
    }
}
