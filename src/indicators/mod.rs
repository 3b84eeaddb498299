// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators consumed by the
// signal engine. All functions are deterministic over their input slice;
// identical inputs yield bit-identical outputs. Insufficient data and
// numerical edge cases surface as `Option`/empty results, never panics.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod heikin_ashi;
pub mod macd;
pub mod rsi;
pub mod stochastic;
pub mod volume;

use crate::market_data::Candle;

/// Minimum candle count for a full snapshot: EMA-50 needs 50 closes, MACD
/// needs 34, ADX needs 29 — with the volume average's warm-up the engine
/// asks for 60 before it will score anything.
pub const MIN_CANDLES: usize = 60;

/// Everything the signal scorer needs about the most recent closed candle,
/// computed in one pass over the series.
#[derive(Debug, Clone)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub rsi: f64,
    /// MACD histogram crossed above zero within the last 1-2 bars.
    pub macd_cross_up: bool,
    /// MACD histogram crossed below zero within the last 1-2 bars.
    pub macd_cross_down: bool,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub atr: f64,
    /// ATR / close, as a fraction (0.012 = 1.2 %).
    pub atr_pct: f64,
    pub ema_9: f64,
    pub ema_21: f64,
    pub ema_50: f64,
    /// Percent-B position inside the Bollinger bands, in [0, 1].
    pub percent_b: f64,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub ha_bullish: bool,
    pub ha_bearish: bool,
    /// Current volume / 20-bar average volume.
    pub volume_ratio: f64,
}

impl IndicatorSnapshot {
    /// Compute the full snapshot for the last candle of `candles`.
    ///
    /// Returns `None` when the series is shorter than [`MIN_CANDLES`] or any
    /// component indicator cannot be computed (degenerate input).
    pub fn compute(candles: &[Candle]) -> Option<Self> {
        if candles.len() < MIN_CANDLES {
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        let close = *closes.last()?;

        let rsi = rsi::latest_rsi(candles, 14)?;

        let macd = macd::calculate_macd(&closes, 12, 26, 9)?;
        let macd_cross_up = macd::histogram_crossed_up(&macd.histogram);
        let macd_cross_down = macd::histogram_crossed_down(&macd.histogram);

        let dmi = adx::calculate_dmi(candles, 14)?;
        let atr = atr::latest_atr(candles, 14)?;
        if close <= 0.0 {
            return None;
        }
        let atr_pct = atr / close;

        let stack = ema::ema_stack(&closes)?;

        let bb = bollinger::calculate_bollinger(&closes, 20, 2.0)?;

        let stoch = stochastic::calculate_stochastic(candles, 14, 3, 3)?;

        let ha = heikin_ashi::derive(candles);
        let ha_last = ha.last()?;
        let ha_bullish = ha_last.is_bullish();
        let ha_bearish = ha_last.is_bearish();

        let volume_ratio = volume::volume_ratio(&volumes, 20)?;

        Some(Self {
            close,
            rsi,
            macd_cross_up,
            macd_cross_down,
            adx: dmi.adx,
            plus_di: dmi.plus_di,
            minus_di: dmi.minus_di,
            atr,
            atr_pct,
            ema_9: stack.ema_9,
            ema_21: stack.ema_21,
            ema_50: stack.ema_50,
            percent_b: bb.percent_b,
            stoch_k: stoch.k,
            stoch_d: stoch.d,
            ha_bullish,
            ha_bearish,
            volume_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        let t = Utc.timestamp_opt(i * 3600, 0).unwrap();
        Candle {
            open_time: t,
            close_time: t + chrono::Duration::seconds(3599),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    fn trending_series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.8;
                candle(i as i64, base, base + 1.5, base - 1.0, base + 1.0, 100.0)
            })
            .collect()
    }

    #[test]
    fn snapshot_requires_min_candles() {
        let candles = trending_series(MIN_CANDLES - 1);
        assert!(IndicatorSnapshot::compute(&candles).is_none());

        let candles = trending_series(MIN_CANDLES);
        assert!(IndicatorSnapshot::compute(&candles).is_some());
    }

    #[test]
    fn snapshot_fields_finite() {
        let candles = trending_series(120);
        let snap = IndicatorSnapshot::compute(&candles).unwrap();
        for v in [
            snap.close,
            snap.rsi,
            snap.adx,
            snap.plus_di,
            snap.minus_di,
            snap.atr,
            snap.atr_pct,
            snap.ema_9,
            snap.ema_21,
            snap.ema_50,
            snap.percent_b,
            snap.stoch_k,
            snap.stoch_d,
            snap.volume_ratio,
        ] {
            assert!(v.is_finite(), "non-finite snapshot value {v}");
        }
    }

    #[test]
    fn snapshot_uptrend_reads_bullish() {
        let candles = trending_series(120);
        let snap = IndicatorSnapshot::compute(&candles).unwrap();
        // Steady rise: price above EMA-50, +DI above -DI, aligned EMAs.
        assert!(snap.close > snap.ema_50);
        assert!(snap.plus_di > snap.minus_di);
        assert!(snap.ema_9 > snap.ema_21 && snap.ema_21 > snap.ema_50);
    }

    #[test]
    fn snapshot_deterministic() {
        let candles = trending_series(100);
        let a = IndicatorSnapshot::compute(&candles).unwrap();
        let b = IndicatorSnapshot::compute(&candles).unwrap();
        assert_eq!(a.rsi.to_bits(), b.rsi.to_bits());
        assert_eq!(a.adx.to_bits(), b.adx.to_bits());
        assert_eq!(a.atr.to_bits(), b.atr.to_bits());
        assert_eq!(a.percent_b.to_bits(), b.percent_b.to_bits());
    }
}
