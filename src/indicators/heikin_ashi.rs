// =============================================================================
// Heikin-Ashi candles
// =============================================================================
//
// Derived OHLC that filters noise from the raw series:
//   HA_close = (O + H + L + C) / 4
//   HA_open  = (prev HA_open + prev HA_close) / 2   (first bar: (O + C) / 2)
//   HA_high  = max(H, HA_open, HA_close)
//   HA_low   = min(L, HA_open, HA_close)
// =============================================================================

use crate::market_data::Candle;

/// A single derived Heikin-Ashi bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaCandle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Fraction of the bar range a wick may occupy and still count as "small"
/// for the bullish/bearish body checks.
const SMALL_WICK_FRACTION: f64 = 0.15;

impl HaCandle {
    fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Bullish body with a small lower wick — the long-side HA predicate.
    pub fn is_bullish(&self) -> bool {
        if self.close <= self.open {
            return false;
        }
        let range = self.range();
        if range <= 0.0 {
            return false;
        }
        let lower_wick = self.open.min(self.close) - self.low;
        lower_wick <= range * SMALL_WICK_FRACTION
    }

    /// Bearish body with a small upper wick — the short-side mirror.
    pub fn is_bearish(&self) -> bool {
        if self.close >= self.open {
            return false;
        }
        let range = self.range();
        if range <= 0.0 {
            return false;
        }
        let upper_wick = self.high - self.open.max(self.close);
        upper_wick <= range * SMALL_WICK_FRACTION
    }
}

/// Derive the full Heikin-Ashi series from raw candles. Output length equals
/// input length; an empty input yields an empty series.
pub fn derive(candles: &[Candle]) -> Vec<HaCandle> {
    let mut out = Vec::with_capacity(candles.len());

    for (i, c) in candles.iter().enumerate() {
        let ha_close = (c.open + c.high + c.low + c.close) / 4.0;
        let ha_open = if i == 0 {
            (c.open + c.close) / 2.0
        } else {
            let prev: &HaCandle = &out[i - 1];
            (prev.open + prev.close) / 2.0
        };
        let ha_high = c.high.max(ha_open).max(ha_close);
        let ha_low = c.low.min(ha_open).min(ha_close);

        out.push(HaCandle {
            open: ha_open,
            high: ha_high,
            low: ha_low,
            close: ha_close,
        });
    }

    out
}
