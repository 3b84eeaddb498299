// =============================================================================
// Relative Strength Index (RSI)
// =============================================================================
//
// Wilder's construction over close-to-close moves: running averages of the
// upward and downward components are seeded with the plain mean of the
// first `period` moves, then smoothed in place:
//
//   avg += (move - avg) / period
//
// The index maps the pair onto [0, 100] as 100 * rise / (rise + fall) —
// the textbook 100 - 100 / (1 + RS) form without the division blow-up when
// there are no down moves.
// =============================================================================

use crate::market_data::Candle;

/// Wilder's running averages of upward and downward close-to-close moves.
#[derive(Debug, Clone, Copy)]
struct WilderMoves {
    rise: f64,
    fall: f64,
}

impl WilderMoves {
    /// Fold one more close-to-close move into the smoothed averages.
    fn absorb(&mut self, change: f64, period: f64) {
        let (up, down) = if change >= 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        self.rise += (up - self.rise) / period;
        self.fall += (down - self.fall) / period;
    }

    /// Map the averages onto [0, 100]. A dead-flat tape reads as 50.
    fn index(&self) -> Option<f64> {
        let total = self.rise + self.fall;
        let rsi = if total == 0.0 {
            50.0
        } else {
            100.0 * self.rise / total
        };
        rsi.is_finite().then_some(rsi)
    }
}

/// Full RSI series over a candle sequence. The first output corresponds to
/// candle index `period` (the warm-up candles only feed the seed averages);
/// the series stops early if the input turns non-finite.
pub fn rsi_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() <= period {
        return Vec::new();
    }

    let period_len = period as f64;

    // Seed: arithmetic mean of the first `period` moves, split by sign.
    let mut moves = WilderMoves {
        rise: 0.0,
        fall: 0.0,
    };
    for pair in candles.windows(2).take(period) {
        let change = pair[1].close - pair[0].close;
        if change >= 0.0 {
            moves.rise += change / period_len;
        } else {
            moves.fall -= change / period_len;
        }
    }

    let mut series = Vec::with_capacity(candles.len() - period);
    match moves.index() {
        Some(value) => series.push(value),
        None => return series,
    }

    for pair in candles.windows(2).skip(period) {
        moves.absorb(pair[1].close - pair[0].close, period_len);
        match moves.index() {
            Some(value) => series.push(value),
            None => break,
        }
    }

    series
}

/// RSI at the most recent candle, if the series is long enough.
pub fn latest_rsi(candles: &[Candle], period: usize) -> Option<f64> {
    rsi_series(candles, period).last().copied()
}
