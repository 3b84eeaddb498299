// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Exponential smoothing with alpha = 2 / (period + 1), seeded with the
// arithmetic mean of the first `period` samples and updated in place:
//
//   ema += alpha * (sample - ema)
//
// Operates on plain value series rather than candles: the inputs are
// usually closes, but the MACD signal line smooths the MACD line itself.
// =============================================================================

/// EMA series over `values`. The first output corresponds to
/// `values[period - 1]` (the seed mean); the series stops early if it turns
/// non-finite.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mean = values[..period].iter().sum::<f64>() / period as f64;
    if !mean.is_finite() {
        return Vec::new();
    }

    std::iter::once(mean)
        .chain(values[period..].iter().scan(mean, |ema, &sample| {
            *ema += alpha * (sample - *ema);
            Some(*ema)
        }))
        .take_while(|ema| ema.is_finite())
        .collect()
}

/// Latest EMA value, if the series is long enough.
pub fn latest_ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// The 9/21/50 EMA stack used by the alignment predicate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaStack {
    pub ema_9: f64,
    pub ema_21: f64,
    pub ema_50: f64,
}

impl EmaStack {
    pub fn bullish_aligned(&self) -> bool {
        self.ema_9 > self.ema_21 && self.ema_21 > self.ema_50
    }

    pub fn bearish_aligned(&self) -> bool {
        self.ema_9 < self.ema_21 && self.ema_21 < self.ema_50
    }
}

/// Most recent value of each EMA in the 9/21/50 stack.
///
/// Returns `None` when there are fewer than 50 closes.
pub fn ema_stack(closes: &[f64]) -> Option<EmaStack> {
    Some(EmaStack {
        ema_9: latest_ema(closes, 9)?,
        ema_21: latest_ema(closes, 21)?,
        ema_50: latest_ema(closes, 50)?,
    })
}
