// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line  = EMA(fast) - EMA(slow)          (canonical 12 / 26)
// Signal     = EMA(signal_period) of the MACD line   (canonical 9)
// Histogram  = MACD - Signal
//
// Series alignment: the MACD line starts at close index `slow - 1`; the
// signal and histogram start `signal_period - 1` MACD values later. All
// returned vectors are right-aligned with the input (their last elements
// correspond to the last close).
// =============================================================================

use super::ema::ema_series;

/// Aligned MACD output series.
#[derive(Debug, Clone, PartialEq)]
pub struct MacdSeries {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

/// Compute the MACD line, signal line, and histogram.
///
/// Returns `None` when there are fewer than `slow + signal_period - 1`
/// closes (not enough for a single histogram value) or when any parameter
/// is degenerate (`fast >= slow`, zero periods).
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdSeries> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period - 1 {
        return None;
    }

    let ema_fast = ema_series(closes, fast);
    let ema_slow = ema_series(closes, slow);
    if ema_slow.is_empty() {
        return None;
    }

    // Right-align the fast EMA against the slow one: the slow series is the
    // shorter, so drop the fast series' leading values.
    let offset = ema_fast.len().checked_sub(ema_slow.len())?;
    let macd: Vec<f64> = ema_fast[offset..]
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal = ema_series(&macd, signal_period);
    if signal.is_empty() {
        return None;
    }

    let offset = macd.len().checked_sub(signal.len())?;
    let histogram: Vec<f64> = macd[offset..]
        .iter()
        .zip(signal.iter())
        .map(|(m, s)| m - s)
        .collect();

    Some(MacdSeries {
        macd,
        signal,
        histogram,
    })
}

/// Whether the histogram crossed above zero within the last 1-2 bars:
/// the latest value is positive and one of the two preceding values was
/// at or below zero.
pub fn histogram_crossed_up(histogram: &[f64]) -> bool {
    let n = histogram.len();
    if n < 2 {
        return false;
    }
    let last = histogram[n - 1];
    if last <= 0.0 {
        return false;
    }
    let prev = histogram[n - 2];
    if prev <= 0.0 {
        return true;
    }
    n >= 3 && histogram[n - 3] <= 0.0
}

/// Mirror of [`histogram_crossed_up`] for the short side.
pub fn histogram_crossed_down(histogram: &[f64]) -> bool {
    let n = histogram.len();
    if n < 2 {
        return false;
    }
    let last = histogram[n - 1];
    if last >= 0.0 {
        return false;
    }
    let prev = histogram[n - 2];
    if prev >= 0.0 {
        return true;
    }
    n >= 3 && histogram[n - 3] >= 0.0
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        // Need 26 + 9 - 1 = 34 closes for the canonical parameters.
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_degenerate_params() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none()); // fast >= slow
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
        assert!(calculate_macd(&closes, 12, 26, 0).is_none());
    }

    #[test]
    fn macd_series_lengths_align() {
        let closes: Vec<f64> = (1..=100).map(|x| (x as f64 * 0.3).sin() * 10.0 + 100.0).collect();
        let m = calculate_macd(&closes, 12, 26, 9).unwrap();
        // MACD domain: closes[25..] => 75 values; signal/histogram drop
        // another 8 for the signal EMA seed.
        assert_eq!(m.macd.len(), 75);
        assert_eq!(m.signal.len(), 67);
        assert_eq!(m.histogram.len(), 67);
        // Histogram is MACD minus signal over the aligned tail.
        let last_h = m.histogram.last().unwrap();
        let expect = m.macd.last().unwrap() - m.signal.last().unwrap();
        assert!((last_h - expect).abs() < 1e-12);
    }

    #[test]
    fn macd_positive_in_uptrend() {
        // Accelerating uptrend: fast EMA above slow EMA => MACD > 0.
        let closes: Vec<f64> = (1..=80).map(|x| (x * x) as f64 * 0.01 + 100.0).collect();
        let m = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(*m.macd.last().unwrap() > 0.0);
    }

    #[test]
    fn cross_up_detection() {
        assert!(histogram_crossed_up(&[-0.5, -0.1, 0.2]));
        assert!(histogram_crossed_up(&[-0.1, 0.2, 0.3])); // crossed 2 bars ago
        assert!(!histogram_crossed_up(&[0.1, 0.2, 0.3])); // never negative
        assert!(!histogram_crossed_up(&[0.2, 0.1, -0.1])); // wrong side
        assert!(!histogram_crossed_up(&[0.5]));
    }

    #[test]
    fn cross_down_detection() {
        assert!(histogram_crossed_down(&[0.5, 0.1, -0.2]));
        assert!(histogram_crossed_down(&[0.1, -0.2, -0.3]));
        assert!(!histogram_crossed_down(&[-0.1, -0.2, -0.3]));
        assert!(!histogram_crossed_down(&[-0.2, -0.1, 0.1]));
    }

    #[test]
    fn macd_prefix_property() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + (i as f64 * 0.5).cos() * 8.0).collect();
        let full = calculate_macd(&closes, 12, 26, 9).unwrap();
        let partial = calculate_macd(&closes[..80], 12, 26, 9).unwrap();
        assert_eq!(&full.macd[..partial.macd.len()], &partial.macd[..]);
        assert_eq!(
            &full.histogram[..partial.histogram.len()],
            &partial.histogram[..]
        );
    }
}
