// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period), upper/lower = middle ± k·σ. Percent-B locates
// the last close inside the bands: 0 at the lower band, 1 at the upper.

/// Result of a Bollinger Band calculation for the most recent close.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Band Width: (upper - lower) / middle * 100.
    pub width: f64,
    /// (close - lower) / (upper - lower), clamped to [0, 1]; 0.5 when the
    /// bands collapse (flat window).
    pub percent_b: f64,
}

/// Calculate Bollinger Bands over the trailing `period` closes.
///
/// Returns `None` when:
/// - Fewer than `period` data points or `period == 0`.
/// - Middle band is zero (degenerate input).
/// - Any result is non-finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let sum: f64 = window.iter().sum();
    let middle = sum / period as f64;

    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    let last = *closes.last()?;
    let band_span = upper - lower;
    let percent_b = if band_span > 0.0 {
        ((last - lower) / band_span).clamp(0.0, 1.0)
    } else {
        0.5
    };

    (width.is_finite() && percent_b.is_finite()).then_some(BollingerResult {
        upper,
        middle,
        lower,
        width,
        percent_b,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
    }

    #[test]
    fn bollinger_insufficient_data() {
        let closes = vec![1.0, 2.0, 3.0];
        assert!(calculate_bollinger(&closes, 20, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat_collapses_to_midpoint() {
        let closes = vec![100.0; 20];
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!((bb.width - 0.0).abs() < 1e-10);
        assert!((bb.percent_b - 0.5).abs() < 1e-10);
    }

    #[test]
    fn percent_b_at_band_edges() {
        // Last close well above the rest pushes %B toward 1.
        let mut closes = vec![100.0; 19];
        closes.push(120.0);
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.percent_b > 0.9, "expected %B near 1, got {}", bb.percent_b);

        // Last close well below pushes %B toward 0.
        let mut closes = vec![100.0; 19];
        closes.push(80.0);
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.percent_b < 0.1, "expected %B near 0, got {}", bb.percent_b);
    }

    #[test]
    fn percent_b_mid_band() {
        // Symmetric oscillation ending on the mean keeps %B near 0.5.
        let closes: Vec<f64> = (0..20)
            .map(|i| 100.0 + if i % 2 == 0 { 2.0 } else { -2.0 })
            .collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!((0.2..=0.8).contains(&bb.percent_b));
    }
}
