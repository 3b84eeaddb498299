// =============================================================================
// Volume metrics — SMA baseline and current/average ratio
// =============================================================================

/// Simple moving average of the `period` volumes preceding the last bar.
///
/// The current bar is excluded from the baseline so a volume spike does not
/// inflate its own average.
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// samples, or the average is non-finite.
pub fn volume_sma(volumes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || volumes.len() < period + 1 {
        return None;
    }
    let window = &volumes[volumes.len() - 1 - period..volumes.len() - 1];
    let avg = window.iter().sum::<f64>() / period as f64;
    avg.is_finite().then_some(avg)
}

/// Current volume / `period`-bar average ("volume trend").
///
/// Returns `None` on insufficient data or a zero baseline.
pub fn volume_ratio(volumes: &[f64], period: usize) -> Option<f64> {
    let avg = volume_sma(volumes, period)?;
    if avg <= 0.0 {
        return None;
    }
    let current = *volumes.last()?;
    let ratio = current / avg;
    ratio.is_finite().then_some(ratio)
}
