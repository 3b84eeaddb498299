// =============================================================================
// Weighted predicate scorer — LONG/SHORT confidence from one snapshot
// =============================================================================
//
// Ten indicator predicates, each worth a fixed weight (canonical total
// 13.5). Confidence is the weighted sum normalised by the total, in [0, 1].
// SHORT mirrors LONG with inverted predicates; the band predicates
// (Bollinger %B, ATR band) are direction-neutral.
// =============================================================================

use serde::Serialize;

use crate::config::SignalEngineConfig;
use crate::indicators::IndicatorSnapshot;
use crate::types::Direction;

/// Percent-B band considered "not at the extremes".
const PERCENT_B_MIN: f64 = 0.30;
const PERCENT_B_MAX: f64 = 0.70;

/// ATR / price band: not too calm, not too wild.
const ATR_PCT_MIN: f64 = 0.005;
const ATR_PCT_MAX: f64 = 0.04;

/// The contribution of a single predicate to the final score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreContribution {
    pub name: &'static str,
    pub weight: f64,
    pub passed: bool,
}

/// Result of scoring one direction against a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub direction: Direction,
    pub score: f64,
    pub max_score: f64,
    pub confidence: f64,
    pub contributions: Vec<ScoreContribution>,
}

impl ScoreBreakdown {
    /// Human-readable summary of the predicates that fired, carried on the
    /// signal description.
    pub fn summary(&self) -> String {
        let passed: Vec<&str> = self
            .contributions
            .iter()
            .filter(|c| c.passed)
            .map(|c| c.name)
            .collect();
        format!(
            "{} score {:.2}/{:.1} [{}]",
            self.direction,
            self.score,
            self.max_score,
            passed.join(", ")
        )
    }
}

/// Score `direction` against the snapshot under `config`.
pub fn score_direction(
    snap: &IndicatorSnapshot,
    direction: Direction,
    config: &SignalEngineConfig,
) -> ScoreBreakdown {
    let w = &config.weights;
    let long = direction == Direction::Long;

    let (rsi_min, rsi_max, adx_min, volume_mult) = if long {
        (
            config.long_rsi_min,
            config.long_rsi_max,
            config.long_adx_min,
            config.long_volume_multiplier,
        )
    } else {
        (
            config.short_rsi_min,
            config.short_rsi_max,
            config.short_adx_min,
            config.short_volume_multiplier,
        )
    };

    let checks: [(&'static str, f64, bool); 10] = [
        (
            "macd_cross",
            w.macd_cross,
            if long {
                snap.macd_cross_up
            } else {
                snap.macd_cross_down
            },
        ),
        ("rsi", w.rsi, snap.rsi >= rsi_min && snap.rsi <= rsi_max),
        (
            "price_vs_ema50",
            w.price_vs_ema50,
            if long {
                snap.close > snap.ema_50
            } else {
                snap.close < snap.ema_50
            },
        ),
        ("adx", w.adx, snap.adx >= adx_min),
        (
            "heikin_ashi",
            w.heikin_ashi,
            if long { snap.ha_bullish } else { snap.ha_bearish },
        ),
        ("volume", w.volume, snap.volume_ratio >= volume_mult),
        (
            "ema_alignment",
            w.ema_alignment,
            if long {
                snap.ema_9 > snap.ema_21 && snap.ema_21 > snap.ema_50
            } else {
                snap.ema_9 < snap.ema_21 && snap.ema_21 < snap.ema_50
            },
        ),
        (
            "di_cross",
            w.di_cross,
            if long {
                snap.plus_di > snap.minus_di
            } else {
                snap.minus_di > snap.plus_di
            },
        ),
        (
            "bollinger_position",
            w.bollinger_position,
            snap.percent_b >= PERCENT_B_MIN && snap.percent_b <= PERCENT_B_MAX,
        ),
        (
            "atr_band",
            w.atr_band,
            snap.atr_pct >= ATR_PCT_MIN && snap.atr_pct <= ATR_PCT_MAX,
        ),
    ];

    let mut contributions = Vec::with_capacity(checks.len());
    let mut score = 0.0;
    for (name, weight, passed) in checks {
        if passed {
            score += weight;
        }
        contributions.push(ScoreContribution {
            name,
            weight,
            passed,
        });
    }

    let max_score = w.total();
    let confidence = if max_score > 0.0 { score / max_score } else { 0.0 };

    ScoreBreakdown {
        direction,
        score,
        max_score,
        confidence,
        contributions,
    }
}
