// =============================================================================
// Signal Detection Engine — the brain of Nova
// =============================================================================
//
// `process_symbol` pipeline for one (symbol, timeframe):
//   1. Compute the indicator snapshot (insufficient data => action none)
//   2. Score LONG and SHORT; approve at confidence >= min_confidence
//   3. Derive entry / SL / TP from ATR, trading style, duration, R/R
//   4. De-duplicate against ACTIVE signals (timeframe-scaled window, ±1 %)
//   5. Apply cross-timeframe priority (higher timeframe wins)
//   6. Persist, then hand back for fan-out
//
// A fresh detection that lands on a timeframe already holding an ACTIVE
// signal for the tuple refreshes that signal's derived entry instead of
// minting a second one; an approved signal expires any opposite-direction
// ACTIVE signal on its timeframe. With no fresh detection, a signal whose
// own-side evidence has decayed below half the approval bar is expired.
//
// A dedup lookup that cannot run (persistence unavailable) suppresses
// emission — an unconfirmed duplicate is never emitted.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::SignalEngineConfig;
use crate::error::{EngineError, Result};
use crate::indicators::IndicatorSnapshot;
use crate::market_data::Candle;
use crate::persistence::{ActiveSignalFilter, Repository};
use crate::types::{new_id, Direction, MarketKind, Signal, SignalStatus, Timeframe};

use super::score::{score_direction, ScoreBreakdown};

/// Discriminated outcome of one `process_symbol` invocation.
#[derive(Debug, Clone)]
pub enum SignalAction {
    /// A new signal was detected, approved, and persisted.
    Created(Signal),
    /// An existing ACTIVE signal had its derived entry price refreshed.
    UpdatedPrice(Signal),
    /// An existing signal's candle evidence no longer holds; marked EXPIRED.
    Expired(Signal),
    /// Nothing to do.
    None,
}

/// `process_symbol` result plus the bookkeeping the scanner's per-track
/// summary wants.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub action: SignalAction,
    /// A would-be signal was suppressed by the de-duplication rule.
    pub suppressed_duplicate: bool,
    /// A would-be signal was suppressed by a higher-timeframe ACTIVE signal.
    pub suppressed_priority: bool,
    /// Lower-timeframe ACTIVE signals cancelled in favour of the new one.
    pub cancelled_lower: usize,
    /// Opposite-direction signals EXPIRED because the market flipped under
    /// them while the new signal was being created.
    pub expired_opposite: Vec<Signal>,
}

impl ProcessReport {
    fn none() -> Self {
        Self {
            action: SignalAction::None,
            suppressed_duplicate: false,
            suppressed_priority: false,
            cancelled_lower: 0,
            expired_opposite: Vec::new(),
        }
    }

    fn with_action(action: SignalAction) -> Self {
        Self {
            action,
            ..Self::none()
        }
    }
}

/// The detection engine. Holds the validated config and the repository it
/// runs dedup/priority lookups against.
pub struct SignalEngine {
    config: SignalEngineConfig,
    repo: Arc<dyn Repository>,
}

impl SignalEngine {
    /// Construct with a validated config. Invalid parameters fail here.
    pub fn new(config: SignalEngineConfig, repo: Arc<dyn Repository>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, repo })
    }

    pub fn config(&self) -> &SignalEngineConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Pure detection (shared with the backtest executor)
    // -------------------------------------------------------------------------

    /// Evaluate the candle window and return an approved signal draft, if
    /// any, with its score breakdown. Pure: no persistence, no dedup.
    ///
    /// `now` stamps created_at/updated_at so historical replays stay
    /// deterministic.
    pub fn detect(
        &self,
        symbol: &str,
        market: MarketKind,
        timeframe: Timeframe,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Option<(Signal, ScoreBreakdown)> {
        let snap = IndicatorSnapshot::compute(candles)?;

        let long = score_direction(&snap, Direction::Long, &self.config);
        let short = score_direction(&snap, Direction::Short, &self.config);

        // Confidence exactly at the threshold is approved.
        let best = [long, short]
            .into_iter()
            .filter(|b| b.confidence >= self.config.min_confidence)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))?;

        let signal = self.derive_signal(symbol, market, timeframe, &snap, &best, now);
        Some((signal, best))
    }

    /// Build the full signal record from an approved score.
    fn derive_signal(
        &self,
        symbol: &str,
        market: MarketKind,
        timeframe: Timeframe,
        snap: &IndicatorSnapshot,
        breakdown: &ScoreBreakdown,
        now: DateTime<Utc>,
    ) -> Signal {
        let (sl_mult, tp_mult) = self.effective_multipliers(snap.atr_pct);

        let entry = snap.close;
        let (sl, tp) = match breakdown.direction {
            Direction::Long => (entry - snap.atr * sl_mult, entry + snap.atr * tp_mult),
            Direction::Short => (entry + snap.atr * sl_mult, entry - snap.atr * tp_mult),
        };

        let (style, base_hours) = timeframe.classify();
        let duration_mult = if breakdown.confidence >= 0.85 {
            0.7
        } else if breakdown.confidence >= 0.75 {
            1.0
        } else {
            1.3
        };

        let sl_dist = (entry - sl).abs();
        let risk_reward = if sl_dist > 0.0 {
            (tp - entry).abs() / sl_dist
        } else {
            0.0
        };

        let leverage = match market {
            MarketKind::Spot => 1,
            MarketKind::Futures => self.config.futures_leverage,
        };

        Signal {
            id: new_id(),
            symbol: symbol.to_string(),
            market,
            direction: breakdown.direction,
            timeframe,
            entry_price: decimal_price(entry),
            stop_loss: decimal_price(sl),
            take_profit: decimal_price(tp),
            confidence: breakdown.confidence,
            status: SignalStatus::Active,
            trading_style: style,
            estimated_duration_hours: base_hours * duration_mult,
            leverage,
            risk_reward,
            description: breakdown.summary(),
            created_at: now,
            updated_at: now,
        }
    }

    /// SL/TP multipliers, optionally overridden by the symbol's volatility
    /// class. The override only applies when `use_volatility_aware` is set —
    /// it defaults off, and backtests force it off.
    fn effective_multipliers(&self, atr_pct: f64) -> (f64, f64) {
        let (sl, tp) = (self.config.sl_atr_multiplier, self.config.tp_atr_multiplier);
        if !self.config.use_volatility_aware {
            return (sl, tp);
        }
        // Calm symbols get wider targets, violent ones tighter.
        if atr_pct < 0.01 {
            (sl * 1.25, tp * 1.25)
        } else if atr_pct > 0.025 {
            (sl * 0.75, tp * 0.75)
        } else {
            (sl, tp)
        }
    }

    // -------------------------------------------------------------------------
    // Full pipeline
    // -------------------------------------------------------------------------

    /// Run detection plus dedup, priority, maintenance, and persistence for
    /// one (symbol, timeframe).
    pub async fn process_symbol(
        &self,
        symbol: &str,
        market: MarketKind,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<ProcessReport> {
        let now = Utc::now();

        let Some((draft, breakdown)) = self.detect(symbol, market, timeframe, candles, now) else {
            // No fresh detection: maintain whatever is already ACTIVE here.
            return self.maintain_existing(symbol, market, timeframe, candles, now).await;
        };

        // ── De-duplication ───────────────────────────────────────────────
        let dup = match self
            .repo
            .find_dup_signal(
                symbol,
                draft.direction,
                timeframe,
                market,
                draft.entry_price,
                timeframe.dedup_window(),
                now,
            )
            .await
        {
            Ok(dup) => dup,
            Err(e) => {
                // Cannot confirm uniqueness => never emit.
                warn!(symbol, error = %e, "dedup lookup failed — suppressing signal");
                return Ok(ProcessReport::none());
            }
        };

        if let Some(existing) = dup {
            let reason = EngineError::DuplicateSignal {
                symbol: symbol.to_string(),
                direction: draft.direction.to_string(),
                timeframe: timeframe.to_string(),
            };
            debug!(existing_id = %existing.id, "{reason}");
            let mut report = ProcessReport::none();
            report.suppressed_duplicate = true;
            return Ok(report);
        }

        // ── Cross-timeframe priority ─────────────────────────────────────
        let siblings = self
            .repo
            .list_active_signals(&ActiveSignalFilter {
                symbol: Some(symbol.to_string()),
                direction: Some(draft.direction),
                market: Some(market),
                timeframe: None,
            })
            .await?;

        let my_priority = timeframe.priority();

        // An ACTIVE signal already exists on this exact timeframe, outside
        // the proximity window or drifted past ±1 %: never a second ACTIVE
        // row for the tuple — the fresh detection refreshes the existing
        // signal's derived entry instead.
        if let Some(existing) = siblings
            .iter()
            .find(|s| s.timeframe.priority() == my_priority)
        {
            if existing.entry_price != draft.entry_price {
                self.repo
                    .update_signal_entry(&existing.id, draft.entry_price)
                    .await?;
                let mut updated = existing.clone();
                updated.entry_price = draft.entry_price;
                debug!(
                    symbol,
                    id = %updated.id,
                    entry = %updated.entry_price,
                    "existing signal entry refreshed by fresh detection"
                );
                return Ok(ProcessReport::with_action(SignalAction::UpdatedPrice(
                    updated,
                )));
            }
            let mut report = ProcessReport::none();
            report.suppressed_duplicate = true;
            return Ok(report);
        }

        if siblings
            .iter()
            .any(|s| s.timeframe.priority() > my_priority)
        {
            debug!(
                symbol,
                timeframe = %timeframe,
                "suppressed by higher-timeframe active signal"
            );
            let mut report = ProcessReport::none();
            report.suppressed_priority = true;
            return Ok(report);
        }

        let mut cancelled = 0;
        for lower in siblings
            .iter()
            .filter(|s| s.timeframe.priority() < my_priority)
        {
            match transition_with_retry(
                self.repo.as_ref(),
                &lower.id,
                SignalStatus::Active,
                SignalStatus::Cancelled,
            )
            .await
            {
                Ok(()) => {
                    cancelled += 1;
                    info!(
                        symbol,
                        cancelled_id = %lower.id,
                        cancelled_tf = %lower.timeframe,
                        new_tf = %timeframe,
                        "lower-timeframe signal superseded"
                    );
                }
                Err(e) => warn!(symbol, id = %lower.id, error = %e, "supersede failed — skipped"),
            }
        }

        // ── Evidence flip: expire the losing opposite side ───────────────
        // The market turning hard enough to mint this signal invalidates
        // any ACTIVE opposite-direction signal on the same timeframe.
        let mut expired_opposite = Vec::new();
        let flipped = self
            .repo
            .list_active_signals(&ActiveSignalFilter {
                symbol: Some(symbol.to_string()),
                direction: Some(draft.direction.opposite()),
                market: Some(market),
                timeframe: Some(timeframe),
            })
            .await?;
        for old in flipped {
            match transition_with_retry(
                self.repo.as_ref(),
                &old.id,
                SignalStatus::Active,
                SignalStatus::Expired,
            )
            .await
            {
                Ok(()) => {
                    info!(symbol, id = %old.id, "opposite signal expired by market flip");
                    let mut expired = old;
                    expired.status = SignalStatus::Expired;
                    expired_opposite.push(expired);
                }
                Err(e) => warn!(symbol, id = %old.id, error = %e, "flip expiry failed — skipped"),
            }
        }

        // ── Persist, then hand to fan-out (caller broadcasts) ────────────
        self.repo.insert_signal(&draft).await?;

        info!(
            symbol,
            timeframe = %timeframe,
            direction = %draft.direction,
            confidence = format!("{:.3}", draft.confidence),
            entry = %draft.entry_price,
            sl = %draft.stop_loss,
            tp = %draft.take_profit,
            "signal created"
        );
        debug!(symbol, breakdown = %breakdown.summary(), "score breakdown");

        Ok(ProcessReport {
            action: SignalAction::Created(draft),
            suppressed_duplicate: false,
            suppressed_priority: false,
            cancelled_lower: cancelled,
            expired_opposite,
        })
    }

    /// With no new detection, keep the symbol's existing ACTIVE signal on
    /// this timeframe honest: once its candle evidence is gone and the
    /// opposite side has taken over, it is EXPIRED.
    async fn maintain_existing(
        &self,
        symbol: &str,
        market: MarketKind,
        timeframe: Timeframe,
        candles: &[Candle],
        _now: DateTime<Utc>,
    ) -> Result<ProcessReport> {
        let active = self
            .repo
            .list_active_signals(&ActiveSignalFilter {
                symbol: Some(symbol.to_string()),
                direction: None,
                market: Some(market),
                timeframe: Some(timeframe),
            })
            .await?;

        let Some(existing) = active.into_iter().next() else {
            return Ok(ProcessReport::none());
        };

        let Some(snap) = IndicatorSnapshot::compute(candles) else {
            return Ok(ProcessReport::none());
        };

        // detect() found nothing, so the signal's own side is already below
        // the approval bar. Once it decays under half the bar the candle
        // evidence is considered gone and the signal is EXPIRED rather than
        // left to ride out its wall-clock bound.
        let own = score_direction(&snap, existing.direction, &self.config);
        if own.confidence < self.config.min_confidence * 0.5 {
            transition_with_retry(
                self.repo.as_ref(),
                &existing.id,
                SignalStatus::Active,
                SignalStatus::Expired,
            )
            .await?;
            let mut expired = existing;
            expired.status = SignalStatus::Expired;
            info!(symbol, id = %expired.id, "signal evidence gone — expired");
            return Ok(ProcessReport::with_action(SignalAction::Expired(expired)));
        }

        Ok(ProcessReport::none())
    }
}

/// Guarded status transition, retried once on an optimistic-lock miss.
pub async fn transition_with_retry(
    repo: &dyn Repository,
    id: &str,
    expected_old: SignalStatus,
    new: SignalStatus,
) -> Result<()> {
    match repo.update_signal_status(id, expected_old, new).await {
        Err(EngineError::ConcurrentUpdate { .. }) => {
            repo.update_signal_status(id, expected_old, new).await
        }
        other => other,
    }
}

/// Convert an indicator-space price to the fixed-precision decimal form
/// signals carry (8 fractional digits).
pub fn decimal_price(value: f64) -> Decimal {
    Decimal::from_f64_retain(value)
        .unwrap_or(Decimal::ZERO)
        .round_dp(8)
}
