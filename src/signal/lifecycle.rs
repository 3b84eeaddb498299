// =============================================================================
// Signal lifecycle — ACTIVE => HIT_TP / HIT_SL / EXPIRED transitions
// =============================================================================
//
// Re-evaluated by the scanner after each tick against the latest candle:
//
//   ACTIVE -> HIT_TP   candle high (long) / low (short) reaches TP
//   ACTIVE -> HIT_SL   symmetrically for SL
//   ACTIVE -> EXPIRED  wall time since creation exceeds 10 candle periods
//
// When one candle's range covers both levels the adverse fill wins (SL) —
// the same conservative tie rule the backtest applies. Terminal states are
// final; transitions go through the guarded status update.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use tracing::info;

use crate::error::Result;
use crate::market_data::Candle;
use crate::persistence::Repository;
use crate::types::{Direction, Signal, SignalStatus};

use super::engine::transition_with_retry;

/// Outcome of checking one ACTIVE signal against the latest candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    HitTp,
    HitSl,
    Expired,
    StillActive,
}

impl LifecycleOutcome {
    pub fn terminal_status(&self) -> Option<SignalStatus> {
        match self {
            Self::HitTp => Some(SignalStatus::HitTp),
            Self::HitSl => Some(SignalStatus::HitSl),
            Self::Expired => Some(SignalStatus::Expired),
            Self::StillActive => None,
        }
    }
}

/// Evaluate an ACTIVE signal against the latest closed candle.
///
/// Touching a level exactly counts as a hit. SL is checked before TP so a
/// candle spanning both resolves to the adverse fill.
pub fn evaluate(signal: &Signal, candle: &Candle, now: DateTime<Utc>) -> LifecycleOutcome {
    let tp = signal.take_profit.to_f64().unwrap_or(f64::NAN);
    let sl = signal.stop_loss.to_f64().unwrap_or(f64::NAN);
    if !tp.is_finite() || !sl.is_finite() {
        return LifecycleOutcome::StillActive;
    }

    match signal.direction {
        Direction::Long => {
            if candle.low <= sl {
                return LifecycleOutcome::HitSl;
            }
            if candle.high >= tp {
                return LifecycleOutcome::HitTp;
            }
        }
        Direction::Short => {
            if candle.high >= sl {
                return LifecycleOutcome::HitSl;
            }
            if candle.low <= tp {
                return LifecycleOutcome::HitTp;
            }
        }
    }

    if now > signal.expires_at() {
        return LifecycleOutcome::Expired;
    }

    LifecycleOutcome::StillActive
}

/// Evaluate and persist the transition if one applies. Returns the outcome
/// so the caller can fan out a `signal_closed` event.
pub async fn apply(
    repo: &dyn Repository,
    signal: &Signal,
    candle: &Candle,
    now: DateTime<Utc>,
) -> Result<LifecycleOutcome> {
    let outcome = evaluate(signal, candle, now);

    if let Some(status) = outcome.terminal_status() {
        transition_with_retry(repo, &signal.id, SignalStatus::Active, status).await?;
        info!(
            id = %signal.id,
            symbol = %signal.symbol,
            timeframe = %signal.timeframe,
            status = %status,
            "signal closed"
        );
    }

    Ok(outcome)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{new_id, MarketKind, Timeframe, TradingStyle};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn signal(direction: Direction) -> Signal {
        let (sl, tp) = match direction {
            Direction::Long => (dec!(95), dec!(110)),
            Direction::Short => (dec!(105), dec!(90)),
        };
        Signal {
            id: new_id(),
            symbol: "BTCUSDT".into(),
            market: MarketKind::Spot,
            direction,
            timeframe: Timeframe::H1,
            entry_price: dec!(100),
            stop_loss: sl,
            take_profit: tp,
            confidence: 0.8,
            status: SignalStatus::Active,
            trading_style: TradingStyle::Day,
            estimated_duration_hours: 6.0,
            leverage: 1,
            risk_reward: 2.0,
            description: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn candle(high: f64, low: f64) -> Candle {
        let t = Utc::now();
        Candle {
            open_time: t,
            close_time: t + Duration::seconds(3599),
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 1.0,
        }
    }

    #[test]
    fn long_tp_hit_on_high() {
        let sig = signal(Direction::Long);
        let out = evaluate(&sig, &candle(111.0, 100.0), Utc::now());
        assert_eq!(out, LifecycleOutcome::HitTp);
    }

    #[test]
    fn long_tp_exact_touch_counts() {
        let sig = signal(Direction::Long);
        let out = evaluate(&sig, &candle(110.0, 100.0), Utc::now());
        assert_eq!(out, LifecycleOutcome::HitTp);
    }

    #[test]
    fn long_sl_hit_on_low() {
        let sig = signal(Direction::Long);
        let out = evaluate(&sig, &candle(105.0, 94.0), Utc::now());
        assert_eq!(out, LifecycleOutcome::HitSl);
    }

    #[test]
    fn same_bar_both_levels_is_adverse() {
        // Candle range covers both SL and TP: the adverse fill (SL) wins.
        let sig = signal(Direction::Long);
        let out = evaluate(&sig, &candle(112.0, 94.0), Utc::now());
        assert_eq!(out, LifecycleOutcome::HitSl);

        let sig = signal(Direction::Short);
        let out = evaluate(&sig, &candle(106.0, 89.0), Utc::now());
        assert_eq!(out, LifecycleOutcome::HitSl);
    }

    #[test]
    fn short_tp_on_low_sl_on_high() {
        let sig = signal(Direction::Short);
        assert_eq!(
            evaluate(&sig, &candle(100.0, 89.5), Utc::now()),
            LifecycleOutcome::HitTp
        );
        assert_eq!(
            evaluate(&sig, &candle(105.5, 98.0), Utc::now()),
            LifecycleOutcome::HitSl
        );
    }

    #[test]
    fn expiry_after_ten_periods() {
        let sig = signal(Direction::Long);
        let quiet = candle(102.0, 99.0);

        // Within the bound: still active.
        let now = sig.created_at + Duration::hours(9);
        assert_eq!(evaluate(&sig, &quiet, now), LifecycleOutcome::StillActive);

        // Past 10 x 1h with neither level hit: expired.
        let now = sig.created_at + Duration::hours(10) + Duration::seconds(1);
        assert_eq!(evaluate(&sig, &quiet, now), LifecycleOutcome::Expired);
    }

    #[test]
    fn hit_beats_expiry() {
        let sig = signal(Direction::Long);
        let now = sig.created_at + Duration::hours(11);
        assert_eq!(
            evaluate(&sig, &candle(111.0, 100.0), now),
            LifecycleOutcome::HitTp
        );
    }

    #[tokio::test]
    async fn apply_persists_terminal_transition() {
        use crate::persistence::MemoryRepository;
        let repo = MemoryRepository::new();
        let sig = signal(Direction::Long);
        repo.insert_signal(&sig).await.unwrap();

        let out = apply(&repo, &sig, &candle(111.0, 100.0), Utc::now())
            .await
            .unwrap();
        assert_eq!(out, LifecycleOutcome::HitTp);
        assert_eq!(
            repo.get_signal(&sig.id).await.unwrap().unwrap().status,
            SignalStatus::HitTp
        );
    }
}
