// =============================================================================
// Position sizing — FIXED / PERCENT / KELLY
// =============================================================================
//
// Sizes are quote-currency notionals, always capped at the account's
// current balance. Kelly uses f = W - (1 - W) / R over the account's recent
// closed trades, clamped to at most 5 % of balance; an account without
// enough history falls back to 1 %.
// =============================================================================

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::types::{PaperAccount, PaperTrade, PositionSizing};

/// Closed trades consulted for the Kelly estimate.
const KELLY_LOOKBACK: usize = 20;
/// Minimum history before Kelly is trusted.
const KELLY_MIN_TRADES: usize = 5;
/// Kelly cap as a fraction of balance.
const KELLY_CAP: f64 = 0.05;
/// Fallback fraction when history is too thin or Kelly is non-positive.
const KELLY_FLOOR: f64 = 0.01;

/// Quote-currency size for a new trade on `account`, given its recent
/// closed trades (newest first, used only by KELLY).
pub fn position_size(account: &PaperAccount, recent_closed: &[PaperTrade]) -> Decimal {
    let balance = account.current_balance;
    if balance <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let size = match &account.sizing {
        PositionSizing::Fixed(amount) => *amount,
        PositionSizing::Percent(pct) => {
            let fraction = Decimal::from_f64_retain(pct / 100.0).unwrap_or(Decimal::ZERO);
            (balance * fraction).round_dp(8)
        }
        PositionSizing::Kelly => {
            let fraction = kelly_fraction(recent_closed);
            (balance * Decimal::from_f64_retain(fraction).unwrap_or(Decimal::ZERO)).round_dp(8)
        }
    };

    size.min(balance).max(Decimal::ZERO)
}

/// Kelly fraction from recent closed trades: f = W - (1 - W) / R with
/// R = average win / average loss. Clamped to [KELLY_FLOOR, KELLY_CAP].
fn kelly_fraction(recent_closed: &[PaperTrade]) -> f64 {
    let sample: Vec<f64> = recent_closed
        .iter()
        .take(KELLY_LOOKBACK)
        .filter_map(|t| t.realized_pnl)
        .filter_map(|p| p.to_f64())
        .collect();

    if sample.len() < KELLY_MIN_TRADES {
        return KELLY_FLOOR;
    }

    let wins: Vec<f64> = sample.iter().copied().filter(|&p| p > 0.0).collect();
    let losses: Vec<f64> = sample.iter().copied().filter(|&p| p < 0.0).collect();

    if losses.is_empty() {
        // Undefeated history: bet the cap.
        return KELLY_CAP;
    }
    if wins.is_empty() {
        return KELLY_FLOOR;
    }

    let win_rate = wins.len() as f64 / sample.len() as f64;
    let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
    let avg_loss = losses.iter().map(|p| p.abs()).sum::<f64>() / losses.len() as f64;
    if avg_loss <= 0.0 {
        return KELLY_CAP;
    }

    let r = avg_win / avg_loss;
    let f = win_rate - (1.0 - win_rate) / r;
    f.clamp(KELLY_FLOOR, KELLY_CAP)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{new_id, Direction, MarketKind, TradeStatus};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn account(sizing: PositionSizing, balance: Decimal) -> PaperAccount {
        PaperAccount {
            id: new_id(),
            name: "a".into(),
            initial_balance: balance,
            current_balance: balance,
            max_open_trades: 10,
            min_confidence: 0.7,
            auto_trading: true,
            sizing,
        }
    }

    fn closed_trade(pnl: Decimal) -> PaperTrade {
        PaperTrade {
            id: new_id(),
            account_id: "a".into(),
            signal_id: None,
            symbol: "BTCUSDT".into(),
            market: MarketKind::Spot,
            direction: Direction::Long,
            entry_price: dec!(100),
            stop_loss: dec!(95),
            take_profit: dec!(110),
            size: dec!(100),
            leverage: 1,
            status: if pnl >= Decimal::ZERO {
                TradeStatus::ClosedTp
            } else {
                TradeStatus::ClosedSl
            },
            entry_time: Some(Utc::now()),
            exit_time: Some(Utc::now()),
            exit_price: Some(dec!(100)),
            realized_pnl: Some(pnl),
            unrealized_pnl: Decimal::ZERO,
            close_reason: None,
        }
    }

    #[test]
    fn fixed_size_is_constant() {
        let acct = account(PositionSizing::Fixed(dec!(100)), dec!(10000));
        assert_eq!(position_size(&acct, &[]), dec!(100));
    }

    #[test]
    fn fixed_size_capped_at_balance() {
        let acct = account(PositionSizing::Fixed(dec!(100)), dec!(40));
        assert_eq!(position_size(&acct, &[]), dec!(40));
    }

    #[test]
    fn percent_size_tracks_balance() {
        let acct = account(PositionSizing::Percent(2.0), dec!(10000));
        assert_eq!(position_size(&acct, &[]), dec!(200));
    }

    #[test]
    fn zero_balance_yields_zero() {
        let acct = account(PositionSizing::Percent(2.0), Decimal::ZERO);
        assert_eq!(position_size(&acct, &[]), Decimal::ZERO);
    }

    #[test]
    fn kelly_without_history_uses_floor() {
        let acct = account(PositionSizing::Kelly, dec!(10000));
        // 1 % floor of 10 000.
        assert_eq!(position_size(&acct, &[]), dec!(100));
    }

    #[test]
    fn kelly_capped_at_five_percent() {
        let acct = account(PositionSizing::Kelly, dec!(10000));
        // Overwhelmingly winning history drives raw Kelly above the cap.
        let trades: Vec<PaperTrade> = (0..10)
            .map(|i| closed_trade(if i == 0 { dec!(-1) } else { dec!(50) }))
            .collect();
        assert_eq!(position_size(&acct, &trades), dec!(500));
    }

    #[test]
    fn kelly_losing_history_stays_at_floor() {
        let acct = account(PositionSizing::Kelly, dec!(10000));
        let trades: Vec<PaperTrade> = (0..10).map(|_| closed_trade(dec!(-10))).collect();
        assert_eq!(position_size(&acct, &trades), dec!(100));
    }
}
