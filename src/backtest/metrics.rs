// =============================================================================
// Backtest metrics — aggregate statistics over simulated trades
// =============================================================================
//
//   win rate       winning / total
//   ROI            total P/L / initial capital
//   profit factor  sum(profits) / |sum(losses)|; infinity with no losses,
//                  0 with no profits
//   max drawdown   largest peak-to-trough relative decline of the equity
//                  curve (initial capital + cumulative P/L, in trade order)
//   Sharpe         mean trade return / stdev, annualised by sqrt of the
//                  trade frequency per year
// =============================================================================

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::types::{BacktestMetrics, BacktestTrade};

const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0;

/// Compute the full metric block. Trades are taken in the given order for
/// the equity curve (callers pass them entry-time ordered).
pub fn compute_metrics(trades: &[BacktestTrade], initial_capital: Decimal) -> BacktestMetrics {
    let total_trades = trades.len() as u32;
    let winning = trades
        .iter()
        .filter(|t| t.pnl > Decimal::ZERO)
        .count() as u32;
    let losing = trades
        .iter()
        .filter(|t| t.pnl < Decimal::ZERO)
        .count() as u32;

    let win_rate = if total_trades > 0 {
        winning as f64 / total_trades as f64
    } else {
        0.0
    };

    let total_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
    let roi = if initial_capital > Decimal::ZERO {
        (total_pnl / initial_capital).to_f64().unwrap_or(0.0)
    } else {
        0.0
    };

    let gross_profit: Decimal = trades
        .iter()
        .map(|t| t.pnl)
        .filter(|p| *p > Decimal::ZERO)
        .sum();
    let gross_loss: Decimal = trades
        .iter()
        .map(|t| t.pnl)
        .filter(|p| *p < Decimal::ZERO)
        .map(|p| p.abs())
        .sum();

    let profit_factor = if gross_loss > Decimal::ZERO {
        (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
    } else if gross_profit > Decimal::ZERO {
        f64::INFINITY
    } else {
        0.0
    };

    BacktestMetrics {
        total_trades,
        winning_trades: winning,
        losing_trades: losing,
        win_rate,
        total_pnl,
        roi,
        profit_factor,
        max_drawdown: max_drawdown(trades, initial_capital),
        sharpe_ratio: sharpe_ratio(trades, initial_capital),
    }
}

/// Largest relative peak-to-trough decline of the equity curve.
fn max_drawdown(trades: &[BacktestTrade], initial_capital: Decimal) -> f64 {
    let mut equity = initial_capital.to_f64().unwrap_or(0.0);
    let mut peak = equity;
    let mut worst = 0.0_f64;

    for trade in trades {
        equity += trade.pnl.to_f64().unwrap_or(0.0);
        if equity > peak {
            peak = equity;
        } else if peak > 0.0 {
            let drawdown = (peak - equity) / peak;
            if drawdown > worst {
                worst = drawdown;
            }
        }
    }

    worst
}

/// Mean / stdev of per-trade returns, annualised by the observed trade
/// frequency. Zero when the return series is flat or too short.
fn sharpe_ratio(trades: &[BacktestTrade], initial_capital: Decimal) -> f64 {
    if trades.len() < 2 {
        return 0.0;
    }
    let capital = initial_capital.to_f64().unwrap_or(0.0);
    if capital <= 0.0 {
        return 0.0;
    }

    let returns: Vec<f64> = trades
        .iter()
        .map(|t| t.pnl.to_f64().unwrap_or(0.0) / capital)
        .collect();

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let stdev = variance.sqrt();
    if stdev == 0.0 || !stdev.is_finite() {
        return 0.0;
    }

    // Annualise by the realised trade frequency over the tested span.
    let (Some(first), Some(last)) = (
        trades.iter().map(|t| t.entry_time).min(),
        trades.iter().map(|t| t.exit_time).max(),
    ) else {
        return 0.0;
    };
    let span_secs = (last - first).num_seconds().max(1) as f64;
    let trades_per_year = n * SECONDS_PER_YEAR / span_secs;

    (mean / stdev) * trades_per_year.sqrt()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn trade(i: i64, pnl: Decimal) -> BacktestTrade {
        let entry = Utc.timestamp_opt(1_700_000_000 + i * 86_400, 0).unwrap();
        BacktestTrade {
            run_id: "run".into(),
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            entry_time: entry,
            exit_time: entry + Duration::hours(12),
            entry_price: dec!(100),
            exit_price: dec!(100) + pnl / dec!(1),
            size: dec!(100),
            pnl,
            exit_reason: "TP".into(),
            confidence: 0.8,
        }
    }

    #[test]
    fn empty_trades_yield_zeroed_metrics() {
        let m = compute_metrics(&[], dec!(10000));
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.win_rate, 0.0);
        assert_eq!(m.profit_factor, 0.0);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.sharpe_ratio, 0.0);
    }

    #[test]
    fn counts_and_win_rate() {
        let trades = vec![
            trade(0, dec!(10)),
            trade(1, dec!(-5)),
            trade(2, dec!(20)),
            trade(3, dec!(-5)),
        ];
        let m = compute_metrics(&trades, dec!(10000));
        assert_eq!(m.total_trades, 4);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 2);
        assert!((m.win_rate - 0.5).abs() < 1e-12);
        assert_eq!(m.total_pnl, dec!(20));
        assert!((m.roi - 0.002).abs() < 1e-12);
    }

    #[test]
    fn profit_factor_conventions() {
        // Mixed: 30 profit / 10 loss = 3.
        let m = compute_metrics(
            &[trade(0, dec!(30)), trade(1, dec!(-10))],
            dec!(10000),
        );
        assert!((m.profit_factor - 3.0).abs() < 1e-12);

        // No losses: infinity.
        let m = compute_metrics(&[trade(0, dec!(30))], dec!(10000));
        assert!(m.profit_factor.is_infinite());

        // No profits: zero.
        let m = compute_metrics(&[trade(0, dec!(-30))], dec!(10000));
        assert_eq!(m.profit_factor, 0.0);
    }

    #[test]
    fn drawdown_peak_to_trough() {
        // Equity: 10000 -> 10100 (peak) -> 9900 -> 10000.
        // Drawdown = (10100 - 9900) / 10100.
        let trades = vec![
            trade(0, dec!(100)),
            trade(1, dec!(-200)),
            trade(2, dec!(100)),
        ];
        let m = compute_metrics(&trades, dec!(10000));
        let expected = 200.0 / 10100.0;
        assert!((m.max_drawdown - expected).abs() < 1e-12);
    }

    #[test]
    fn drawdown_zero_when_monotonic() {
        let trades = vec![trade(0, dec!(10)), trade(1, dec!(20))];
        let m = compute_metrics(&trades, dec!(10000));
        assert_eq!(m.max_drawdown, 0.0);
    }

    #[test]
    fn sharpe_zero_on_flat_returns() {
        let trades = vec![trade(0, dec!(10)), trade(1, dec!(10))];
        let m = compute_metrics(&trades, dec!(10000));
        assert_eq!(m.sharpe_ratio, 0.0);
    }

    #[test]
    fn sharpe_sign_follows_mean() {
        let losing = vec![trade(0, dec!(-10)), trade(1, dec!(-20)), trade(2, dec!(-5))];
        let m = compute_metrics(&losing, dec!(10000));
        assert!(m.sharpe_ratio < 0.0);

        let winning = vec![trade(0, dec!(10)), trade(1, dec!(20)), trade(2, dec!(5))];
        let m = compute_metrics(&winning, dec!(10000));
        assert!(m.sharpe_ratio > 0.0);
    }

    #[test]
    fn metrics_are_deterministic() {
        let trades = vec![trade(0, dec!(12)), trade(1, dec!(-7)), trade(2, dec!(3))];
        let a = compute_metrics(&trades, dec!(10000));
        let b = compute_metrics(&trades, dec!(10000));
        assert_eq!(a, b);
        assert_eq!(a.sharpe_ratio.to_bits(), b.sharpe_ratio.to_bits());
    }
}
