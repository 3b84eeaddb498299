// =============================================================================
// Backtest Executor — historical replay through the signal engine
// =============================================================================
//
// Pipeline per run:
//   1. Load candles per symbol from the repository, falling back to the CSV
//      cache; fewer than 50 candles or malformed data fails the run.
//   2. Walk candles in time order. Each step feeds the rolling 200-candle
//      window to the signal engine's pure detection path — de-duplication
//      is bypassed; one simulated trade per symbol may be open at a time.
//      Volatility-aware overrides are forced OFF regardless of the stored
//      run config so the run's parameters are respected.
//   3. A trade's outcome comes from scanning forward: TP before SL wins,
//      SL wins when both levels sit inside the same bar (adverse fill),
//      EXPIRED after 10 candles with neither hit (exit at that close).
//   4. Aggregate metrics, persist per-trade records, COMPLETE the run.
//
// Failures (bad data, timeout, unexpected errors) transition the run to
// FAILED with a message; partial results are discarded. Identical inputs
// produce bit-identical outputs.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::market_data::{validate_series, Candle};
use crate::persistence::{MemoryRepository, Repository};
use crate::signal::SignalEngine;
use crate::types::{
    BacktestRun, BacktestStatus, BacktestTrade, Direction, PositionSizing, Signal,
};

use super::metrics::compute_metrics;

/// Rolling window fed to the engine at each step.
const WINDOW: usize = 200;
/// Minimum candles a symbol needs before the run is viable.
const MIN_CANDLES: usize = 50;
/// Candles a simulated trade may stay open before it expires.
const EXPIRY_CANDLES: usize = 10;

pub struct BacktestExecutor {
    repo: Arc<dyn Repository>,
    /// Directory holding `<SYMBOL>_<timeframe>.csv` candle files.
    cache_dir: Option<PathBuf>,
    timeout: std::time::Duration,
}

impl BacktestExecutor {
    pub fn new(
        repo: Arc<dyn Repository>,
        cache_dir: Option<PathBuf>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            repo,
            cache_dir,
            timeout,
        }
    }

    // -------------------------------------------------------------------------
    // Run entry point
    // -------------------------------------------------------------------------

    /// Execute a PENDING run to completion (or failure). Returns the final
    /// run record.
    pub async fn execute(&self, run_id: &str) -> Result<BacktestRun> {
        let mut run = self
            .repo
            .get_backtest_run(run_id)
            .await?
            .ok_or_else(|| EngineError::Persistence(format!("unknown backtest run {run_id}")))?;

        run.status = BacktestStatus::Running;
        self.repo.update_backtest_run(&run).await?;
        info!(run_id, name = %run.name, symbols = ?run.symbols, "backtest started");

        let outcome = tokio::time::timeout(self.timeout, self.run_body(&run)).await;

        match outcome {
            Ok(Ok((trades, metrics))) => {
                self.repo.insert_backtest_trades(&trades).await?;
                run.status = BacktestStatus::Completed;
                run.metrics = Some(metrics);
                run.error = None;
                self.repo.update_backtest_run(&run).await?;
                info!(
                    run_id,
                    trades = trades.len(),
                    "backtest completed"
                );
            }
            Ok(Err(e)) => {
                run.status = BacktestStatus::Failed;
                run.error = Some(e.to_string());
                self.repo.update_backtest_run(&run).await?;
                warn!(run_id, error = %e, "backtest failed");
            }
            Err(_) => {
                run.status = BacktestStatus::Failed;
                run.error = Some(format!(
                    "backtest exceeded the {} s timeout",
                    self.timeout.as_secs()
                ));
                self.repo.update_backtest_run(&run).await?;
                warn!(run_id, "backtest timed out");
            }
        }

        Ok(run)
    }

    async fn run_body(
        &self,
        run: &BacktestRun,
    ) -> Result<(Vec<BacktestTrade>, crate::types::BacktestMetrics)> {
        // The run's parameters rule: volatility-aware overrides are forced
        // off for the whole replay.
        let mut config = run.engine_config.clone();
        config.use_volatility_aware = false;
        let engine = SignalEngine::new(config, Arc::new(MemoryRepository::new()))?;

        let mut all_trades: Vec<BacktestTrade> = Vec::new();
        // Percent sizing compounds over realised P/L, in trade order.
        let mut equity = run.initial_capital;

        for symbol in &run.symbols {
            let candles = self.load_symbol_candles(run, symbol).await?;
            let trades =
                simulate_symbol(&engine, run, symbol, &candles, run.initial_capital, &mut equity)?;
            all_trades.extend(trades);
        }

        all_trades.sort_by_key(|t| t.entry_time);
        let metrics = compute_metrics(&all_trades, run.initial_capital);
        Ok((all_trades, metrics))
    }

    // -------------------------------------------------------------------------
    // Candle loading
    // -------------------------------------------------------------------------

    async fn load_symbol_candles(&self, run: &BacktestRun, symbol: &str) -> Result<Vec<Candle>> {
        let mut candles = self
            .repo
            .load_candles(symbol, run.market, run.timeframe, run.start, run.end)
            .await?;

        if candles.is_empty() {
            if let Some(dir) = &self.cache_dir {
                let path = dir.join(format!("{symbol}_{}.csv", run.timeframe.as_str()));
                if path.exists() {
                    candles = load_csv_candles(&path)?
                        .into_iter()
                        .filter(|c| c.open_time >= run.start && c.open_time <= run.end)
                        .collect();
                }
            }
        }

        if candles.len() < MIN_CANDLES {
            return Err(EngineError::InsufficientData {
                have: candles.len(),
                need: MIN_CANDLES,
            });
        }
        if let Err(index) = validate_series(&candles) {
            return Err(EngineError::Persistence(format!(
                "malformed candle data for {symbol} at index {index}"
            )));
        }

        Ok(candles)
    }
}

// =============================================================================
// Simulation core (pure; separated for testability)
// =============================================================================

/// Walk one symbol's candles and simulate every emitted signal. At most one
/// simulated trade per symbol is open at a time; while it is open, new
/// detections for the symbol are skipped.
fn simulate_symbol(
    engine: &SignalEngine,
    run: &BacktestRun,
    symbol: &str,
    candles: &[Candle],
    initial_capital: Decimal,
    equity: &mut Decimal,
) -> Result<Vec<BacktestTrade>> {
    let mut trades = Vec::new();
    let mut i = crate::indicators::MIN_CANDLES.saturating_sub(1);

    while i < candles.len() {
        let window_start = (i + 1).saturating_sub(WINDOW);
        let window = &candles[window_start..=i];
        let now = candles[i].close_time;

        let Some((signal, _breakdown)) =
            engine.detect(symbol, run.market, run.timeframe, window, now)
        else {
            i += 1;
            continue;
        };

        let size = trade_size(&run.sizing, initial_capital, *equity);
        if size <= Decimal::ZERO {
            i += 1;
            continue;
        }

        let (trade, resolution_index) = resolve_trade(run, &signal, candles, i, size);
        *equity += trade.pnl;
        trades.push(trade);

        // The position occupies the symbol until it resolves.
        i = resolution_index + 1;
    }

    Ok(trades)
}

/// Quote size for one simulated trade under the run's sizing rule.
fn trade_size(sizing: &PositionSizing, initial_capital: Decimal, equity: Decimal) -> Decimal {
    match sizing {
        PositionSizing::Fixed(amount) => *amount,
        PositionSizing::Percent(pct) => {
            let fraction = Decimal::from_f64_retain(pct / 100.0).unwrap_or(Decimal::ZERO);
            (equity * fraction).round_dp(8)
        }
        // Kelly needs live account history; in a replay it degrades to 1 %
        // of initial capital.
        PositionSizing::Kelly => (initial_capital * Decimal::new(1, 2)).round_dp(8),
    }
}

/// Scan forward from `entry_index` and settle the trade.
///
/// Returns the trade plus the candle index at which it resolved.
fn resolve_trade(
    run: &BacktestRun,
    signal: &Signal,
    candles: &[Candle],
    entry_index: usize,
    size: Decimal,
) -> (BacktestTrade, usize) {
    let tp = signal.take_profit.to_f64().unwrap_or(f64::NAN);
    let sl = signal.stop_loss.to_f64().unwrap_or(f64::NAN);
    let long = signal.direction == Direction::Long;

    let last_scan = (entry_index + EXPIRY_CANDLES).min(candles.len() - 1);

    let mut exit: Option<(usize, Decimal, &'static str)> = None;
    for (j, candle) in candles
        .iter()
        .enumerate()
        .take(last_scan + 1)
        .skip(entry_index + 1)
    {
        let sl_hit = if long { candle.low <= sl } else { candle.high >= sl };
        let tp_hit = if long { candle.high >= tp } else { candle.low <= tp };

        // Both levels inside one bar: assume the adverse fill.
        if sl_hit {
            exit = Some((j, signal.stop_loss, "SL"));
            break;
        }
        if tp_hit {
            exit = Some((j, signal.take_profit, "TP"));
            break;
        }
    }

    let (exit_index, exit_price, reason) = exit.unwrap_or_else(|| {
        let close = crate::signal::engine::decimal_price(candles[last_scan].close);
        (last_scan, close, "EXPIRED")
    });

    let pnl = if signal.entry_price.is_zero() {
        Decimal::ZERO
    } else {
        (exit_price - signal.entry_price) * signal.direction.sign() * size
            * Decimal::from(signal.leverage)
            / signal.entry_price
    };

    let trade = BacktestTrade {
        run_id: run.id.clone(),
        symbol: signal.symbol.clone(),
        direction: signal.direction,
        entry_time: candles[entry_index].close_time,
        exit_time: candles[exit_index].close_time,
        entry_price: signal.entry_price,
        exit_price,
        size,
        pnl: pnl.round_dp(8),
        exit_reason: reason.to_string(),
        confidence: signal.confidence,
    };

    (trade, exit_index)
}

// =============================================================================
// CSV candle cache
// =============================================================================

#[derive(Debug, Deserialize)]
struct CsvCandle {
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    close_time: i64,
}

/// Load a cached candle file: header row, millisecond epoch timestamps.
fn load_csv_candles(path: &std::path::Path) -> Result<Vec<Candle>> {
    use chrono::TimeZone;

    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| EngineError::Persistence(format!("cannot open {}: {e}", path.display())))?;

    let mut candles = Vec::new();
    for record in reader.deserialize::<CsvCandle>() {
        let row =
            record.map_err(|e| EngineError::Persistence(format!("bad CSV row: {e}")))?;
        let open_time = chrono::Utc
            .timestamp_millis_opt(row.open_time)
            .single()
            .ok_or_else(|| {
                EngineError::Persistence(format!("bad open_time {}", row.open_time))
            })?;
        let close_time = chrono::Utc
            .timestamp_millis_opt(row.close_time)
            .single()
            .ok_or_else(|| {
                EngineError::Persistence(format!("bad close_time {}", row.close_time))
            })?;
        candles.push(Candle {
            open_time,
            close_time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }

    Ok(candles)
}
