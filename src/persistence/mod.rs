// =============================================================================
// Persistence — repository seam over the relational store
// =============================================================================
//
// The repository trait is the engine's only point of contact with storage.
// Entities are plain records (src/types.rs); every state transition goes
// through a manager component and lands here as a guarded update:
//
//   - signal transitions:   WHERE status = expected_old (optimistic)
//   - trade close:          conditional update + balance delta in one
//                           transaction
//   - account balance:      serialised per account
// =============================================================================

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::error::Result;
use crate::market_data::Candle;
use crate::types::{
    BacktestRun, BacktestStatus, BacktestTrade, Direction, MarketKind, PaperAccount, PaperTrade,
    Signal, SignalStatus, SymbolRecord, Timeframe, TradeStatus,
};

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

/// Filter for active-signal queries. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ActiveSignalFilter {
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
    pub market: Option<MarketKind>,
    pub timeframe: Option<Timeframe>,
}

/// Exit parameters for a trade close. Applied together with the account
/// balance delta in a single transaction.
#[derive(Debug, Clone)]
pub struct TradeExit {
    pub exit_price: Decimal,
    pub exit_time: DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub status: TradeStatus,
    pub close_reason: String,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // ── Symbols ─────────────────────────────────────────────────────────

    /// Insert or update a symbol keyed on (name, market). Idempotent.
    async fn upsert_symbol(&self, symbol: &SymbolRecord) -> Result<()>;

    async fn list_active_symbols(&self, market: MarketKind) -> Result<Vec<SymbolRecord>>;

    /// Refresh the cached 24 h quote volume used for scan ordering.
    async fn update_symbol_volume(
        &self,
        name: &str,
        market: MarketKind,
        quote_volume: f64,
    ) -> Result<()>;

    // ── Signals ─────────────────────────────────────────────────────────

    async fn insert_signal(&self, signal: &Signal) -> Result<()>;

    async fn get_signal(&self, id: &str) -> Result<Option<Signal>>;

    /// Guarded status transition: fails with `ConcurrentUpdate` when the
    /// stored status is not `expected_old`.
    async fn update_signal_status(
        &self,
        id: &str,
        expected_old: SignalStatus,
        new: SignalStatus,
    ) -> Result<()>;

    /// Refresh the derived entry price of an ACTIVE signal.
    async fn update_signal_entry(&self, id: &str, entry: Decimal) -> Result<()>;

    async fn list_active_signals(&self, filter: &ActiveSignalFilter) -> Result<Vec<Signal>>;

    /// Find an ACTIVE duplicate: same (symbol, direction, timeframe, market),
    /// created within `window` of `now`, entry within ±1 % of `entry`.
    async fn find_dup_signal(
        &self,
        symbol: &str,
        direction: Direction,
        timeframe: Timeframe,
        market: MarketKind,
        entry: Decimal,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Signal>>;

    // ── Paper trades ────────────────────────────────────────────────────

    async fn insert_trade(&self, trade: &PaperTrade) -> Result<()>;

    async fn get_trade(&self, id: &str) -> Result<Option<PaperTrade>>;

    /// All OPEN trades, across accounts.
    async fn list_open_trades(&self) -> Result<Vec<PaperTrade>>;

    async fn count_open_trades(&self, account_id: &str) -> Result<u32>;

    /// Most recent closed trades for an account, newest first.
    async fn list_closed_trades(&self, account_id: &str, limit: usize) -> Result<Vec<PaperTrade>>;

    /// Close a trade: guarded status transition from `expected_old` plus the
    /// account balance adjustment, atomically. Fails with
    /// `ConcurrentUpdate` when the trade already left `expected_old`.
    async fn update_trade_close(
        &self,
        id: &str,
        expected_old: TradeStatus,
        exit: &TradeExit,
    ) -> Result<()>;

    /// Cancel a PENDING trade. Fails with `ConcurrentUpdate` otherwise.
    async fn cancel_trade(&self, id: &str) -> Result<()>;

    // ── Accounts ────────────────────────────────────────────────────────

    async fn insert_account(&self, account: &PaperAccount) -> Result<()>;

    async fn get_account(&self, id: &str) -> Result<Option<PaperAccount>>;

    async fn get_account_by_name(&self, name: &str) -> Result<Option<PaperAccount>>;

    async fn list_accounts(&self) -> Result<Vec<PaperAccount>>;

    /// Overwrite an account's configurable fields (admin surface).
    async fn update_account(&self, account: &PaperAccount) -> Result<()>;

    async fn adjust_account_balance(&self, id: &str, delta: Decimal) -> Result<()>;

    // ── Backtests ───────────────────────────────────────────────────────

    async fn insert_backtest_run(&self, run: &BacktestRun) -> Result<()>;

    async fn get_backtest_run(&self, id: &str) -> Result<Option<BacktestRun>>;

    /// Runs in a given state, oldest first (the backtest worker drains
    /// PENDING in submission order).
    async fn list_backtest_runs(&self, status: BacktestStatus) -> Result<Vec<BacktestRun>>;

    async fn update_backtest_run(&self, run: &BacktestRun) -> Result<()>;

    async fn insert_backtest_trades(&self, trades: &[BacktestTrade]) -> Result<()>;

    async fn list_backtest_trades(&self, run_id: &str) -> Result<Vec<BacktestTrade>>;

    // ── Candles (backtest storage) ──────────────────────────────────────

    async fn store_candles(
        &self,
        symbol: &str,
        market: MarketKind,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<()>;

    async fn load_candles(
        &self,
        symbol: &str,
        market: MarketKind,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;
}

/// Whether two entry prices are within ±1 % of each other — the dedup
/// proximity rule shared by both repository implementations.
pub fn entries_within_one_percent(a: Decimal, b: Decimal) -> bool {
    if b.is_zero() {
        return a.is_zero();
    }
    let diff = (a - b).abs();
    diff * Decimal::ONE_HUNDRED <= b.abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn one_percent_proximity() {
        assert!(entries_within_one_percent(dec!(100.0), dec!(100.0)));
        assert!(entries_within_one_percent(dec!(100.9), dec!(100.0)));
        assert!(entries_within_one_percent(dec!(99.1), dec!(100.0)));
        assert!(!entries_within_one_percent(dec!(101.5), dec!(100.0)));
        assert!(!entries_within_one_percent(dec!(98.4), dec!(100.0)));
    }

    #[test]
    fn zero_reference_price() {
        assert!(entries_within_one_percent(dec!(0), dec!(0)));
        assert!(!entries_within_one_percent(dec!(1), dec!(0)));
    }
}
