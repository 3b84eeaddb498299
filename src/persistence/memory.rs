// =============================================================================
// In-memory repository — test double and DB-less operation
// =============================================================================
//
// Same contract as the SQLite implementation, backed by RwLock'd maps.
// Guarded transitions are enforced under the write lock, so the optimistic
// semantics match the relational `WHERE status = expected_old` form.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::error::{EngineError, Result};
use crate::market_data::Candle;
use crate::types::{
    BacktestRun, BacktestStatus, BacktestTrade, Direction, MarketKind, PaperAccount, PaperTrade,
    Signal, SignalStatus, SymbolRecord, Timeframe, TradeStatus,
};

use super::{entries_within_one_percent, ActiveSignalFilter, Repository, TradeExit};

#[derive(Default)]
struct Inner {
    symbols: HashMap<(String, MarketKind), SymbolRecord>,
    signals: HashMap<String, Signal>,
    trades: HashMap<String, PaperTrade>,
    accounts: HashMap<String, PaperAccount>,
    runs: HashMap<String, BacktestRun>,
    backtest_trades: Vec<BacktestTrade>,
    candles: HashMap<(String, MarketKind, Timeframe), Vec<Candle>>,
}

/// Repository backed by process memory. Contents die with the process.
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    // ── Symbols ─────────────────────────────────────────────────────────

    async fn upsert_symbol(&self, symbol: &SymbolRecord) -> Result<()> {
        let mut inner = self.inner.write();
        let key = (symbol.name.clone(), symbol.market);
        match inner.symbols.get_mut(&key) {
            Some(existing) => {
                existing.active = symbol.active;
                existing.exchange = symbol.exchange.clone();
            }
            None => {
                inner.symbols.insert(key, symbol.clone());
            }
        }
        Ok(())
    }

    async fn list_active_symbols(&self, market: MarketKind) -> Result<Vec<SymbolRecord>> {
        let inner = self.inner.read();
        let mut out: Vec<SymbolRecord> = inner
            .symbols
            .values()
            .filter(|s| s.market == market && s.active)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.quote_volume_24h
                .partial_cmp(&a.quote_volume_24h)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(out)
    }

    async fn update_symbol_volume(
        &self,
        name: &str,
        market: MarketKind,
        quote_volume: f64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(s) = inner.symbols.get_mut(&(name.to_string(), market)) {
            s.quote_volume_24h = quote_volume;
        }
        Ok(())
    }

    // ── Signals ─────────────────────────────────────────────────────────

    async fn insert_signal(&self, signal: &Signal) -> Result<()> {
        self.inner
            .write()
            .signals
            .insert(signal.id.clone(), signal.clone());
        Ok(())
    }

    async fn get_signal(&self, id: &str) -> Result<Option<Signal>> {
        Ok(self.inner.read().signals.get(id).cloned())
    }

    async fn update_signal_status(
        &self,
        id: &str,
        expected_old: SignalStatus,
        new: SignalStatus,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let signal = inner
            .signals
            .get_mut(id)
            .ok_or_else(|| EngineError::ConcurrentUpdate {
                entity: "signal",
                id: id.to_string(),
            })?;
        if signal.status != expected_old {
            return Err(EngineError::ConcurrentUpdate {
                entity: "signal",
                id: id.to_string(),
            });
        }
        signal.status = new;
        signal.updated_at = Utc::now();
        Ok(())
    }

    async fn update_signal_entry(&self, id: &str, entry: Decimal) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(signal) = inner.signals.get_mut(id) {
            signal.entry_price = entry;
            signal.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_active_signals(&self, filter: &ActiveSignalFilter) -> Result<Vec<Signal>> {
        let inner = self.inner.read();
        let mut out: Vec<Signal> = inner
            .signals
            .values()
            .filter(|s| s.status == SignalStatus::Active)
            .filter(|s| filter.symbol.as_deref().map_or(true, |sym| s.symbol == sym))
            .filter(|s| filter.direction.map_or(true, |d| s.direction == d))
            .filter(|s| filter.market.map_or(true, |m| s.market == m))
            .filter(|s| filter.timeframe.map_or(true, |tf| s.timeframe == tf))
            .cloned()
            .collect();
        out.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(out)
    }

    async fn find_dup_signal(
        &self,
        symbol: &str,
        direction: Direction,
        timeframe: Timeframe,
        market: MarketKind,
        entry: Decimal,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Signal>> {
        let inner = self.inner.read();
        Ok(inner
            .signals
            .values()
            .find(|s| {
                s.status == SignalStatus::Active
                    && s.symbol == symbol
                    && s.direction == direction
                    && s.timeframe == timeframe
                    && s.market == market
                    && now - s.created_at <= window
                    && entries_within_one_percent(entry, s.entry_price)
            })
            .cloned())
    }

    // ── Paper trades ────────────────────────────────────────────────────

    async fn insert_trade(&self, trade: &PaperTrade) -> Result<()> {
        self.inner
            .write()
            .trades
            .insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    async fn get_trade(&self, id: &str) -> Result<Option<PaperTrade>> {
        Ok(self.inner.read().trades.get(id).cloned())
    }

    async fn list_open_trades(&self) -> Result<Vec<PaperTrade>> {
        Ok(self
            .inner
            .read()
            .trades
            .values()
            .filter(|t| t.status == TradeStatus::Open)
            .cloned()
            .collect())
    }

    async fn count_open_trades(&self, account_id: &str) -> Result<u32> {
        Ok(self
            .inner
            .read()
            .trades
            .values()
            .filter(|t| t.account_id == account_id && t.status == TradeStatus::Open)
            .count() as u32)
    }

    async fn list_closed_trades(&self, account_id: &str, limit: usize) -> Result<Vec<PaperTrade>> {
        let inner = self.inner.read();
        let mut out: Vec<PaperTrade> = inner
            .trades
            .values()
            .filter(|t| t.account_id == account_id && t.status.is_closed())
            .cloned()
            .collect();
        out.sort_by_key(|t| std::cmp::Reverse(t.exit_time));
        out.truncate(limit);
        Ok(out)
    }

    async fn update_trade_close(
        &self,
        id: &str,
        expected_old: TradeStatus,
        exit: &TradeExit,
    ) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let trade = inner
            .trades
            .get_mut(id)
            .ok_or_else(|| EngineError::ConcurrentUpdate {
                entity: "trade",
                id: id.to_string(),
            })?;
        if trade.status != expected_old {
            return Err(EngineError::ConcurrentUpdate {
                entity: "trade",
                id: id.to_string(),
            });
        }

        trade.status = exit.status;
        trade.exit_price = Some(exit.exit_price);
        trade.exit_time = Some(exit.exit_time);
        trade.realized_pnl = Some(exit.realized_pnl);
        trade.unrealized_pnl = Decimal::ZERO;
        trade.close_reason = Some(exit.close_reason.clone());

        // Balance applies under the same write lock — the in-memory
        // equivalent of the relational transaction.
        let account_id = trade.account_id.clone();
        if let Some(account) = inner.accounts.get_mut(&account_id) {
            account.current_balance += exit.realized_pnl;
        }
        Ok(())
    }

    async fn cancel_trade(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let trade = inner
            .trades
            .get_mut(id)
            .ok_or_else(|| EngineError::ConcurrentUpdate {
                entity: "trade",
                id: id.to_string(),
            })?;
        if trade.status != TradeStatus::Pending {
            return Err(EngineError::ConcurrentUpdate {
                entity: "trade",
                id: id.to_string(),
            });
        }
        trade.status = TradeStatus::Cancelled;
        Ok(())
    }

    // ── Accounts ────────────────────────────────────────────────────────

    async fn insert_account(&self, account: &PaperAccount) -> Result<()> {
        self.inner
            .write()
            .accounts
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<PaperAccount>> {
        Ok(self.inner.read().accounts.get(id).cloned())
    }

    async fn get_account_by_name(&self, name: &str) -> Result<Option<PaperAccount>> {
        Ok(self
            .inner
            .read()
            .accounts
            .values()
            .find(|a| a.name == name)
            .cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<PaperAccount>> {
        Ok(self.inner.read().accounts.values().cloned().collect())
    }

    async fn update_account(&self, account: &PaperAccount) -> Result<()> {
        self.inner
            .write()
            .accounts
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn adjust_account_balance(&self, id: &str, delta: Decimal) -> Result<()> {
        let mut inner = self.inner.write();
        let account = inner
            .accounts
            .get_mut(id)
            .ok_or_else(|| EngineError::Persistence(format!("unknown account {id}")))?;
        account.current_balance += delta;
        Ok(())
    }

    // ── Backtests ───────────────────────────────────────────────────────

    async fn insert_backtest_run(&self, run: &BacktestRun) -> Result<()> {
        self.inner.write().runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_backtest_run(&self, id: &str) -> Result<Option<BacktestRun>> {
        Ok(self.inner.read().runs.get(id).cloned())
    }

    async fn update_backtest_run(&self, run: &BacktestRun) -> Result<()> {
        self.inner.write().runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list_backtest_runs(&self, status: BacktestStatus) -> Result<Vec<BacktestRun>> {
        let inner = self.inner.read();
        let mut out: Vec<BacktestRun> = inner
            .runs
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn insert_backtest_trades(&self, trades: &[BacktestTrade]) -> Result<()> {
        self.inner.write().backtest_trades.extend_from_slice(trades);
        Ok(())
    }

    async fn list_backtest_trades(&self, run_id: &str) -> Result<Vec<BacktestTrade>> {
        Ok(self
            .inner
            .read()
            .backtest_trades
            .iter()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect())
    }

    // ── Candles ─────────────────────────────────────────────────────────

    async fn store_candles(
        &self,
        symbol: &str,
        market: MarketKind,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .candles
            .entry((symbol.to_string(), market, timeframe))
            .or_default();
        for candle in candles {
            match entry.binary_search_by_key(&candle.open_time, |c| c.open_time) {
                Ok(i) => entry[i] = candle.clone(),
                Err(i) => entry.insert(i, candle.clone()),
            }
        }
        Ok(())
    }

    async fn load_candles(
        &self,
        symbol: &str,
        market: MarketKind,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let inner = self.inner.read();
        Ok(inner
            .candles
            .get(&(symbol.to_string(), market, timeframe))
            .map(|series| {
                series
                    .iter()
                    .filter(|c| c.open_time >= start && c.open_time <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{new_id, PositionSizing, TradingStyle};
    use rust_decimal_macros::dec;

    fn sample_signal(symbol: &str, direction: Direction, timeframe: Timeframe) -> Signal {
        Signal {
            id: new_id(),
            symbol: symbol.into(),
            market: MarketKind::Spot,
            direction,
            timeframe,
            entry_price: dec!(100),
            stop_loss: dec!(95),
            take_profit: dec!(110),
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

    fn sample_account() -> PaperAccount {
        PaperAccount {
            id: new_id(),
            name: "test".into(),
            initial_balance: dec!(10000),
            current_balance: dec!(10000),
            max_open_trades: 10,
            min_confidence: 0.7,
            auto_trading: true,
            sizing: PositionSizing::Fixed(dec!(100)),
        }
    }

    fn sample_trade(account_id: &str, status: TradeStatus) -> PaperTrade {
        PaperTrade {
            id: new_id(),
            account_id: account_id.into(),
            signal_id: None,
            symbol: "BTCUSDT".into(),
            market: MarketKind::Spot,
            direction: Direction::Long,
            entry_price: dec!(100),
            stop_loss: dec!(95),
            take_profit: dec!(110),
            size: dec!(100),
            leverage: 1,
            status,
            entry_time: Some(Utc::now()),
            exit_time: None,
            exit_price: None,
            realized_pnl: None,
            unrealized_pnl: Decimal::ZERO,
            close_reason: None,
        }
    }

    #[tokio::test]
    async fn symbol_upsert_is_idempotent() {
        let repo = MemoryRepository::new();
        let sym = SymbolRecord {
            name: "BTCUSDT".into(),
            market: MarketKind::Spot,
            active: true,
            exchange: "binance".into(),
            quote_volume_24h: 0.0,
        };
        repo.upsert_symbol(&sym).await.unwrap();
        repo.upsert_symbol(&sym).await.unwrap();
        assert_eq!(
            repo.list_active_symbols(MarketKind::Spot).await.unwrap().len(),
            1
        );

        // Deactivation survives re-upsert with active=false.
        let mut inactive = sym.clone();
        inactive.active = false;
        repo.upsert_symbol(&inactive).await.unwrap();
        assert!(repo
            .list_active_symbols(MarketKind::Spot)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn active_symbols_sorted_by_volume() {
        let repo = MemoryRepository::new();
        for (name, vol) in [("AUSDT", 10.0), ("BUSDT", 30.0), ("CUSDT", 20.0)] {
            repo.upsert_symbol(&SymbolRecord {
                name: name.into(),
                market: MarketKind::Spot,
                active: true,
                exchange: "binance".into(),
                quote_volume_24h: 0.0,
            })
            .await
            .unwrap();
            repo.update_symbol_volume(name, MarketKind::Spot, vol)
                .await
                .unwrap();
        }
        let names: Vec<String> = repo
            .list_active_symbols(MarketKind::Spot)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["BUSDT", "CUSDT", "AUSDT"]);
    }

    #[tokio::test]
    async fn signal_status_transition_is_guarded() {
        let repo = MemoryRepository::new();
        let sig = sample_signal("BTCUSDT", Direction::Long, Timeframe::H1);
        repo.insert_signal(&sig).await.unwrap();

        repo.update_signal_status(&sig.id, SignalStatus::Active, SignalStatus::HitTp)
            .await
            .unwrap();

        // Second transition from Active must fail — terminal states are final.
        let err = repo
            .update_signal_status(&sig.id, SignalStatus::Active, SignalStatus::HitSl)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrentUpdate { .. }));
    }

    #[tokio::test]
    async fn dup_lookup_respects_window_and_proximity() {
        let repo = MemoryRepository::new();
        let sig = sample_signal("BTCUSDT", Direction::Long, Timeframe::H4);
        repo.insert_signal(&sig).await.unwrap();
        let now = Utc::now();

        // Within window, within 1 %.
        let dup = repo
            .find_dup_signal(
                "BTCUSDT",
                Direction::Long,
                Timeframe::H4,
                MarketKind::Spot,
                dec!(100.5),
                Duration::minutes(230),
                now,
            )
            .await
            .unwrap();
        assert!(dup.is_some());

        // Entry too far away.
        let dup = repo
            .find_dup_signal(
                "BTCUSDT",
                Direction::Long,
                Timeframe::H4,
                MarketKind::Spot,
                dec!(110),
                Duration::minutes(230),
                now,
            )
            .await
            .unwrap();
        assert!(dup.is_none());

        // Different direction.
        let dup = repo
            .find_dup_signal(
                "BTCUSDT",
                Direction::Short,
                Timeframe::H4,
                MarketKind::Spot,
                dec!(100),
                Duration::minutes(230),
                now,
            )
            .await
            .unwrap();
        assert!(dup.is_none());
    }

    #[tokio::test]
    async fn trade_close_applies_balance_once() {
        let repo = MemoryRepository::new();
        let account = sample_account();
        repo.insert_account(&account).await.unwrap();
        let trade = sample_trade(&account.id, TradeStatus::Open);
        repo.insert_trade(&trade).await.unwrap();

        let exit = TradeExit {
            exit_price: dec!(110),
            exit_time: Utc::now(),
            realized_pnl: dec!(10),
            status: TradeStatus::ClosedTp,
            close_reason: "TP".into(),
        };
        repo.update_trade_close(&trade.id, TradeStatus::Open, &exit)
            .await
            .unwrap();

        let stored = repo.get_trade(&trade.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::ClosedTp);
        assert_eq!(stored.realized_pnl, Some(dec!(10)));

        let acct = repo.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(acct.current_balance, dec!(10010));

        // Double close is rejected and does not double-apply the balance.
        let err = repo
            .update_trade_close(&trade.id, TradeStatus::Open, &exit)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrentUpdate { .. }));
        let acct = repo.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(acct.current_balance, dec!(10010));
    }

    #[tokio::test]
    async fn cancel_only_from_pending() {
        let repo = MemoryRepository::new();
        let account = sample_account();
        repo.insert_account(&account).await.unwrap();

        let pending = sample_trade(&account.id, TradeStatus::Pending);
        repo.insert_trade(&pending).await.unwrap();
        repo.cancel_trade(&pending.id).await.unwrap();
        assert_eq!(
            repo.get_trade(&pending.id).await.unwrap().unwrap().status,
            TradeStatus::Cancelled
        );

        let open = sample_trade(&account.id, TradeStatus::Open);
        repo.insert_trade(&open).await.unwrap();
        assert!(repo.cancel_trade(&open.id).await.is_err());
    }

    #[tokio::test]
    async fn candle_store_is_idempotent_and_ordered() {
        use chrono::TimeZone;
        let repo = MemoryRepository::new();
        let mk = |minute: i64, close: f64| Candle {
            open_time: Utc.timestamp_opt(minute * 60, 0).unwrap(),
            close_time: Utc.timestamp_opt(minute * 60 + 59, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
        };

        let batch = vec![mk(2, 102.0), mk(0, 100.0), mk(1, 101.0)];
        repo.store_candles("BTCUSDT", MarketKind::Spot, Timeframe::M1, &batch)
            .await
            .unwrap();
        // Overlapping re-store keeps a single copy per open time.
        repo.store_candles("BTCUSDT", MarketKind::Spot, Timeframe::M1, &batch)
            .await
            .unwrap();

        let loaded = repo
            .load_candles(
                "BTCUSDT",
                MarketKind::Spot,
                Timeframe::M1,
                Utc.timestamp_opt(0, 0).unwrap(),
                Utc.timestamp_opt(600, 0).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.windows(2).all(|w| w[0].open_time < w[1].open_time));
    }
}
