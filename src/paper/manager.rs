// =============================================================================
// Paper-Trading Manager — signals in, simulated positions out
// =============================================================================
//
// Life-cycle:
//   on_signal_created  open one trade per eligible account at signal entry
//   mark_to_market     every 30 s: one batch ticker per symbol set, refresh
//                      unrealized P/L, close on TP/SL at the trigger price
//   close / cancel     manual close at market / cancel while PENDING
//
// A trade leaves OPEN exactly once: closes go through the repository's
// conditional update, and the realized P/L lands on the account balance in
// the same transaction. Events fan out only after persistence.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::binance::BinanceClient;
use crate::error::{EngineError, Result};
use crate::fanout::{Broadcaster, FeedEvent};
use crate::persistence::{Repository, TradeExit};
use crate::types::{
    new_id, Direction, MarketKind, PaperTrade, Signal, TradeStatus,
};

use super::sizing::position_size;

pub struct PaperTradingManager {
    repo: Arc<dyn Repository>,
    broadcaster: Arc<Broadcaster>,
    /// Latest mark-to-market P/L per open trade. Derived state only; the
    /// store never sees it.
    marks: RwLock<HashMap<String, Decimal>>,
}

impl PaperTradingManager {
    pub fn new(repo: Arc<dyn Repository>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            repo,
            broadcaster,
            marks: RwLock::new(HashMap::new()),
        }
    }

    /// Latest unrealized P/L for an open trade, if it has been marked.
    pub fn unrealized(&self, trade_id: &str) -> Option<Decimal> {
        self.marks.read().get(trade_id).copied()
    }

    // -------------------------------------------------------------------------
    // Signal hook
    // -------------------------------------------------------------------------

    /// Open a paper trade on every account that wants this signal: auto
    /// trading on, confidence at or above the account minimum, open-trade
    /// cap not reached. The balance is untouched at open — size is notional.
    pub async fn on_signal_created(&self, signal: &Signal) -> Result<Vec<PaperTrade>> {
        let accounts = self.repo.list_accounts().await?;
        let mut opened = Vec::new();

        for account in accounts {
            if !account.auto_trading {
                continue;
            }
            if signal.confidence < account.min_confidence {
                continue;
            }
            let open_count = self.repo.count_open_trades(&account.id).await?;
            if open_count >= account.max_open_trades {
                debug!(
                    account = %account.name,
                    open_count,
                    cap = account.max_open_trades,
                    "account at open-trade cap — signal skipped"
                );
                continue;
            }

            let recent = self.repo.list_closed_trades(&account.id, 20).await?;
            let size = position_size(&account, &recent);
            if size <= Decimal::ZERO {
                warn!(account = %account.name, "zero position size — signal skipped");
                continue;
            }

            let now = Utc::now();
            let trade = PaperTrade {
                id: new_id(),
                account_id: account.id.clone(),
                signal_id: Some(signal.id.clone()),
                symbol: signal.symbol.clone(),
                market: signal.market,
                direction: signal.direction,
                entry_price: signal.entry_price,
                stop_loss: signal.stop_loss,
                take_profit: signal.take_profit,
                size,
                leverage: signal.leverage,
                status: TradeStatus::Open,
                entry_time: Some(now),
                exit_time: None,
                exit_price: None,
                realized_pnl: None,
                unrealized_pnl: Decimal::ZERO,
                close_reason: None,
            };

            self.repo.insert_trade(&trade).await?;
            info!(
                trade_id = %trade.id,
                account = %account.name,
                symbol = %trade.symbol,
                direction = %trade.direction,
                entry = %trade.entry_price,
                size = %trade.size,
                "paper trade opened"
            );
            self.broadcaster.publish(FeedEvent::TradeOpened {
                trade: trade.clone(),
            });
            opened.push(trade);
        }

        Ok(opened)
    }

    // -------------------------------------------------------------------------
    // Price hook
    // -------------------------------------------------------------------------

    /// React to a fresh price for one OPEN trade: update the mark, close on
    /// a TP/SL trigger (exit at the trigger price exactly). Returns the
    /// closed trade when a close happened.
    pub async fn on_price(
        &self,
        trade: &PaperTrade,
        price: Decimal,
    ) -> Result<Option<PaperTrade>> {
        if trade.status != TradeStatus::Open {
            return Ok(None);
        }

        self.marks
            .write()
            .insert(trade.id.clone(), trade.pnl_at(price));

        let trigger = match trade.direction {
            Direction::Long => {
                if price >= trade.take_profit {
                    Some((TradeStatus::ClosedTp, trade.take_profit, "TP"))
                } else if price <= trade.stop_loss {
                    Some((TradeStatus::ClosedSl, trade.stop_loss, "SL"))
                } else {
                    None
                }
            }
            Direction::Short => {
                if price <= trade.take_profit {
                    Some((TradeStatus::ClosedTp, trade.take_profit, "TP"))
                } else if price >= trade.stop_loss {
                    Some((TradeStatus::ClosedSl, trade.stop_loss, "SL"))
                } else {
                    None
                }
            }
        };

        let Some((status, exit_price, reason)) = trigger else {
            return Ok(None);
        };

        self.close_internal(trade, exit_price, status, reason).await
    }

    // -------------------------------------------------------------------------
    // Manual operations (control surface)
    // -------------------------------------------------------------------------

    /// Force-close at the given market price.
    pub async fn close(&self, trade_id: &str, market_price: Decimal) -> Result<Option<PaperTrade>> {
        let Some(trade) = self.repo.get_trade(trade_id).await? else {
            return Err(EngineError::Persistence(format!(
                "unknown trade {trade_id}"
            )));
        };
        if trade.status != TradeStatus::Open {
            return Err(EngineError::ConcurrentUpdate {
                entity: "trade",
                id: trade_id.to_string(),
            });
        }
        self.close_internal(&trade, market_price, TradeStatus::ClosedManual, "MANUAL")
            .await
    }

    /// Cancel a trade still in PENDING state.
    pub async fn cancel(&self, trade_id: &str) -> Result<()> {
        self.repo.cancel_trade(trade_id).await?;
        info!(trade_id, "paper trade cancelled");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Mark-to-market sweep
    // -------------------------------------------------------------------------

    /// One mark-to-market pass: batch OPEN trades by market, fetch one
    /// ticker snapshot per market, and run the price hook for every trade.
    /// All OPEN trades on a symbol share the same ticker read.
    pub async fn mark_to_market(&self, client: &BinanceClient) -> Result<MarkSummary> {
        let open = self.repo.list_open_trades().await?;
        let mut summary = MarkSummary::default();
        summary.open_trades = open.len();
        if open.is_empty() {
            return Ok(summary);
        }

        // Group symbols per market: one batch ticker request each.
        let mut by_market: HashMap<MarketKind, Vec<String>> = HashMap::new();
        for trade in &open {
            let symbols = by_market.entry(trade.market).or_default();
            if !symbols.contains(&trade.symbol) {
                symbols.push(trade.symbol.clone());
            }
        }

        let mut prices: HashMap<(MarketKind, String), Decimal> = HashMap::new();
        for (market, symbols) in by_market {
            match client.get_batch_tickers(market, &symbols).await {
                Ok(tickers) => {
                    for (symbol, price) in tickers {
                        prices.insert((market, symbol), price);
                    }
                }
                Err(e) => {
                    // One market's ticker failure must not stall the other.
                    warn!(market = %market, error = %e, "batch ticker fetch failed");
                    summary.errors += 1;
                }
            }
        }

        for trade in &open {
            let Some(price) = prices.get(&(trade.market, trade.symbol.clone())) else {
                continue;
            };
            match self.on_price(trade, *price).await {
                Ok(Some(_)) => summary.closed += 1,
                Ok(None) => summary.marked += 1,
                Err(e) => {
                    warn!(trade_id = %trade.id, error = %e, "price hook failed");
                    summary.errors += 1;
                }
            }
        }

        debug!(
            open = summary.open_trades,
            marked = summary.marked,
            closed = summary.closed,
            errors = summary.errors,
            "mark-to-market pass complete"
        );
        Ok(summary)
    }

    // -------------------------------------------------------------------------
    // Internal close path
    // -------------------------------------------------------------------------

    async fn close_internal(
        &self,
        trade: &PaperTrade,
        exit_price: Decimal,
        status: TradeStatus,
        reason: &str,
    ) -> Result<Option<PaperTrade>> {
        let realized = trade.pnl_at(exit_price);
        let exit = TradeExit {
            exit_price,
            exit_time: Utc::now(),
            realized_pnl: realized,
            status,
            close_reason: reason.to_string(),
        };

        match self
            .repo
            .update_trade_close(&trade.id, TradeStatus::Open, &exit)
            .await
        {
            Ok(()) => {}
            Err(EngineError::ConcurrentUpdate { .. }) => {
                // Someone else won the close race; nothing more to do.
                debug!(trade_id = %trade.id, "close raced — already closed");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        self.marks.write().remove(&trade.id);

        let mut closed = trade.clone();
        closed.status = status;
        closed.exit_price = Some(exit.exit_price);
        closed.exit_time = Some(exit.exit_time);
        closed.realized_pnl = Some(realized);
        closed.unrealized_pnl = Decimal::ZERO;
        closed.close_reason = Some(reason.to_string());

        info!(
            trade_id = %closed.id,
            symbol = %closed.symbol,
            status = %status,
            exit_price = %exit_price,
            realized_pnl = %realized,
            "paper trade closed"
        );
        self.broadcaster.publish(FeedEvent::TradeClosed {
            trade: closed.clone(),
        });

        Ok(Some(closed))
    }
}

/// Counters from one mark-to-market pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkSummary {
    pub open_trades: usize,
    pub marked: usize,
    pub closed: usize,
    pub errors: usize,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryRepository;
    use crate::types::{
        PaperAccount, PositionSizing, SignalStatus, Timeframe, TradingStyle,
    };
    use rust_decimal_macros::dec;

    fn sample_signal(confidence: f64) -> Signal {
        Signal {
            id: new_id(),
            symbol: "BTCUSDT".into(),
            market: MarketKind::Spot,
            direction: Direction::Long,
            timeframe: Timeframe::H4,
            entry_price: dec!(100),
            stop_loss: dec!(95),
            take_profit: dec!(110),
            confidence,
            status: SignalStatus::Active,
            trading_style: TradingStyle::Swing,
            estimated_duration_hours: 24.0,
            leverage: 1,
            risk_reward: 2.0,
            description: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_account(name: &str) -> PaperAccount {
        PaperAccount {
            id: new_id(),
            name: name.into(),
            initial_balance: dec!(10000),
            current_balance: dec!(10000),
            max_open_trades: 10,
            min_confidence: 0.70,
            auto_trading: true,
            sizing: PositionSizing::Fixed(dec!(100)),
        }
    }

    async fn setup() -> (Arc<MemoryRepository>, PaperTradingManager, PaperAccount) {
        let repo = Arc::new(MemoryRepository::new());
        let broadcaster = Arc::new(Broadcaster::new(None));
        let manager = PaperTradingManager::new(repo.clone(), broadcaster);
        let account = sample_account("default");
        repo.insert_account(&account).await.unwrap();
        (repo, manager, account)
    }

    #[tokio::test]
    async fn auto_open_copies_signal_fields() {
        let (_repo, manager, account) = setup().await;
        let signal = sample_signal(0.85);

        let opened = manager.on_signal_created(&signal).await.unwrap();
        assert_eq!(opened.len(), 1);
        let trade = &opened[0];

        assert_eq!(trade.account_id, account.id);
        assert_eq!(trade.entry_price, signal.entry_price);
        assert_eq!(trade.stop_loss, signal.stop_loss);
        assert_eq!(trade.take_profit, signal.take_profit);
        assert_eq!(trade.direction, signal.direction);
        assert_eq!(trade.leverage, signal.leverage);
        assert_eq!(trade.size, dec!(100));
        assert_eq!(trade.status, TradeStatus::Open);
        assert!(trade.entry_time.is_some());
    }

    #[tokio::test]
    async fn open_leaves_balance_untouched() {
        let (repo, manager, account) = setup().await;
        manager.on_signal_created(&sample_signal(0.85)).await.unwrap();
        let stored = repo.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.current_balance, dec!(10000));
    }

    #[tokio::test]
    async fn low_confidence_signal_is_skipped() {
        let (_repo, manager, _) = setup().await;
        let opened = manager.on_signal_created(&sample_signal(0.65)).await.unwrap();
        assert!(opened.is_empty());
    }

    #[tokio::test]
    async fn confidence_equal_to_minimum_opens() {
        let (_repo, manager, _) = setup().await;
        let opened = manager.on_signal_created(&sample_signal(0.70)).await.unwrap();
        assert_eq!(opened.len(), 1);
    }

    #[tokio::test]
    async fn open_trade_cap_enforced() {
        let (repo, manager, account) = setup().await;
        let mut capped = account.clone();
        capped.max_open_trades = 1;
        repo.update_account(&capped).await.unwrap();

        assert_eq!(
            manager.on_signal_created(&sample_signal(0.8)).await.unwrap().len(),
            1
        );
        assert!(manager.on_signal_created(&sample_signal(0.8)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_auto_trading_is_skipped() {
        let (repo, manager, account) = setup().await;
        let mut off = account.clone();
        off.auto_trading = false;
        repo.update_account(&off).await.unwrap();

        assert!(manager.on_signal_created(&sample_signal(0.9)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tp_close_at_trigger_price_updates_balance() {
        let (repo, manager, account) = setup().await;
        let opened = manager.on_signal_created(&sample_signal(0.85)).await.unwrap();
        let trade = &opened[0];

        // Price shoots past TP; the exit fills at TP exactly.
        let closed = manager.on_price(trade, dec!(112)).await.unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::ClosedTp);
        assert_eq!(closed.exit_price, Some(dec!(110)));
        // (110 - 100) / 100 * 100 quote * 1x = 10.
        assert_eq!(closed.realized_pnl, Some(dec!(10)));

        let acct = repo.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(acct.current_balance, dec!(10010));
    }

    #[tokio::test]
    async fn sl_close_for_short() {
        let (repo, manager, _) = setup().await;
        let mut signal = sample_signal(0.85);
        signal.direction = Direction::Short;
        signal.stop_loss = dec!(105);
        signal.take_profit = dec!(90);

        let opened = manager.on_signal_created(&signal).await.unwrap();
        let trade = &opened[0];

        let closed = manager.on_price(trade, dec!(106)).await.unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::ClosedSl);
        assert_eq!(closed.exit_price, Some(dec!(105)));
        // Short losing 5 % on 100 quote.
        assert_eq!(closed.realized_pnl, Some(dec!(-5)));

        let acct = repo
            .get_account(&trade.account_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.current_balance, dec!(9995));
    }

    #[tokio::test]
    async fn price_between_levels_only_marks() {
        let (_repo, manager, _) = setup().await;
        let opened = manager.on_signal_created(&sample_signal(0.85)).await.unwrap();
        let trade = &opened[0];

        let closed = manager.on_price(trade, dec!(104)).await.unwrap();
        assert!(closed.is_none());
        // Unrealized: (104-100)/100 * 100 = 4.
        assert_eq!(manager.unrealized(&trade.id), Some(dec!(4)));
    }

    #[tokio::test]
    async fn double_close_is_a_noop() {
        let (_repo, manager, _) = setup().await;
        let opened = manager.on_signal_created(&sample_signal(0.85)).await.unwrap();
        let trade = &opened[0];

        assert!(manager.on_price(trade, dec!(112)).await.unwrap().is_some());
        // The stale copy still says OPEN; the close must race-lose quietly.
        let again = manager.on_price(trade, dec!(112)).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn manual_close_uses_market_price() {
        let (repo, manager, account) = setup().await;
        let opened = manager.on_signal_created(&sample_signal(0.85)).await.unwrap();
        let trade = &opened[0];

        let closed = manager.close(&trade.id, dec!(103)).await.unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::ClosedManual);
        assert_eq!(closed.exit_price, Some(dec!(103)));
        assert_eq!(closed.realized_pnl, Some(dec!(3)));

        let acct = repo.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(acct.current_balance, dec!(10003));
    }

    #[tokio::test]
    async fn balance_invariant_over_many_closes() {
        // initial + sum(realized) == current, whatever the close mix.
        let (repo, manager, account) = setup().await;

        for i in 0..5 {
            let opened = manager.on_signal_created(&sample_signal(0.85)).await.unwrap();
            let trade = &opened[0];
            let price = if i % 2 == 0 { dec!(112) } else { dec!(94) };
            manager.on_price(trade, price).await.unwrap();
        }

        let closed = repo.list_closed_trades(&account.id, 100).await.unwrap();
        let realized_sum: Decimal = closed.iter().filter_map(|t| t.realized_pnl).sum();
        let acct = repo.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(acct.current_balance, acct.initial_balance + realized_sum);
    }
}
