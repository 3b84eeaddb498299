// =============================================================================
// SQLite repository — sqlx-backed implementation
// =============================================================================
//
// Storage conventions:
//   - enums            TEXT, the same strings the Display impls produce
//   - decimal prices   TEXT (lossless fixed-point)
//   - timestamps       INTEGER, milliseconds since the UNIX epoch (UTC)
//   - nested config    TEXT, JSON
//
// Indexes follow the read paths: (symbol, status) for active-signal lookup,
// (created_at DESC) for recent feeds, (status, entry_time) for trade queries.
// =============================================================================

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::market_data::Candle;
use crate::types::{
    BacktestMetrics, BacktestRun, BacktestStatus, BacktestTrade, Direction, MarketKind,
    PaperAccount, PaperTrade, Signal, SignalStatus, SymbolRecord, Timeframe, TradeStatus,
    TradingStyle,
};

use super::{entries_within_one_percent, ActiveSignalFilter, Repository, TradeExit};

/// Repository over a SQLite database file (or `sqlite::memory:`).
pub struct SqliteRepository {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS symbols (
    name             TEXT NOT NULL,
    market           TEXT NOT NULL,
    active           INTEGER NOT NULL,
    exchange         TEXT NOT NULL,
    quote_volume_24h REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (name, market)
);

CREATE TABLE IF NOT EXISTS signals (
    id                       TEXT PRIMARY KEY,
    symbol                   TEXT NOT NULL,
    market                   TEXT NOT NULL,
    direction                TEXT NOT NULL,
    timeframe                TEXT NOT NULL,
    entry_price              TEXT NOT NULL,
    stop_loss                TEXT NOT NULL,
    take_profit              TEXT NOT NULL,
    confidence               REAL NOT NULL,
    status                   TEXT NOT NULL,
    trading_style            TEXT NOT NULL,
    estimated_duration_hours REAL NOT NULL,
    leverage                 INTEGER NOT NULL,
    risk_reward              REAL NOT NULL,
    description              TEXT NOT NULL,
    created_at               INTEGER NOT NULL,
    updated_at               INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signals_symbol_status ON signals (symbol, status);
CREATE INDEX IF NOT EXISTS idx_signals_created_at ON signals (created_at DESC);

CREATE TABLE IF NOT EXISTS accounts (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    initial_balance TEXT NOT NULL,
    current_balance TEXT NOT NULL,
    max_open_trades INTEGER NOT NULL,
    min_confidence  REAL NOT NULL,
    auto_trading    INTEGER NOT NULL,
    sizing          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trades (
    id             TEXT PRIMARY KEY,
    account_id     TEXT NOT NULL,
    signal_id      TEXT,
    symbol         TEXT NOT NULL,
    market         TEXT NOT NULL,
    direction      TEXT NOT NULL,
    entry_price    TEXT NOT NULL,
    stop_loss      TEXT NOT NULL,
    take_profit    TEXT NOT NULL,
    size           TEXT NOT NULL,
    leverage       INTEGER NOT NULL,
    status         TEXT NOT NULL,
    entry_time     INTEGER,
    exit_time      INTEGER,
    exit_price     TEXT,
    realized_pnl   TEXT,
    unrealized_pnl TEXT NOT NULL,
    close_reason   TEXT
);
CREATE INDEX IF NOT EXISTS idx_trades_status_entry_time ON trades (status, entry_time);
CREATE INDEX IF NOT EXISTS idx_trades_account ON trades (account_id, status);

CREATE TABLE IF NOT EXISTS backtest_runs (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    symbols         TEXT NOT NULL,
    market          TEXT NOT NULL,
    timeframe       TEXT NOT NULL,
    start_time      INTEGER NOT NULL,
    end_time        INTEGER NOT NULL,
    engine_config   TEXT NOT NULL,
    initial_capital TEXT NOT NULL,
    sizing          TEXT NOT NULL,
    status          TEXT NOT NULL,
    metrics         TEXT,
    error           TEXT,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS backtest_trades (
    run_id      TEXT NOT NULL,
    symbol      TEXT NOT NULL,
    direction   TEXT NOT NULL,
    entry_time  INTEGER NOT NULL,
    exit_time   INTEGER NOT NULL,
    entry_price TEXT NOT NULL,
    exit_price  TEXT NOT NULL,
    size        TEXT NOT NULL,
    pnl         TEXT NOT NULL,
    exit_reason TEXT NOT NULL,
    confidence  REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_backtest_trades_run ON backtest_trades (run_id);

CREATE TABLE IF NOT EXISTS candles (
    symbol     TEXT NOT NULL,
    market     TEXT NOT NULL,
    timeframe  TEXT NOT NULL,
    open_time  INTEGER NOT NULL,
    close_time INTEGER NOT NULL,
    open       REAL NOT NULL,
    high       REAL NOT NULL,
    low        REAL NOT NULL,
    close      REAL NOT NULL,
    volume     REAL NOT NULL,
    PRIMARY KEY (symbol, market, timeframe, open_time)
);
"#;

impl SqliteRepository {
    /// Connect to `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        // An in-memory database exists per connection; the pool must not
        // fan out across several of them.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        info!(database_url, "sqlite repository ready");
        Ok(Self { pool })
    }
}

// =============================================================================
// Enum <-> TEXT helpers
// =============================================================================

fn parse_market(s: &str) -> Result<MarketKind> {
    match s {
        "SPOT" => Ok(MarketKind::Spot),
        "FUTURES" => Ok(MarketKind::Futures),
        other => Err(EngineError::Persistence(format!("unknown market {other}"))),
    }
}

fn parse_direction(s: &str) -> Result<Direction> {
    match s {
        "LONG" => Ok(Direction::Long),
        "SHORT" => Ok(Direction::Short),
        other => Err(EngineError::Persistence(format!(
            "unknown direction {other}"
        ))),
    }
}

fn parse_timeframe(s: &str) -> Result<Timeframe> {
    Timeframe::parse(s)
        .ok_or_else(|| EngineError::Persistence(format!("unknown timeframe {s}")))
}

fn parse_signal_status(s: &str) -> Result<SignalStatus> {
    match s {
        "ACTIVE" => Ok(SignalStatus::Active),
        "EXECUTED" => Ok(SignalStatus::Executed),
        "EXPIRED" => Ok(SignalStatus::Expired),
        "CANCELLED" => Ok(SignalStatus::Cancelled),
        "HIT_TP" => Ok(SignalStatus::HitTp),
        "HIT_SL" => Ok(SignalStatus::HitSl),
        other => Err(EngineError::Persistence(format!(
            "unknown signal status {other}"
        ))),
    }
}

fn parse_trade_status(s: &str) -> Result<TradeStatus> {
    match s {
        "PENDING" => Ok(TradeStatus::Pending),
        "OPEN" => Ok(TradeStatus::Open),
        "CLOSED_TP" => Ok(TradeStatus::ClosedTp),
        "CLOSED_SL" => Ok(TradeStatus::ClosedSl),
        "CLOSED_MANUAL" => Ok(TradeStatus::ClosedManual),
        "CLOSED_EXPIRED" => Ok(TradeStatus::ClosedExpired),
        "CANCELLED" => Ok(TradeStatus::Cancelled),
        other => Err(EngineError::Persistence(format!(
            "unknown trade status {other}"
        ))),
    }
}

fn parse_trading_style(s: &str) -> Result<TradingStyle> {
    match s {
        "SCALPING" => Ok(TradingStyle::Scalping),
        "DAY" => Ok(TradingStyle::Day),
        "SWING" => Ok(TradingStyle::Swing),
        other => Err(EngineError::Persistence(format!(
            "unknown trading style {other}"
        ))),
    }
}

fn parse_backtest_status(s: &str) -> Result<BacktestStatus> {
    match s {
        "PENDING" => Ok(BacktestStatus::Pending),
        "RUNNING" => Ok(BacktestStatus::Running),
        "COMPLETED" => Ok(BacktestStatus::Completed),
        "FAILED" => Ok(BacktestStatus::Failed),
        other => Err(EngineError::Persistence(format!(
            "unknown backtest status {other}"
        ))),
    }
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|e| EngineError::Persistence(format!("bad decimal '{s}': {e}")))
}

fn parse_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| EngineError::Persistence(format!("bad timestamp {ms}")))
}

fn json_to<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| EngineError::Persistence(format!("bad JSON column: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| EngineError::Persistence(e.to_string()))
}

// =============================================================================
// Row mappers
// =============================================================================

fn symbol_from_row(row: &SqliteRow) -> Result<SymbolRecord> {
    Ok(SymbolRecord {
        name: row.try_get("name")?,
        market: parse_market(row.try_get::<String, _>("market")?.as_str())?,
        active: row.try_get::<i64, _>("active")? != 0,
        exchange: row.try_get("exchange")?,
        quote_volume_24h: row.try_get("quote_volume_24h")?,
    })
}

fn signal_from_row(row: &SqliteRow) -> Result<Signal> {
    Ok(Signal {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        market: parse_market(row.try_get::<String, _>("market")?.as_str())?,
        direction: parse_direction(row.try_get::<String, _>("direction")?.as_str())?,
        timeframe: parse_timeframe(row.try_get::<String, _>("timeframe")?.as_str())?,
        entry_price: parse_decimal(row.try_get::<String, _>("entry_price")?.as_str())?,
        stop_loss: parse_decimal(row.try_get::<String, _>("stop_loss")?.as_str())?,
        take_profit: parse_decimal(row.try_get::<String, _>("take_profit")?.as_str())?,
        confidence: row.try_get("confidence")?,
        status: parse_signal_status(row.try_get::<String, _>("status")?.as_str())?,
        trading_style: parse_trading_style(row.try_get::<String, _>("trading_style")?.as_str())?,
        estimated_duration_hours: row.try_get("estimated_duration_hours")?,
        leverage: row.try_get::<i64, _>("leverage")? as u32,
        risk_reward: row.try_get("risk_reward")?,
        description: row.try_get("description")?,
        created_at: parse_millis(row.try_get("created_at")?)?,
        updated_at: parse_millis(row.try_get("updated_at")?)?,
    })
}

fn trade_from_row(row: &SqliteRow) -> Result<PaperTrade> {
    let exit_price: Option<String> = row.try_get("exit_price")?;
    let realized_pnl: Option<String> = row.try_get("realized_pnl")?;
    let entry_time: Option<i64> = row.try_get("entry_time")?;
    let exit_time: Option<i64> = row.try_get("exit_time")?;

    Ok(PaperTrade {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        signal_id: row.try_get("signal_id")?,
        symbol: row.try_get("symbol")?,
        market: parse_market(row.try_get::<String, _>("market")?.as_str())?,
        direction: parse_direction(row.try_get::<String, _>("direction")?.as_str())?,
        entry_price: parse_decimal(row.try_get::<String, _>("entry_price")?.as_str())?,
        stop_loss: parse_decimal(row.try_get::<String, _>("stop_loss")?.as_str())?,
        take_profit: parse_decimal(row.try_get::<String, _>("take_profit")?.as_str())?,
        size: parse_decimal(row.try_get::<String, _>("size")?.as_str())?,
        leverage: row.try_get::<i64, _>("leverage")? as u32,
        status: parse_trade_status(row.try_get::<String, _>("status")?.as_str())?,
        entry_time: entry_time.map(parse_millis).transpose()?,
        exit_time: exit_time.map(parse_millis).transpose()?,
        exit_price: exit_price.as_deref().map(parse_decimal).transpose()?,
        realized_pnl: realized_pnl.as_deref().map(parse_decimal).transpose()?,
        unrealized_pnl: parse_decimal(row.try_get::<String, _>("unrealized_pnl")?.as_str())?,
        close_reason: row.try_get("close_reason")?,
    })
}

fn account_from_row(row: &SqliteRow) -> Result<PaperAccount> {
    Ok(PaperAccount {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        initial_balance: parse_decimal(row.try_get::<String, _>("initial_balance")?.as_str())?,
        current_balance: parse_decimal(row.try_get::<String, _>("current_balance")?.as_str())?,
        max_open_trades: row.try_get::<i64, _>("max_open_trades")? as u32,
        min_confidence: row.try_get("min_confidence")?,
        auto_trading: row.try_get::<i64, _>("auto_trading")? != 0,
        sizing: json_to(row.try_get::<String, _>("sizing")?.as_str())?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<BacktestRun> {
    let metrics: Option<String> = row.try_get("metrics")?;
    Ok(BacktestRun {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        symbols: json_to(row.try_get::<String, _>("symbols")?.as_str())?,
        market: parse_market(row.try_get::<String, _>("market")?.as_str())?,
        timeframe: parse_timeframe(row.try_get::<String, _>("timeframe")?.as_str())?,
        start: parse_millis(row.try_get("start_time")?)?,
        end: parse_millis(row.try_get("end_time")?)?,
        engine_config: json_to(row.try_get::<String, _>("engine_config")?.as_str())?,
        initial_capital: parse_decimal(row.try_get::<String, _>("initial_capital")?.as_str())?,
        sizing: json_to(row.try_get::<String, _>("sizing")?.as_str())?,
        status: parse_backtest_status(row.try_get::<String, _>("status")?.as_str())?,
        metrics: metrics
            .as_deref()
            .map(json_to::<BacktestMetrics>)
            .transpose()?,
        error: row.try_get("error")?,
        created_at: parse_millis(row.try_get("created_at")?)?,
    })
}

fn candle_from_row(row: &SqliteRow) -> Result<Candle> {
    Ok(Candle {
        open_time: parse_millis(row.try_get("open_time")?)?,
        close_time: parse_millis(row.try_get("close_time")?)?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
    })
}

// =============================================================================
// Repository impl
// =============================================================================

#[async_trait]
impl Repository for SqliteRepository {
    // ── Symbols ─────────────────────────────────────────────────────────

    async fn upsert_symbol(&self, symbol: &SymbolRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO symbols (name, market, active, exchange, quote_volume_24h)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (name, market)
             DO UPDATE SET active = excluded.active, exchange = excluded.exchange",
        )
        .bind(&symbol.name)
        .bind(symbol.market.to_string())
        .bind(symbol.active as i64)
        .bind(&symbol.exchange)
        .bind(symbol.quote_volume_24h)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active_symbols(&self, market: MarketKind) -> Result<Vec<SymbolRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM symbols WHERE market = ? AND active = 1
             ORDER BY quote_volume_24h DESC, name ASC",
        )
        .bind(market.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(symbol_from_row).collect()
    }

    async fn update_symbol_volume(
        &self,
        name: &str,
        market: MarketKind,
        quote_volume: f64,
    ) -> Result<()> {
        sqlx::query("UPDATE symbols SET quote_volume_24h = ? WHERE name = ? AND market = ?")
            .bind(quote_volume)
            .bind(name)
            .bind(market.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Signals ─────────────────────────────────────────────────────────

    async fn insert_signal(&self, signal: &Signal) -> Result<()> {
        sqlx::query(
            "INSERT INTO signals (id, symbol, market, direction, timeframe, entry_price,
                 stop_loss, take_profit, confidence, status, trading_style,
                 estimated_duration_hours, leverage, risk_reward, description,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&signal.id)
        .bind(&signal.symbol)
        .bind(signal.market.to_string())
        .bind(signal.direction.to_string())
        .bind(signal.timeframe.as_str())
        .bind(signal.entry_price.to_string())
        .bind(signal.stop_loss.to_string())
        .bind(signal.take_profit.to_string())
        .bind(signal.confidence)
        .bind(signal.status.to_string())
        .bind(signal.trading_style.to_string())
        .bind(signal.estimated_duration_hours)
        .bind(signal.leverage as i64)
        .bind(signal.risk_reward)
        .bind(&signal.description)
        .bind(signal.created_at.timestamp_millis())
        .bind(signal.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_signal(&self, id: &str) -> Result<Option<Signal>> {
        let row = sqlx::query("SELECT * FROM signals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(signal_from_row).transpose()
    }

    async fn update_signal_status(
        &self,
        id: &str,
        expected_old: SignalStatus,
        new: SignalStatus,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE signals SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(new.to_string())
                .bind(Utc::now().timestamp_millis())
                .bind(id)
                .bind(expected_old.to_string())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() != 1 {
            return Err(EngineError::ConcurrentUpdate {
                entity: "signal",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_signal_entry(&self, id: &str, entry: Decimal) -> Result<()> {
        sqlx::query("UPDATE signals SET entry_price = ?, updated_at = ? WHERE id = ?")
            .bind(entry.to_string())
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active_signals(&self, filter: &ActiveSignalFilter) -> Result<Vec<Signal>> {
        // The optional filters are applied via "IS NULL OR" so one statement
        // covers every combination.
        let rows = sqlx::query(
            "SELECT * FROM signals WHERE status = 'ACTIVE'
               AND (?1 IS NULL OR symbol = ?1)
               AND (?2 IS NULL OR direction = ?2)
               AND (?3 IS NULL OR market = ?3)
               AND (?4 IS NULL OR timeframe = ?4)
             ORDER BY created_at DESC",
        )
        .bind(filter.symbol.as_deref())
        .bind(filter.direction.map(|d| d.to_string()))
        .bind(filter.market.map(|m| m.to_string()))
        .bind(filter.timeframe.map(|tf| tf.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(signal_from_row).collect()
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
        let cutoff = (now - window).timestamp_millis();
        let rows = sqlx::query(
            "SELECT * FROM signals WHERE status = 'ACTIVE'
               AND symbol = ? AND direction = ? AND timeframe = ? AND market = ?
               AND created_at >= ?",
        )
        .bind(symbol)
        .bind(direction.to_string())
        .bind(timeframe.as_str())
        .bind(market.to_string())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        // Price proximity is decimal math; filter client-side.
        for row in &rows {
            let candidate = signal_from_row(row)?;
            if entries_within_one_percent(entry, candidate.entry_price) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    // ── Paper trades ────────────────────────────────────────────────────

    async fn insert_trade(&self, trade: &PaperTrade) -> Result<()> {
        sqlx::query(
            "INSERT INTO trades (id, account_id, signal_id, symbol, market, direction,
                 entry_price, stop_loss, take_profit, size, leverage, status,
                 entry_time, exit_time, exit_price, realized_pnl, unrealized_pnl,
                 close_reason)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trade.id)
        .bind(&trade.account_id)
        .bind(&trade.signal_id)
        .bind(&trade.symbol)
        .bind(trade.market.to_string())
        .bind(trade.direction.to_string())
        .bind(trade.entry_price.to_string())
        .bind(trade.stop_loss.to_string())
        .bind(trade.take_profit.to_string())
        .bind(trade.size.to_string())
        .bind(trade.leverage as i64)
        .bind(trade.status.to_string())
        .bind(trade.entry_time.map(|t| t.timestamp_millis()))
        .bind(trade.exit_time.map(|t| t.timestamp_millis()))
        .bind(trade.exit_price.map(|p| p.to_string()))
        .bind(trade.realized_pnl.map(|p| p.to_string()))
        .bind(trade.unrealized_pnl.to_string())
        .bind(&trade.close_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_trade(&self, id: &str) -> Result<Option<PaperTrade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn list_open_trades(&self) -> Result<Vec<PaperTrade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE status = 'OPEN' ORDER BY entry_time")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn count_open_trades(&self, account_id: &str) -> Result<u32> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM trades WHERE account_id = ? AND status = 'OPEN'")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get::<i64, _>("n")? as u32)
    }

    async fn list_closed_trades(&self, account_id: &str, limit: usize) -> Result<Vec<PaperTrade>> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE account_id = ?
               AND status IN ('CLOSED_TP', 'CLOSED_SL', 'CLOSED_MANUAL', 'CLOSED_EXPIRED')
             ORDER BY exit_time DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn update_trade_close(
        &self,
        id: &str,
        expected_old: TradeStatus,
        exit: &TradeExit,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE trades SET status = ?, exit_price = ?, exit_time = ?, realized_pnl = ?,
                 unrealized_pnl = '0', close_reason = ?
             WHERE id = ? AND status = ?",
        )
        .bind(exit.status.to_string())
        .bind(exit.exit_price.to_string())
        .bind(exit.exit_time.timestamp_millis())
        .bind(exit.realized_pnl.to_string())
        .bind(&exit.close_reason)
        .bind(id)
        .bind(expected_old.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(EngineError::ConcurrentUpdate {
                entity: "trade",
                id: id.to_string(),
            });
        }

        // Apply the realized P/L to the owning account inside the same
        // transaction. Balances are decimal TEXT, so read-modify-write.
        let row = sqlx::query(
            "SELECT a.id AS account_id, a.current_balance AS balance
             FROM accounts a JOIN trades t ON t.account_id = a.id WHERE t.id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let account_id: String = row.try_get("account_id")?;
        let balance = parse_decimal(row.try_get::<String, _>("balance")?.as_str())?;
        let new_balance = balance + exit.realized_pnl;

        sqlx::query("UPDATE accounts SET current_balance = ? WHERE id = ?")
            .bind(new_balance.to_string())
            .bind(&account_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cancel_trade(&self, id: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE trades SET status = 'CANCELLED' WHERE id = ? AND status = 'PENDING'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() != 1 {
            return Err(EngineError::ConcurrentUpdate {
                entity: "trade",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Accounts ────────────────────────────────────────────────────────

    async fn insert_account(&self, account: &PaperAccount) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (id, name, initial_balance, current_balance,
                 max_open_trades, min_confidence, auto_trading, sizing)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.id)
        .bind(&account.name)
        .bind(account.initial_balance.to_string())
        .bind(account.current_balance.to_string())
        .bind(account.max_open_trades as i64)
        .bind(account.min_confidence)
        .bind(account.auto_trading as i64)
        .bind(to_json(&account.sizing)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<PaperAccount>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn get_account_by_name(&self, name: &str) -> Result<Option<PaperAccount>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<PaperAccount>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn update_account(&self, account: &PaperAccount) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET name = ?, initial_balance = ?, current_balance = ?,
                 max_open_trades = ?, min_confidence = ?, auto_trading = ?, sizing = ?
             WHERE id = ?",
        )
        .bind(&account.name)
        .bind(account.initial_balance.to_string())
        .bind(account.current_balance.to_string())
        .bind(account.max_open_trades as i64)
        .bind(account.min_confidence)
        .bind(account.auto_trading as i64)
        .bind(to_json(&account.sizing)?)
        .bind(&account.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn adjust_account_balance(&self, id: &str, delta: Decimal) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT current_balance FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let balance = parse_decimal(row.try_get::<String, _>("current_balance")?.as_str())?;

        sqlx::query("UPDATE accounts SET current_balance = ? WHERE id = ?")
            .bind((balance + delta).to_string())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ── Backtests ───────────────────────────────────────────────────────

    async fn insert_backtest_run(&self, run: &BacktestRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO backtest_runs (id, name, symbols, market, timeframe, start_time,
                 end_time, engine_config, initial_capital, sizing, status, metrics,
                 error, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.name)
        .bind(to_json(&run.symbols)?)
        .bind(run.market.to_string())
        .bind(run.timeframe.as_str())
        .bind(run.start.timestamp_millis())
        .bind(run.end.timestamp_millis())
        .bind(to_json(&run.engine_config)?)
        .bind(run.initial_capital.to_string())
        .bind(to_json(&run.sizing)?)
        .bind(run.status.to_string())
        .bind(run.metrics.as_ref().map(to_json).transpose()?)
        .bind(&run.error)
        .bind(run.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_backtest_run(&self, id: &str) -> Result<Option<BacktestRun>> {
        let row = sqlx::query("SELECT * FROM backtest_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn update_backtest_run(&self, run: &BacktestRun) -> Result<()> {
        sqlx::query(
            "UPDATE backtest_runs SET status = ?, metrics = ?, error = ? WHERE id = ?",
        )
        .bind(run.status.to_string())
        .bind(run.metrics.as_ref().map(to_json).transpose()?)
        .bind(&run.error)
        .bind(&run.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_backtest_runs(&self, status: BacktestStatus) -> Result<Vec<BacktestRun>> {
        let rows = sqlx::query(
            "SELECT * FROM backtest_runs WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn insert_backtest_trades(&self, trades: &[BacktestTrade]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for trade in trades {
            sqlx::query(
                "INSERT INTO backtest_trades (run_id, symbol, direction, entry_time,
                     exit_time, entry_price, exit_price, size, pnl, exit_reason, confidence)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&trade.run_id)
            .bind(&trade.symbol)
            .bind(trade.direction.to_string())
            .bind(trade.entry_time.timestamp_millis())
            .bind(trade.exit_time.timestamp_millis())
            .bind(trade.entry_price.to_string())
            .bind(trade.exit_price.to_string())
            .bind(trade.size.to_string())
            .bind(trade.pnl.to_string())
            .bind(&trade.exit_reason)
            .bind(trade.confidence)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_backtest_trades(&self, run_id: &str) -> Result<Vec<BacktestTrade>> {
        let rows = sqlx::query(
            "SELECT * FROM backtest_trades WHERE run_id = ? ORDER BY entry_time",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(BacktestTrade {
                    run_id: row.try_get("run_id")?,
                    symbol: row.try_get("symbol")?,
                    direction: parse_direction(row.try_get::<String, _>("direction")?.as_str())?,
                    entry_time: parse_millis(row.try_get("entry_time")?)?,
                    exit_time: parse_millis(row.try_get("exit_time")?)?,
                    entry_price: parse_decimal(row.try_get::<String, _>("entry_price")?.as_str())?,
                    exit_price: parse_decimal(row.try_get::<String, _>("exit_price")?.as_str())?,
                    size: parse_decimal(row.try_get::<String, _>("size")?.as_str())?,
                    pnl: parse_decimal(row.try_get::<String, _>("pnl")?.as_str())?,
                    exit_reason: row.try_get("exit_reason")?,
                    confidence: row.try_get("confidence")?,
                })
            })
            .collect()
    }

    // ── Candles ─────────────────────────────────────────────────────────

    async fn store_candles(
        &self,
        symbol: &str,
        market: MarketKind,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for candle in candles {
            sqlx::query(
                "INSERT OR REPLACE INTO candles (symbol, market, timeframe, open_time,
                     close_time, open, high, low, close, volume)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(symbol)
            .bind(market.to_string())
            .bind(timeframe.as_str())
            .bind(candle.open_time.timestamp_millis())
            .bind(candle.close_time.timestamp_millis())
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
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
        let rows = sqlx::query(
            "SELECT * FROM candles WHERE symbol = ? AND market = ? AND timeframe = ?
               AND open_time >= ? AND open_time <= ?
             ORDER BY open_time",
        )
        .bind(symbol)
        .bind(market.to_string())
        .bind(timeframe.as_str())
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candle_from_row).collect()
    }
}
