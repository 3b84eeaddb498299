// =============================================================================
// Shared domain types used across the Nova signal engine
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Market / direction / timeframe
// =============================================================================

/// Which Binance market a symbol trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketKind {
    Spot,
    Futures,
}

impl std::fmt::Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "SPOT"),
            Self::Futures => write!(f, "FUTURES"),
        }
    }
}

/// Trade direction. On spot markets SHORT is surfaced to clients as SELL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short. Used in P/L arithmetic.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => -Decimal::ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Candle period. Enum order is not meaningful; use [`Timeframe::priority`]
/// for the cross-timeframe supersede rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
}

impl Timeframe {
    /// Binance kline interval string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "30m" => Some(Self::M30),
            "1h" => Some(Self::H1),
            "4h" => Some(Self::H4),
            "1d" => Some(Self::D1),
            "1w" => Some(Self::W1),
            _ => None,
        }
    }

    /// Wall-clock length of one candle.
    pub fn duration(&self) -> Duration {
        match self {
            Self::M1 => Duration::minutes(1),
            Self::M5 => Duration::minutes(5),
            Self::M15 => Duration::minutes(15),
            Self::M30 => Duration::minutes(30),
            Self::H1 => Duration::hours(1),
            Self::H4 => Duration::hours(4),
            Self::D1 => Duration::days(1),
            Self::W1 => Duration::weeks(1),
        }
    }

    /// Duplicate-suppression window: roughly 90 % of one candle period.
    pub fn dedup_window(&self) -> Duration {
        match self {
            Self::M1 => Duration::seconds(54),
            Self::M5 => Duration::minutes(4),
            Self::M15 => Duration::minutes(13),
            Self::M30 => Duration::minutes(27),
            Self::H1 => Duration::minutes(55),
            Self::H4 => Duration::minutes(230),
            Self::D1 => Duration::hours(23),
            Self::W1 => Duration::hours(151),
        }
    }

    /// Cross-timeframe priority rank: higher wins (1w > 1d > 4h > 1h > 30m
    /// > 15m > 5m > 1m).
    pub fn priority(&self) -> u8 {
        match self {
            Self::M1 => 1,
            Self::M5 => 2,
            Self::M15 => 3,
            Self::M30 => 4,
            Self::H1 => 5,
            Self::H4 => 6,
            Self::D1 => 7,
            Self::W1 => 8,
        }
    }

    /// ACTIVE signals expire after this much wall time with neither SL nor
    /// TP hit (10 candle periods).
    pub fn expiry_bound(&self) -> Duration {
        self.duration() * 10
    }

    /// Trading style and base estimated duration (hours) implied by the
    /// timeframe.
    pub fn classify(&self) -> (TradingStyle, f64) {
        match self {
            Self::M1 | Self::M5 => (TradingStyle::Scalping, 0.5),
            Self::M15 | Self::M30 | Self::H1 => (TradingStyle::Day, 6.0),
            Self::H4 => (TradingStyle::Swing, 24.0),
            Self::D1 | Self::W1 => (TradingStyle::Swing, 120.0),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Holding-period classification attached to every signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingStyle {
    Scalping,
    Day,
    Swing,
}

impl std::fmt::Display for TradingStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalping => write!(f, "SCALPING"),
            Self::Day => write!(f, "DAY"),
            Self::Swing => write!(f, "SWING"),
        }
    }
}

// =============================================================================
// Symbol
// =============================================================================

/// An exchange-qualified instrument. (name, market) is unique; symbols are
/// deactivated rather than deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub name: String,
    pub market: MarketKind,
    pub active: bool,
    pub exchange: String,
    /// Cached 24 h quote volume, refreshed by the scanner. Used only for
    /// scan ordering, never for trade decisions.
    #[serde(default)]
    pub quote_volume_24h: f64,
}

// =============================================================================
// Signal
// =============================================================================

/// Lifecycle status of a signal. Advances monotonically to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    Active,
    Executed,
    Expired,
    Cancelled,
    HitTp,
    HitSl,
}

impl SignalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Expired | Self::Cancelled | Self::HitTp | Self::HitSl
        )
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Executed => write!(f, "EXECUTED"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::HitTp => write!(f, "HIT_TP"),
            Self::HitSl => write!(f, "HIT_SL"),
        }
    }
}

/// A detected trade opportunity. Prices are fixed-precision decimals with
/// 8 fractional digits; confidence is the normalised engine score in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub market: MarketKind,
    pub direction: Direction,
    pub timeframe: Timeframe,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub confidence: f64,
    pub status: SignalStatus,
    pub trading_style: TradingStyle,
    pub estimated_duration_hours: f64,
    /// 1 on spot; configured (default 10) on futures.
    pub leverage: u32,
    pub risk_reward: f64,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Signal {
    /// Check the price-ordering invariant: SL < entry < TP for longs,
    /// TP < entry < SL for shorts.
    pub fn prices_consistent(&self) -> bool {
        match self.direction {
            Direction::Long => {
                self.stop_loss < self.entry_price && self.entry_price < self.take_profit
            }
            Direction::Short => {
                self.take_profit < self.entry_price && self.entry_price < self.stop_loss
            }
        }
    }

    /// Wall-clock instant after which an ACTIVE signal expires.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + self.timeframe.expiry_bound()
    }
}

// =============================================================================
// Paper account
// =============================================================================

/// How an account sizes new positions (quote currency).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value")]
pub enum PositionSizing {
    /// Constant quote amount per trade.
    Fixed(Decimal),
    /// Percentage of current balance (e.g. 2.0 = 2 %).
    Percent(f64),
    /// Kelly fraction from recent win rate and average R/R, capped at 5 %.
    Kelly,
}

/// A virtual balance container that paper trades draw on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperAccount {
    pub id: String,
    pub name: String,
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub max_open_trades: u32,
    /// Signals below this confidence are not auto-opened for this account.
    pub min_confidence: f64,
    pub auto_trading: bool,
    pub sizing: PositionSizing,
}

// =============================================================================
// Paper trade
// =============================================================================

/// Lifecycle status of a paper trade. OPEN transitions exactly once to one
/// of the CLOSED_* states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    Open,
    ClosedTp,
    ClosedSl,
    ClosedManual,
    ClosedExpired,
    Cancelled,
}

impl TradeStatus {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::ClosedTp | Self::ClosedSl | Self::ClosedManual | Self::ClosedExpired
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_closed() || matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Open => write!(f, "OPEN"),
            Self::ClosedTp => write!(f, "CLOSED_TP"),
            Self::ClosedSl => write!(f, "CLOSED_SL"),
            Self::ClosedManual => write!(f, "CLOSED_MANUAL"),
            Self::ClosedExpired => write!(f, "CLOSED_EXPIRED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A simulated position backed by a paper account. Holds a weak (id-only)
/// reference to the originating signal; the signal may be purged without
/// touching the trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperTrade {
    pub id: String,
    pub account_id: String,
    pub signal_id: Option<String>,
    pub symbol: String,
    pub market: MarketKind,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Position size in quote currency.
    pub size: Decimal,
    pub leverage: u32,
    pub status: TradeStatus,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    /// Mark-to-market P/L; derived, zeroed on close.
    #[serde(default)]
    pub unrealized_pnl: Decimal,
    pub close_reason: Option<String>,
}

impl PaperTrade {
    /// P/L in quote currency for an exit at `price`:
    /// (price − entry) × direction × size × leverage / entry.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) * self.direction.sign() * self.size
            * Decimal::from(self.leverage)
            / self.entry_price
    }
}

// =============================================================================
// Backtest
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BacktestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for BacktestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Aggregate performance metrics for a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub total_pnl: Decimal,
    /// total P/L / initial capital.
    pub roi: f64,
    /// sum(profits) / |sum(losses)|; infinity when no losses, 0 when no
    /// profits.
    pub profit_factor: f64,
    /// Largest peak-to-trough relative decline of the equity curve.
    pub max_drawdown: f64,
    /// Mean trade return / stdev, annualised from trade frequency.
    pub sharpe_ratio: f64,
}

/// One simulated trade inside a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub run_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    pub pnl: Decimal,
    /// "TP", "SL" or "EXPIRED".
    pub exit_reason: String,
    pub confidence: f64,
}

/// A historical evaluation request plus its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRun {
    pub id: String,
    pub name: String,
    pub symbols: Vec<String>,
    pub market: MarketKind,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// The full signal-engine configuration the run evaluates.
    pub engine_config: crate::config::SignalEngineConfig,
    pub initial_capital: Decimal,
    pub sizing: PositionSizing,
    pub status: BacktestStatus,
    pub metrics: Option<BacktestMetrics>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Fresh UUID v4 string id, the id form used for every entity.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
