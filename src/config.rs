// =============================================================================
// Configuration — startup bundle and signal-engine parameters
// =============================================================================
//
// The bundle is loaded once at process start and is read-only at runtime.
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;
use crate::types::PositionSizing;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_min_confidence() -> f64 {
    0.70
}

fn default_long_rsi_min() -> f64 {
    25.0
}

fn default_long_rsi_max() -> f64 {
    35.0
}

fn default_short_rsi_min() -> f64 {
    65.0
}

fn default_short_rsi_max() -> f64 {
    75.0
}

fn default_adx_min() -> f64 {
    20.0
}

fn default_volume_multiplier() -> f64 {
    1.5
}

fn default_sl_atr_multiplier() -> f64 {
    1.5
}

fn default_tp_atr_multiplier() -> f64 {
    3.0
}

fn default_futures_leverage() -> u32 {
    10
}

fn default_spot_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_futures_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_database_url() -> String {
    "sqlite://nova.db?mode=rwc".to_string()
}

fn default_spot_rate_limit() -> u32 {
    1200
}

fn default_futures_rate_limit() -> u32 {
    2400
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_delay_ms() -> u64 {
    500
}

fn default_scan_parallelism() -> usize {
    8
}

fn default_mark_to_market_secs() -> u64 {
    30
}

fn default_backtest_timeout_secs() -> u64 {
    3600
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_candle_cache_dir() -> String {
    "data/candles".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_account_seeds() -> Vec<PaperAccountSeed> {
    vec![PaperAccountSeed {
        name: "default".to_string(),
        initial_balance: dec!(10000),
        max_open_trades: 10,
        min_confidence: 0.70,
        auto_trading: true,
        sizing: PositionSizing::Fixed(dec!(100)),
    }]
}

// =============================================================================
// Indicator weights
// =============================================================================

/// Per-indicator weights for the signal scorer. The canonical total is 13.5;
/// confidence is score / total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorWeights {
    pub macd_cross: f64,
    pub rsi: f64,
    pub price_vs_ema50: f64,
    pub adx: f64,
    pub heikin_ashi: f64,
    pub volume: f64,
    pub ema_alignment: f64,
    pub di_cross: f64,
    pub bollinger_position: f64,
    pub atr_band: f64,
}

impl Default for IndicatorWeights {
    fn default() -> Self {
        Self {
            macd_cross: 2.0,
            rsi: 1.5,
            price_vs_ema50: 1.8,
            adx: 1.7,
            heikin_ashi: 1.6,
            volume: 1.4,
            ema_alignment: 1.2,
            di_cross: 1.0,
            bollinger_position: 0.8,
            atr_band: 0.5,
        }
    }
}

impl IndicatorWeights {
    /// Sum of all weights — the maximum reachable score.
    pub fn total(&self) -> f64 {
        self.macd_cross
            + self.rsi
            + self.price_vs_ema50
            + self.adx
            + self.heikin_ashi
            + self.volume
            + self.ema_alignment
            + self.di_cross
            + self.bollinger_position
            + self.atr_band
    }
}

// =============================================================================
// SignalEngineConfig
// =============================================================================

/// Immutable parameter block for the signal detection engine. Constructed
/// once and validated; invalid values are a startup failure, never a
/// runtime surprise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEngineConfig {
    /// Minimum confidence (score / max score) for a signal to be emitted.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// RSI band scored bullish for longs.
    #[serde(default = "default_long_rsi_min")]
    pub long_rsi_min: f64,
    #[serde(default = "default_long_rsi_max")]
    pub long_rsi_max: f64,

    /// RSI band scored bearish for shorts.
    #[serde(default = "default_short_rsi_min")]
    pub short_rsi_min: f64,
    #[serde(default = "default_short_rsi_max")]
    pub short_rsi_max: f64,

    /// Minimum ADX for the trend-strength predicate.
    #[serde(default = "default_adx_min")]
    pub long_adx_min: f64,
    #[serde(default = "default_adx_min")]
    pub short_adx_min: f64,

    /// Current volume must be at least this multiple of the 20-bar average.
    #[serde(default = "default_volume_multiplier")]
    pub long_volume_multiplier: f64,
    #[serde(default = "default_volume_multiplier")]
    pub short_volume_multiplier: f64,

    /// Stop-loss distance in ATR multiples.
    #[serde(default = "default_sl_atr_multiplier")]
    pub sl_atr_multiplier: f64,

    /// Take-profit distance in ATR multiples.
    #[serde(default = "default_tp_atr_multiplier")]
    pub tp_atr_multiplier: f64,

    /// Leverage applied to futures signals (spot is always 1).
    #[serde(default = "default_futures_leverage")]
    pub futures_leverage: u32,

    /// When true, SL/TP multipliers are overridden per symbol-volatility
    /// class. Off by default; backtests force it off regardless.
    #[serde(default)]
    pub use_volatility_aware: bool,

    #[serde(default)]
    pub weights: IndicatorWeights,
}

impl Default for SignalEngineConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            long_rsi_min: default_long_rsi_min(),
            long_rsi_max: default_long_rsi_max(),
            short_rsi_min: default_short_rsi_min(),
            short_rsi_max: default_short_rsi_max(),
            long_adx_min: default_adx_min(),
            short_adx_min: default_adx_min(),
            long_volume_multiplier: default_volume_multiplier(),
            short_volume_multiplier: default_volume_multiplier(),
            sl_atr_multiplier: default_sl_atr_multiplier(),
            tp_atr_multiplier: default_tp_atr_multiplier(),
            futures_leverage: default_futures_leverage(),
            use_volatility_aware: false,
            weights: IndicatorWeights::default(),
        }
    }
}

impl SignalEngineConfig {
    /// Validate the parameter invariants. Called at construction; a failure
    /// here is fatal at startup.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.min_confidence > 0.0 && self.min_confidence <= 1.0) {
            return Err(EngineError::Config(format!(
                "min_confidence must be in (0, 1], got {}",
                self.min_confidence
            )));
        }
        for (label, min, max) in [
            ("long", self.long_rsi_min, self.long_rsi_max),
            ("short", self.short_rsi_min, self.short_rsi_max),
        ] {
            if !(0.0..=100.0).contains(&min) || !(0.0..=100.0).contains(&max) || min >= max {
                return Err(EngineError::Config(format!(
                    "{label} RSI band must satisfy 0 <= min < max <= 100, got [{min}, {max}]"
                )));
            }
        }
        if self.long_adx_min < 0.0 || self.short_adx_min < 0.0 {
            return Err(EngineError::Config("ADX minimum must be >= 0".into()));
        }
        if self.long_volume_multiplier <= 0.0 || self.short_volume_multiplier <= 0.0 {
            return Err(EngineError::Config("volume multiplier must be > 0".into()));
        }
        if self.sl_atr_multiplier <= 0.0 || self.tp_atr_multiplier <= 0.0 {
            return Err(EngineError::Config(
                "SL and TP ATR multipliers must be > 0".into(),
            ));
        }
        if self.futures_leverage < 1 {
            return Err(EngineError::Config("futures leverage must be >= 1".into()));
        }
        if self.weights.total() <= 0.0 {
            return Err(EngineError::Config("indicator weights sum to zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Paper account seeds
// =============================================================================

/// Paper account created at first startup if absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperAccountSeed {
    pub name: String,
    pub initial_balance: Decimal,
    pub max_open_trades: u32,
    pub min_confidence: f64,
    pub auto_trading: bool,
    pub sizing: PositionSizing,
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level configuration bundle, loaded once at startup.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // --- Persistence ---------------------------------------------------------
    #[serde(default = "default_database_url")]
    pub database_url: String,

    // --- Exchange ------------------------------------------------------------
    #[serde(default = "default_spot_base_url")]
    pub spot_base_url: String,
    #[serde(default = "default_futures_base_url")]
    pub futures_base_url: String,

    /// Request-weight budget per 60 s window.
    #[serde(default = "default_spot_rate_limit")]
    pub spot_rate_limit: u32,
    #[serde(default = "default_futures_rate_limit")]
    pub futures_rate_limit: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bounded concurrency for batched kline fetches.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Quiet period between kline batches.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    // --- Scanner -------------------------------------------------------------
    /// Symbols evaluated concurrently inside one scan tick.
    #[serde(default = "default_scan_parallelism")]
    pub scan_parallelism: usize,

    /// The futures-5m track is heavy; off unless explicitly enabled.
    #[serde(default)]
    pub enable_futures_5m: bool,

    // --- Paper trading -------------------------------------------------------
    #[serde(default = "default_mark_to_market_secs")]
    pub mark_to_market_secs: u64,
    #[serde(default = "default_account_seeds")]
    pub paper_accounts: Vec<PaperAccountSeed>,

    // --- Backtest ------------------------------------------------------------
    #[serde(default = "default_backtest_timeout_secs")]
    pub backtest_timeout_secs: u64,
    #[serde(default = "default_candle_cache_dir")]
    pub candle_cache_dir: String,

    // --- Fan-out -------------------------------------------------------------
    /// Optional webhook POSTed every feed event (best effort).
    #[serde(default)]
    pub webhook_url: Option<String>,

    // --- Server / logging ----------------------------------------------------
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // --- Engine --------------------------------------------------------------
    #[serde(default)]
    pub engine: SignalEngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            spot_base_url: default_spot_base_url(),
            futures_base_url: default_futures_base_url(),
            spot_rate_limit: default_spot_rate_limit(),
            futures_rate_limit: default_futures_rate_limit(),
            request_timeout_secs: default_request_timeout_secs(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            scan_parallelism: default_scan_parallelism(),
            enable_futures_5m: false,
            mark_to_market_secs: default_mark_to_market_secs(),
            paper_accounts: default_account_seeds(),
            backtest_timeout_secs: default_backtest_timeout_secs(),
            candle_cache_dir: default_candle_cache_dir(),
            webhook_url: None,
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
            engine: SignalEngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path` and validate it.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.engine.validate()?;
        if config.spot_rate_limit == 0 || config.futures_rate_limit == 0 {
            anyhow::bail!("rate-limit budget must be positive");
        }
        if config.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }

        info!(
            path = %path.display(),
            database_url = %config.database_url,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}
