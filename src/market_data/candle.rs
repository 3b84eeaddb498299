// =============================================================================
// Candles — OHLCV samples and the per-track in-memory cache
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single closed OHLCV candle. Values are `f64` — the form the indicator
/// library consumes; decimal conversion happens only at signal-price
/// derivation and persistence boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// OHLC integrity: high >= max(open, close), min(open, close) >= low,
    /// low >= 0, all finite.
    pub fn is_well_formed(&self) -> bool {
        let vals = [self.open, self.high, self.low, self.close, self.volume];
        if vals.iter().any(|v| !v.is_finite()) {
            return false;
        }
        self.low >= 0.0
            && self.high >= self.open.max(self.close)
            && self.open.min(self.close) >= self.low
            && self.volume >= 0.0
    }
}

/// Validate a candle series: every bar well-formed and open times strictly
/// increasing. Returns the index of the first offending bar.
pub fn validate_series(candles: &[Candle]) -> Result<(), usize> {
    for (i, c) in candles.iter().enumerate() {
        if !c.is_well_formed() {
            return Err(i);
        }
        if i > 0 && c.open_time <= candles[i - 1].open_time {
            return Err(i);
        }
    }
    Ok(())
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// CandleCache -- thread-safe ring buffer per (symbol, timeframe)
// ---------------------------------------------------------------------------

/// Thread-safe ring buffer that stores the most recent closed candles per
/// `(symbol, timeframe)` pair for the duration of a scan window. Each scan
/// track is the single writer for its keys; readers may be concurrent.
pub struct CandleCache {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleCache {
    /// Create a cache that retains at most `max_candles` candles per key.
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Replace the series for `key` with a freshly fetched one, trimmed to
    /// the ring budget (newest candles win).
    pub fn replace(&self, key: CandleKey, candles: Vec<Candle>) {
        let mut map = self.buffers.write();
        let mut ring: VecDeque<Candle> = candles.into();
        while ring.len() > self.max_candles {
            ring.pop_front();
        }
        map.insert(key, ring);
    }

    /// Append a single closed candle, evicting the oldest past the budget.
    /// A candle with the same open time as the current newest replaces it.
    pub fn push(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        if let Some(last) = ring.back() {
            if last.open_time == candle.open_time {
                ring.pop_back();
            }
        }
        ring.push_back(candle);
        while ring.len() > self.max_candles {
            ring.pop_front();
        }
    }

    /// Return the most recent `count` candles (oldest-first order).
    pub fn get(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the most recent candle, if any.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| ring.back()).map(|c| c.close)
    }

    /// Number of candles stored for `key`.
    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
