// =============================================================================
// Classified engine errors
// =============================================================================
//
// Every fallible boundary in the engine surfaces one of these kinds so that
// callers can decide retry / skip / abort without string matching:
//
//   Config            fatal at startup
//   TransientExchange retried with backoff (timeout, 5xx, 429)
//   PermanentExchange not retried (other 4xx, invalid symbol)
//   InsufficientData  not an error at the signal layer (action = none)
//   Persistence       surfaced to caller; scan continues with next symbol
//   DuplicateSignal   raced dedup; the new signal is suppressed
//   ConcurrentUpdate  optimistic-lock miss; retried once then skipped
//   DeadSubscriber    subscriber removed from the fan-out registry
// =============================================================================

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Timeout, HTTP 5xx, or HTTP 429. `retry_after` carries the server's
    /// Retry-After hint when one was present.
    #[error("transient exchange error: {message}")]
    TransientExchange {
        message: String,
        retry_after: Option<Duration>,
    },

    /// HTTP 4xx other than 429, or an invalid symbol.
    #[error("permanent exchange error: {0}")]
    PermanentExchange(String),

    #[error("insufficient data: have {have} candles, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("duplicate signal suppressed for {symbol} {direction} {timeframe}")]
    DuplicateSignal {
        symbol: String,
        direction: String,
        timeframe: String,
    },

    #[error("concurrent update rejected for {entity} {id}")]
    ConcurrentUpdate { entity: &'static str, id: String },

    #[error("dead subscriber: {0}")]
    DeadSubscriber(String),
}

impl EngineError {
    /// Whether the operation may be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientExchange { .. })
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientExchange {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn persistence(message: impl std::fmt::Display) -> Self {
        Self::Persistence(message.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
