// =============================================================================
// Real-time fan-out — feed events and subscription filters
// =============================================================================

pub mod broadcaster;
pub mod webhook;

pub use broadcaster::Broadcaster;
pub use webhook::WebhookSender;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::{Direction, MarketKind, PaperTrade, Signal};

/// One event on the live feed. Carries the full entity payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    SignalCreated { signal: Signal },
    SignalUpdated { signal: Signal },
    SignalClosed { signal: Signal },
    TradeOpened { trade: PaperTrade },
    TradeClosed { trade: PaperTrade },
}

impl FeedEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::SignalCreated { signal }
            | Self::SignalUpdated { signal }
            | Self::SignalClosed { signal } => &signal.symbol,
            Self::TradeOpened { trade } | Self::TradeClosed { trade } => &trade.symbol,
        }
    }

    pub fn market(&self) -> MarketKind {
        match self {
            Self::SignalCreated { signal }
            | Self::SignalUpdated { signal }
            | Self::SignalClosed { signal } => signal.market,
            Self::TradeOpened { trade } | Self::TradeClosed { trade } => trade.market,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::SignalCreated { signal }
            | Self::SignalUpdated { signal }
            | Self::SignalClosed { signal } => signal.direction,
            Self::TradeOpened { trade } | Self::TradeClosed { trade } => trade.direction,
        }
    }

    /// Signal confidence where the event carries one.
    pub fn confidence(&self) -> Option<f64> {
        match self {
            Self::SignalCreated { signal }
            | Self::SignalUpdated { signal }
            | Self::SignalClosed { signal } => Some(signal.confidence),
            Self::TradeOpened { .. } | Self::TradeClosed { .. } => None,
        }
    }
}

/// Per-subscriber filter. Empty/absent fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub market: Option<MarketKind>,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub symbols: Option<HashSet<String>>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

impl SubscriptionFilter {
    /// Whether this subscriber should receive `event`.
    pub fn accepts(&self, event: &FeedEvent) -> bool {
        if let Some(market) = self.market {
            if event.market() != market {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            if event.direction() != direction {
                return false;
            }
        }
        if let Some(symbols) = &self.symbols {
            if !symbols.is_empty() && !symbols.contains(event.symbol()) {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            // Trade events carry no confidence and pass this check.
            if let Some(confidence) = event.confidence() {
                if confidence < min {
                    return false;
                }
            }
        }
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{new_id, SignalStatus, Timeframe, TradingStyle};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn event(symbol: &str, market: MarketKind, direction: Direction, confidence: f64) -> FeedEvent {
        FeedEvent::SignalCreated {
            signal: Signal {
                id: new_id(),
                symbol: symbol.into(),
                market,
                direction,
                timeframe: Timeframe::H1,
                entry_price: dec!(100),
                stop_loss: dec!(95),
                take_profit: dec!(110),
                confidence,
                status: SignalStatus::Active,
                trading_style: TradingStyle::Day,
                estimated_duration_hours: 6.0,
                leverage: 1,
                risk_reward: 2.0,
                description: String::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        }
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let filter = SubscriptionFilter::default();
        assert!(filter.accepts(&event("BTCUSDT", MarketKind::Spot, Direction::Long, 0.7)));
        assert!(filter.accepts(&event("ETHUSDT", MarketKind::Futures, Direction::Short, 0.1)));
    }

    #[test]
    fn market_and_direction_filters() {
        let filter = SubscriptionFilter {
            market: Some(MarketKind::Futures),
            direction: Some(Direction::Short),
            ..Default::default()
        };
        assert!(filter.accepts(&event("BTCUSDT", MarketKind::Futures, Direction::Short, 0.8)));
        assert!(!filter.accepts(&event("BTCUSDT", MarketKind::Spot, Direction::Short, 0.8)));
        assert!(!filter.accepts(&event("BTCUSDT", MarketKind::Futures, Direction::Long, 0.8)));
    }

    #[test]
    fn symbol_set_filter() {
        let filter = SubscriptionFilter {
            symbols: Some(["BTCUSDT".to_string()].into_iter().collect()),
            ..Default::default()
        };
        assert!(filter.accepts(&event("BTCUSDT", MarketKind::Spot, Direction::Long, 0.8)));
        assert!(!filter.accepts(&event("ETHUSDT", MarketKind::Spot, Direction::Long, 0.8)));
    }

    #[test]
    fn min_confidence_filter() {
        let filter = SubscriptionFilter {
            min_confidence: Some(0.75),
            ..Default::default()
        };
        assert!(filter.accepts(&event("BTCUSDT", MarketKind::Spot, Direction::Long, 0.80)));
        assert!(filter.accepts(&event("BTCUSDT", MarketKind::Spot, Direction::Long, 0.75)));
        assert!(!filter.accepts(&event("BTCUSDT", MarketKind::Spot, Direction::Long, 0.74)));
    }

    #[test]
    fn event_json_is_tagged() {
        let e = event("BTCUSDT", MarketKind::Spot, Direction::Long, 0.8);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "signal_created");
        assert_eq!(json["signal"]["symbol"], "BTCUSDT");
    }
}
