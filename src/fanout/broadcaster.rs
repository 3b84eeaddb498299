// =============================================================================
// Broadcaster — bounded event channel plus best-effort webhook
// =============================================================================
//
// A single producer side (scanner + paper-trading manager) publishes every
// feed event here. Each WebSocket subscriber owns a broadcast receiver and
// drains it in its own task; a subscriber that falls more than the channel
// capacity behind observes `Lagged` and is disconnected — freshness over
// completeness.
//
// The webhook POST runs on its own task so a slow endpoint can never block
// subscriber delivery.
// =============================================================================

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::webhook::WebhookSender;
use super::FeedEvent;

/// Events a subscriber may buffer before it is considered too slow.
pub const CHANNEL_CAPACITY: usize = 256;

pub struct Broadcaster {
    tx: broadcast::Sender<FeedEvent>,
    webhook: Option<Arc<WebhookSender>>,
}

impl Broadcaster {
    pub fn new(webhook: Option<WebhookSender>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            webhook: webhook.map(Arc::new),
        }
    }

    /// Subscribe a new consumer. Events published after this call are
    /// delivered in publish order.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }

    /// Current number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish one event to all subscribers and (best effort) the webhook.
    ///
    /// Callers persist the entity first; publishing is the last step.
    pub fn publish(&self, event: FeedEvent) {
        match self.tx.send(event.clone()) {
            Ok(receivers) => {
                debug!(event = ?event_name(&event), receivers, "event broadcast");
            }
            Err(_) => {
                // No live subscribers — normal during quiet periods.
                debug!(event = ?event_name(&event), "event broadcast with no subscribers");
            }
        }

        if let Some(webhook) = &self.webhook {
            let webhook = webhook.clone();
            tokio::spawn(async move {
                if let Err(e) = webhook.send(&event).await {
                    warn!(error = %e, "webhook delivery failed");
                }
            });
        }
    }
}

fn event_name(event: &FeedEvent) -> &'static str {
    match event {
        FeedEvent::SignalCreated { .. } => "signal_created",
        FeedEvent::SignalUpdated { .. } => "signal_updated",
        FeedEvent::SignalClosed { .. } => "signal_closed",
        FeedEvent::TradeOpened { .. } => "trade_opened",
        FeedEvent::TradeClosed { .. } => "trade_closed",
    }
}
