// =============================================================================
// WebSocket Handler — live feed subscribers
// =============================================================================
//
// Clients connect to `/ws` and drive a small frame protocol:
//
//   -> {"type":"subscribe","filters":{...}}    start receiving events
//   -> {"type":"unsubscribe"}                  stop receiving events
//   <-> {"type":"ping"} / {"type":"pong"}      heartbeat every 30 s
//
// Each connection owns its broadcast receiver and drains it in this task;
// events are delivered in publish order per entity. A subscriber that lags
// past the channel capacity is disconnected (freshness over completeness),
// and one that stops answering heartbeats is detected dead and removed.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::error::EngineError;
use crate::fanout::SubscriptionFilter;

/// Heartbeat cadence.
const HEARTBEAT: Duration = Duration::from_secs(30);
/// A connection silent for this long is considered dead.
const DEAD_AFTER: Duration = Duration::from_secs(90);

// =============================================================================
// Client frames
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Subscribe {
        #[serde(default)]
        filters: SubscriptionFilter,
    },
    Unsubscribe,
    Ping,
    Pong,
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

// =============================================================================
// Connection loop
// =============================================================================

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.broadcaster.subscribe();
    let mut filter: Option<SubscriptionFilter> = None;
    let mut last_seen = Instant::now();
    let mut heartbeat = interval(HEARTBEAT);

    loop {
        tokio::select! {
            // ── Feed events ─────────────────────────────────────────────
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Some(active) = &filter else { continue };
                        if !active.accepts(&event) {
                            continue;
                        }
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "event serialisation failed — dropped");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            debug!("WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber fell behind — disconnecting");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // ── Heartbeat ───────────────────────────────────────────────
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > DEAD_AFTER {
                    let reason = EngineError::DeadSubscriber(format!(
                        "no heartbeat for {} s",
                        last_seen.elapsed().as_secs()
                    ));
                    warn!("{reason} — disconnecting");
                    break;
                }
                let ping = r#"{"type":"ping"}"#;
                if sender.send(Message::Text(ping.into())).await.is_err() {
                    debug!("heartbeat send failed — disconnecting");
                    break;
                }
            }

            // ── Client frames ───────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Subscribe { filters }) => {
                                debug!(?filters, "subscriber filters set");
                                filter = Some(filters);
                            }
                            Ok(ClientFrame::Unsubscribe) => {
                                debug!("subscriber unsubscribed");
                                filter = None;
                            }
                            Ok(ClientFrame::Ping) => {
                                let pong = r#"{"type":"pong"}"#;
                                if sender.send(Message::Text(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientFrame::Pong) => {}
                            Err(e) => {
                                debug!(error = %e, "unparseable client frame ignored");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("binary frame ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_parses_with_filters() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"subscribe","filters":{"market":"Futures","min_confidence":0.8}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Subscribe { filters } => {
                assert_eq!(filters.market, Some(crate::types::MarketKind::Futures));
                assert_eq!(filters.min_confidence, Some(0.8));
                assert!(filters.symbols.is_none());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn subscribe_frame_defaults_to_match_all() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        match frame {
            ClientFrame::Subscribe { filters } => {
                assert!(filters.market.is_none());
                assert!(filters.direction.is_none());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn heartbeat_frames_parse() {
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"ping"}"#).unwrap(),
            ClientFrame::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"pong"}"#).unwrap(),
            ClientFrame::Pong
        ));
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"unsubscribe"}"#).unwrap(),
            ClientFrame::Unsubscribe
        ));
    }

    #[test]
    fn unknown_frame_is_an_error() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"order"}"#).is_err());
    }
}
