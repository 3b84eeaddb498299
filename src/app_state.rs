// =============================================================================
// Central Application State — Nova Signal Engine
// =============================================================================
//
// Ties the long-lived components together for the tasks spawned in main and
// the WebSocket/status surface. Components manage their own interior
// mutability; AppState itself only owns the scan-summary ring.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::binance::BinanceClient;
use crate::config::AppConfig;
use crate::fanout::Broadcaster;
use crate::market_data::CandleCache;
use crate::paper::PaperTradingManager;
use crate::persistence::Repository;
use crate::scanner::TrackSummary;
use crate::signal::SignalEngine;

pub struct AppState {
    pub config: AppConfig,
    pub repo: Arc<dyn Repository>,
    pub client: Arc<BinanceClient>,
    pub engine: Arc<SignalEngine>,
    pub broadcaster: Arc<Broadcaster>,
    pub paper: Arc<PaperTradingManager>,
    pub candle_cache: Arc<CandleCache>,

    /// Shared with the scanner, which appends a summary per finished tick.
    pub recent_summaries: Arc<RwLock<Vec<TrackSummary>>>,
    pub start_time: std::time::Instant,
}

/// Status payload for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub subscribers: usize,
    pub recent_scans: Vec<TrackSummary>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        repo: Arc<dyn Repository>,
        client: Arc<BinanceClient>,
        engine: Arc<SignalEngine>,
        broadcaster: Arc<Broadcaster>,
        paper: Arc<PaperTradingManager>,
        candle_cache: Arc<CandleCache>,
    ) -> Self {
        Self {
            config,
            repo,
            client,
            engine,
            broadcaster,
            paper,
            candle_cache,
            recent_summaries: Arc::new(RwLock::new(Vec::new())),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            subscribers: self.broadcaster.subscriber_count(),
            recent_scans: self.recent_summaries.read().clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::RateLimiter;
    use crate::persistence::MemoryRepository;

    fn test_state() -> AppState {
        let config = AppConfig::default();
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let spot = Arc::new(RateLimiter::new(config.spot_rate_limit));
        let futures = Arc::new(RateLimiter::new(config.futures_rate_limit));
        let client = Arc::new(
            BinanceClient::new(
                &config.spot_base_url,
                &config.futures_base_url,
                std::time::Duration::from_secs(config.request_timeout_secs),
                spot,
                futures,
            )
            .unwrap(),
        );
        let broadcaster = Arc::new(Broadcaster::new(None));
        let engine =
            Arc::new(SignalEngine::new(config.engine.clone(), repo.clone()).unwrap());
        let paper = Arc::new(PaperTradingManager::new(repo.clone(), broadcaster.clone()));
        let cache = Arc::new(CandleCache::new(500));
        AppState::new(config, repo, client, engine, broadcaster, paper, cache)
    }

    #[test]
    fn snapshot_reflects_state() {
        let state = test_state();
        state.recent_summaries.write().push(TrackSummary {
            track: "spot-5m".into(),
            created: 2,
            ..Default::default()
        });
        let snap = state.snapshot();
        assert_eq!(snap.recent_scans.len(), 1);
        assert_eq!(snap.recent_scans[0].created, 2);
        assert_eq!(snap.subscribers, 0);
    }
}
