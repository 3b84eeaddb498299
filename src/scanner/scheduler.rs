// =============================================================================
// Scanner Scheduler — periodic fan-out of the signal engine over the universe
// =============================================================================
//
// One long-lived task per track. Each iteration sleeps to the track's next
// aligned tick, then runs the tick under a deadline equal to the cadence —
// a tick that cannot finish in time is cut off and reports partial results,
// and the next tick is never queued behind a running one.
//
// Per-tick algorithm:
//   1. Load the market's active symbols (volume-ordered).
//   2. Batch-fetch klines with bounded concurrency.
//   3. Evaluate each symbol through the signal engine (bounded parallelism);
//      fan out created/updated/expired events and trigger paper trading.
//   4. Re-check SL/TP/expiry on the market's remaining ACTIVE signals.
//   5. Record a per-track summary.
//
// A single symbol's failure never aborts its tick.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::binance::BinanceClient;
use crate::config::AppConfig;
use crate::fanout::{Broadcaster, FeedEvent};
use crate::market_data::{Candle, CandleCache, CandleKey};
use crate::paper::PaperTradingManager;
use crate::persistence::{ActiveSignalFilter, Repository};
use crate::signal::{lifecycle, SignalAction, SignalEngine};

use super::tracks::ScanTrack;

/// Counters for one completed (or deadline-cut) tick.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TrackSummary {
    pub track: String,
    pub scanned: usize,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub expired: usize,
    pub cancelled: usize,
    pub skipped_dup: usize,
    pub skipped_priority: usize,
    pub closed_by_lifecycle: usize,
    pub errors: usize,
    pub partial: bool,
    pub wall_ms: u64,
}

pub struct Scanner {
    client: Arc<BinanceClient>,
    engine: Arc<SignalEngine>,
    repo: Arc<dyn Repository>,
    broadcaster: Arc<Broadcaster>,
    paper: Arc<PaperTradingManager>,
    cache: Arc<CandleCache>,
    batch_size: usize,
    batch_delay: std::time::Duration,
    scan_parallelism: usize,
    /// Shared per-tick summary ring (read by the status surface).
    summaries: Arc<parking_lot::RwLock<Vec<TrackSummary>>>,
}

/// Summaries retained in the shared ring.
const MAX_SUMMARIES: usize = 100;

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &AppConfig,
        client: Arc<BinanceClient>,
        engine: Arc<SignalEngine>,
        repo: Arc<dyn Repository>,
        broadcaster: Arc<Broadcaster>,
        paper: Arc<PaperTradingManager>,
        cache: Arc<CandleCache>,
        summaries: Arc<parking_lot::RwLock<Vec<TrackSummary>>>,
    ) -> Self {
        Self {
            client,
            engine,
            repo,
            broadcaster,
            paper,
            cache,
            batch_size: config.batch_size,
            batch_delay: std::time::Duration::from_millis(config.batch_delay_ms),
            scan_parallelism: config.scan_parallelism.max(1),
            summaries,
        }
    }

    /// Drive one track forever. Spawned once per track at startup.
    pub async fn run_track(self: Arc<Self>, track: ScanTrack) {
        info!(
            track = track.name,
            cadence_secs = track.cadence_secs,
            "scan track scheduled"
        );

        loop {
            let delay = track.next_tick_delay(Utc::now());
            tokio::time::sleep(delay).await;

            // The cadence doubles as the tick deadline: a slow tick is cut
            // off with partial results instead of overlapping the next one.
            let started = std::time::Instant::now();
            let summary = match tokio::time::timeout(track.cadence(), self.scan_tick(&track)).await
            {
                Ok(summary) => summary,
                Err(_) => {
                    warn!(track = track.name, "tick hit its deadline — partial results");
                    TrackSummary {
                        track: track.name.to_string(),
                        partial: true,
                        wall_ms: started.elapsed().as_millis() as u64,
                        ..Default::default()
                    }
                }
            };

            info!(
                track = %summary.track,
                scanned = summary.scanned,
                created = summary.created,
                updated = summary.updated,
                expired = summary.expired,
                cancelled = summary.cancelled,
                skipped_dup = summary.skipped_dup,
                closed = summary.closed_by_lifecycle,
                errors = summary.errors,
                partial = summary.partial,
                wall_ms = summary.wall_ms,
                "scan tick complete"
            );

            let mut ring = self.summaries.write();
            ring.push(summary);
            while ring.len() > MAX_SUMMARIES {
                ring.remove(0);
            }
        }
    }

    /// Execute a single tick for `track`. Public so the control surface can
    /// trigger a manual scan of any (market, timeframe) track.
    pub async fn scan_tick(&self, track: &ScanTrack) -> TrackSummary {
        let started = std::time::Instant::now();
        let mut summary = TrackSummary {
            track: track.name.to_string(),
            ..Default::default()
        };

        // ── 1. Universe, volume-ordered ─────────────────────────────────
        let symbols = match self.repo.list_active_symbols(track.market).await {
            Ok(symbols) => symbols,
            Err(e) => {
                warn!(track = track.name, error = %e, "symbol list unavailable — tick skipped");
                summary.errors += 1;
                summary.wall_ms = started.elapsed().as_millis() as u64;
                return summary;
            }
        };
        let names: Vec<String> = symbols.iter().map(|s| s.name.clone()).collect();
        summary.scanned = names.len();

        // ── 2. Batched kline fetch ──────────────────────────────────────
        let klines = self
            .client
            .batch_get_klines(
                track.market,
                &names,
                track.timeframe,
                track.kline_limit,
                self.batch_size,
                self.batch_delay,
            )
            .await;
        summary.fetched = klines.len();

        // ── 3. Evaluate symbols with bounded parallelism ────────────────
        let entries: Vec<(String, Vec<Candle>)> = klines.into_iter().collect();
        for chunk in entries.chunks(self.scan_parallelism) {
            let evals = chunk.iter().map(|(symbol, candles)| {
                self.evaluate_symbol(track, symbol.clone(), candles.clone())
            });
            for outcome in join_all(evals).await {
                match outcome {
                    Ok(report) => {
                        match report.action {
                            SignalAction::Created(_) => summary.created += 1,
                            SignalAction::UpdatedPrice(_) => summary.updated += 1,
                            SignalAction::Expired(_) => summary.expired += 1,
                            SignalAction::None => {}
                        }
                        summary.expired += report.expired_opposite.len();
                        summary.cancelled += report.cancelled_lower;
                        if report.suppressed_duplicate {
                            summary.skipped_dup += 1;
                        }
                        if report.suppressed_priority {
                            summary.skipped_priority += 1;
                        }
                    }
                    Err(()) => summary.errors += 1,
                }
            }
        }

        // ── 4. Lifecycle pass over remaining ACTIVE signals ─────────────
        match self.lifecycle_pass(track).await {
            Ok(closed) => summary.closed_by_lifecycle = closed,
            Err(e) => {
                warn!(track = track.name, error = %e, "lifecycle pass failed");
                summary.errors += 1;
            }
        }

        summary.wall_ms = started.elapsed().as_millis() as u64;
        summary
    }

    /// Evaluate one symbol: cache its candles, run the engine, fan out.
    /// Per-symbol failures are contained here.
    async fn evaluate_symbol(
        &self,
        track: &ScanTrack,
        symbol: String,
        candles: Vec<Candle>,
    ) -> std::result::Result<crate::signal::ProcessReport, ()> {
        let key = CandleKey {
            symbol: symbol.clone(),
            timeframe: track.timeframe,
        };
        self.cache.replace(key, candles.clone());

        let report = match self
            .engine
            .process_symbol(&symbol, track.market, track.timeframe, &candles)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                // Logged and retried naturally on the next tick.
                warn!(symbol = %symbol, track = track.name, error = %e, "symbol evaluation failed");
                return Err(());
            }
        };

        for expired in &report.expired_opposite {
            self.broadcaster.publish(FeedEvent::SignalClosed {
                signal: expired.clone(),
            });
        }

        match &report.action {
            SignalAction::Created(signal) => {
                // Persistence already happened inside the engine; fan out,
                // then let paper trading react.
                self.broadcaster.publish(FeedEvent::SignalCreated {
                    signal: signal.clone(),
                });
                if let Err(e) = self.paper.on_signal_created(signal).await {
                    warn!(signal_id = %signal.id, error = %e, "paper auto-open failed");
                }
            }
            SignalAction::UpdatedPrice(signal) => {
                self.broadcaster.publish(FeedEvent::SignalUpdated {
                    signal: signal.clone(),
                });
            }
            SignalAction::Expired(signal) => {
                self.broadcaster.publish(FeedEvent::SignalClosed {
                    signal: signal.clone(),
                });
            }
            SignalAction::None => {}
        }

        Ok(report)
    }

    /// Re-evaluate SL/TP/expiry for the track's ACTIVE signals using the
    /// latest cached candle. Returns how many signals reached a terminal
    /// state.
    async fn lifecycle_pass(&self, track: &ScanTrack) -> crate::error::Result<usize> {
        let active = self
            .repo
            .list_active_signals(&ActiveSignalFilter {
                symbol: None,
                direction: None,
                market: Some(track.market),
                timeframe: Some(track.timeframe),
            })
            .await?;

        let now = Utc::now();
        let mut closed = 0;

        for signal in active {
            let key = CandleKey {
                symbol: signal.symbol.clone(),
                timeframe: signal.timeframe,
            };
            let Some(latest) = self.cache.get(&key, 1).into_iter().next() else {
                continue; // symbol not scanned this tick
            };

            match lifecycle::apply(self.repo.as_ref(), &signal, &latest, now).await {
                Ok(outcome) => {
                    if let Some(status) = outcome.terminal_status() {
                        let mut updated = signal.clone();
                        updated.status = status;
                        self.broadcaster
                            .publish(FeedEvent::SignalClosed { signal: updated });
                        closed += 1;
                    }
                }
                Err(e) => {
                    debug!(id = %signal.id, error = %e, "lifecycle transition skipped");
                }
            }
        }

        Ok(closed)
    }
}
