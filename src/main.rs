// =============================================================================
// Nova Signal Engine — Main Entry Point
// =============================================================================
//
// Startup order matters: persistence first, then the exchange client and
// its rate limiters, then the detection engine and managers, and finally
// the periodic tasks (symbol sync, scan tracks, mark-to-market) plus the
// WebSocket feed server. Every signal is persisted before it is fanned out.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod backtest;
mod binance;
mod config;
mod error;
mod fanout;
mod indicators;
mod market_data;
mod paper;
mod persistence;
mod scanner;
mod signal;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::{BinanceClient, RateLimiter};
use crate::config::AppConfig;
use crate::fanout::{Broadcaster, WebhookSender};
use crate::market_data::CandleCache;
use crate::paper::PaperTradingManager;
use crate::persistence::{Repository, SqliteRepository};
use crate::scanner::{default_tracks, sync_symbols, Scanner};
use crate::signal::SignalEngine;
use crate::types::{new_id, MarketKind, PaperAccount};

const CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config_result = AppConfig::load(CONFIG_PATH);

    let mut config = match &config_result {
        Ok(config) => config.clone(),
        Err(_) => AppConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    if let Err(e) = config_result {
        warn!(error = %e, "failed to load config — using defaults");
    }

    // Env overrides for deployment knobs.
    if let Ok(url) = std::env::var("NOVA_DATABASE_URL") {
        config.database_url = url;
    }
    if let Ok(addr) = std::env::var("NOVA_BIND_ADDR") {
        config.bind_addr = addr;
    }

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Nova Signal Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Persistence ───────────────────────────────────────────────────
    let repo: Arc<dyn Repository> =
        Arc::new(SqliteRepository::connect(&config.database_url).await?);

    seed_paper_accounts(&config, repo.as_ref()).await?;

    // ── 3. Exchange client & rate limiters ───────────────────────────────
    let spot_limiter = Arc::new(RateLimiter::new(config.spot_rate_limit));
    let futures_limiter = Arc::new(RateLimiter::new(config.futures_rate_limit));
    let client = Arc::new(BinanceClient::new(
        &config.spot_base_url,
        &config.futures_base_url,
        std::time::Duration::from_secs(config.request_timeout_secs),
        spot_limiter,
        futures_limiter,
    )?);

    // ── 4. Fan-out ───────────────────────────────────────────────────────
    let webhook = match &config.webhook_url {
        Some(url) => Some(WebhookSender::new(
            url.clone(),
            std::time::Duration::from_secs(config.request_timeout_secs),
        )?),
        None => None,
    };
    let broadcaster = Arc::new(Broadcaster::new(webhook));

    // ── 5. Engine & managers ─────────────────────────────────────────────
    let engine = Arc::new(SignalEngine::new(config.engine.clone(), repo.clone())?);
    let paper = Arc::new(PaperTradingManager::new(repo.clone(), broadcaster.clone()));
    let candle_cache = Arc::new(CandleCache::new(500));

    let state = Arc::new(AppState::new(
        config.clone(),
        repo.clone(),
        client.clone(),
        engine.clone(),
        broadcaster.clone(),
        paper.clone(),
        candle_cache.clone(),
    ));

    // ── 6. Symbol sync (startup + daily) ─────────────────────────────────
    for market in [MarketKind::Spot, MarketKind::Futures] {
        match sync_symbols(&client, repo.as_ref(), market).await {
            Ok(summary) => info!(market = %market, listed = summary.listed, "initial symbol sync"),
            Err(e) => warn!(market = %market, error = %e, "initial symbol sync failed"),
        }
    }

    let sync_client = client.clone();
    let sync_repo = repo.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(24 * 3600));
        interval.tick().await; // the startup sync just ran
        loop {
            interval.tick().await;
            for market in [MarketKind::Spot, MarketKind::Futures] {
                if let Err(e) = sync_symbols(&sync_client, sync_repo.as_ref(), market).await {
                    warn!(market = %market, error = %e, "daily symbol sync failed");
                }
            }
        }
    });

    // ── 7. Scan tracks ───────────────────────────────────────────────────
    let scanner = Arc::new(Scanner::new(
        &config,
        client.clone(),
        engine.clone(),
        repo.clone(),
        broadcaster.clone(),
        paper.clone(),
        candle_cache.clone(),
        state.recent_summaries.clone(),
    ));

    let tracks = default_tracks(config.enable_futures_5m);
    info!(count = tracks.len(), "launching scan tracks");
    for track in tracks {
        tokio::spawn(scanner.clone().run_track(track));
    }

    // ── 8. Mark-to-market loop ───────────────────────────────────────────
    let mtm_paper = paper.clone();
    let mtm_client = client.clone();
    let mtm_secs = config.mark_to_market_secs;
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(mtm_secs.max(1)));
        loop {
            interval.tick().await;
            if let Err(e) = mtm_paper.mark_to_market(&mtm_client).await {
                warn!(error = %e, "mark-to-market pass failed");
            }
        }
    });

    // ── 9. Backtest worker ───────────────────────────────────────────────
    // The control surface only creates PENDING runs; this worker drains
    // them in submission order, one at a time.
    let bt_executor = backtest::BacktestExecutor::new(
        repo.clone(),
        Some(std::path::PathBuf::from(&config.candle_cache_dir)),
        std::time::Duration::from_secs(config.backtest_timeout_secs),
    );
    let bt_repo = repo.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let pending = match bt_repo
                .list_backtest_runs(crate::types::BacktestStatus::Pending)
                .await
            {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(error = %e, "backtest queue poll failed");
                    continue;
                }
            };
            for run in pending {
                if let Err(e) = bt_executor.execute(&run.id).await {
                    warn!(run_id = %run.id, error = %e, "backtest execution failed");
                }
            }
        }
    });

    // ── 10. Feed server ──────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind feed server");
                return;
            }
        };
        info!(addr = %bind_addr, "feed server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "feed server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");
    info!("Nova Signal Engine shut down complete.");
    Ok(())
}

/// Create the configured paper accounts on first start. Existing accounts
/// (matched by name) are left untouched.
async fn seed_paper_accounts(config: &AppConfig, repo: &dyn Repository) -> anyhow::Result<()> {
    for seed in &config.paper_accounts {
        if repo.get_account_by_name(&seed.name).await?.is_some() {
            continue;
        }
        let account = PaperAccount {
            id: new_id(),
            name: seed.name.clone(),
            initial_balance: seed.initial_balance,
            current_balance: seed.initial_balance,
            max_open_trades: seed.max_open_trades,
            min_confidence: seed.min_confidence,
            auto_trading: seed.auto_trading,
            sizing: seed.sizing.clone(),
        };
        repo.insert_account(&account).await?;
        info!(
            name = %account.name,
            balance = %account.initial_balance,
            "paper account seeded"
        );
    }
    Ok(())
}
