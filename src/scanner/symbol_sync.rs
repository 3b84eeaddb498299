// =============================================================================
// Symbol sync — idempotent upsert of the symbol universe
// =============================================================================
//
// Runs daily (and on demand), separately from scan ticks:
//   1. Pull the tradable USDT pairs for the market from exchangeInfo.
//   2. Upsert each (create if absent; refresh active/exchange flags).
//   3. Deactivate known symbols that dropped out of the fresh listing —
//      symbols are never deleted.
//   4. Refresh the cached 24 h quote volumes used for scan ordering.
//
// Running it twice produces the same symbol table as running it once.
// =============================================================================

use std::collections::HashSet;

use tracing::{info, warn};

use crate::binance::BinanceClient;
use crate::error::Result;
use crate::persistence::Repository;
use crate::types::{MarketKind, SymbolRecord};

const EXCHANGE_NAME: &str = "binance";

/// Counters from one sync pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncSummary {
    pub listed: usize,
    pub upserted: usize,
    pub deactivated: usize,
    pub volumes_refreshed: usize,
}

/// Synchronise one market's symbol table against the exchange.
pub async fn sync_symbols(
    client: &BinanceClient,
    repo: &dyn Repository,
    market: MarketKind,
) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();

    let listed = client.list_usdt_pairs(market).await?;
    summary.listed = listed.len();
    let fresh: HashSet<&str> = listed.iter().map(String::as_str).collect();

    for name in &listed {
        repo.upsert_symbol(&SymbolRecord {
            name: name.clone(),
            market,
            active: true,
            exchange: EXCHANGE_NAME.to_string(),
            quote_volume_24h: 0.0,
        })
        .await?;
        summary.upserted += 1;
    }

    // Anything we know as active but the exchange no longer lists gets
    // deactivated, never deleted.
    for known in repo.list_active_symbols(market).await? {
        if !fresh.contains(known.name.as_str()) {
            repo.upsert_symbol(&SymbolRecord {
                active: false,
                ..known
            })
            .await?;
            summary.deactivated += 1;
        }
    }

    match client.get_24h_volumes(market, &listed).await {
        Ok(volumes) => {
            for (symbol, volume) in volumes {
                repo.update_symbol_volume(&symbol, market, volume).await?;
                summary.volumes_refreshed += 1;
            }
        }
        Err(e) => {
            // Stale ordering volumes are tolerable; the table itself is fresh.
            warn!(market = %market, error = %e, "24h volume refresh failed");
        }
    }

    info!(
        market = %market,
        listed = summary.listed,
        upserted = summary.upserted,
        deactivated = summary.deactivated,
        volumes = summary.volumes_refreshed,
        "symbol sync complete"
    );
    Ok(summary)
}
