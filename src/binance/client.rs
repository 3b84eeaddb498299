// =============================================================================
// Binance REST API Client — public market-data endpoints, spot + futures
// =============================================================================
//
// Only unauthenticated read endpoints are used (exchangeInfo, klines,
// ticker/24hr, ticker/price); no request signing is needed. Each market has
// its own base URL, connection pool, and request budget. The pool is owned
// by the client value and released on drop on every exit path.
//
// Failure semantics: timeouts, 5xx, and 429 retry with exponential backoff
// up to 3 attempts, honouring any Retry-After hint; other 4xx fail as
// permanent errors. Batch operations never abort siblings — failed symbols
// are logged and omitted from the result map.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, Result};
use crate::market_data::Candle;
use crate::types::{MarketKind, Timeframe};

use super::rate_limit::RateLimiter;

/// Maximum attempts for transient failures.
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff doubled per attempt.
const BACKOFF_BASE_MS: u64 = 500;

struct MarketEndpoint {
    base_url: String,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

/// Binance REST client covering both markets behind one interface.
pub struct BinanceClient {
    spot: MarketEndpoint,
    futures: MarketEndpoint,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Build clients for both markets. The limiters are created once at
    /// startup and shared process-wide.
    pub fn new(
        spot_base_url: &str,
        futures_base_url: &str,
        request_timeout: std::time::Duration,
        spot_limiter: Arc<RateLimiter>,
        futures_limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let build = |base_url: &str, limiter: Arc<RateLimiter>| -> Result<MarketEndpoint> {
            let http = reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .map_err(|e| EngineError::Config(format!("failed to build http client: {e}")))?;
            Ok(MarketEndpoint {
                base_url: base_url.trim_end_matches('/').to_string(),
                http,
                limiter,
            })
        };

        Ok(Self {
            spot: build(spot_base_url, spot_limiter)?,
            futures: build(futures_base_url, futures_limiter)?,
        })
    }

    fn endpoint(&self, market: MarketKind) -> &MarketEndpoint {
        match market {
            MarketKind::Spot => &self.spot,
            MarketKind::Futures => &self.futures,
        }
    }

    /// API path prefix per market.
    fn api_prefix(market: MarketKind) -> &'static str {
        match market {
            MarketKind::Spot => "/api/v3",
            MarketKind::Futures => "/fapi/v1",
        }
    }

    /// Binance weight of a kline request by its `limit`.
    pub fn kline_weight(limit: u32) -> u32 {
        match limit {
            0..=100 => 1,
            101..=500 => 2,
            501..=1000 => 5,
            _ => 10,
        }
    }

    // -------------------------------------------------------------------------
    // Core request path
    // -------------------------------------------------------------------------

    /// Perform one GET with rate limiting, retry, and error classification.
    async fn get_json(
        &self,
        market: MarketKind,
        path_and_query: &str,
        weight: u32,
    ) -> Result<serde_json::Value> {
        let endpoint = self.endpoint(market);
        let url = format!("{}{}", endpoint.base_url, path_and_query);

        let mut attempt = 0;
        loop {
            attempt += 1;
            endpoint.limiter.acquire(weight).await;

            match self.try_get_json(endpoint, &url).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let hint = match &e {
                        EngineError::TransientExchange { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    let backoff = hint.unwrap_or_else(|| {
                        std::time::Duration::from_millis(BACKOFF_BASE_MS * (1 << (attempt - 1)))
                    });
                    warn!(
                        url = %url,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient exchange error — retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_get_json(
        &self,
        endpoint: &MarketEndpoint,
        url: &str,
    ) -> Result<serde_json::Value> {
        let resp = endpoint.http.get(url).send().await.map_err(|e| {
            // Timeouts and connection failures are retryable.
            EngineError::transient(format!("request to {url} failed: {e}"))
        })?;

        endpoint.limiter.update_from_headers(resp.headers());

        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| EngineError::transient(format!("failed to parse response: {e}")));
        }

        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(std::time::Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();

        if status.as_u16() == 429 || status.is_server_error() {
            Err(EngineError::TransientExchange {
                message: format!("{url} returned {status}: {body}"),
                retry_after,
            })
        } else {
            Err(EngineError::PermanentExchange(format!(
                "{url} returned {status}: {body}"
            )))
        }
    }

    // -------------------------------------------------------------------------
    // Exchange metadata
    // -------------------------------------------------------------------------

    /// Symbols whose quote asset is USDT and whose trading status is active.
    /// On futures, only USDT-margined perpetuals qualify.
    #[instrument(skip(self), name = "binance::list_usdt_pairs")]
    pub async fn list_usdt_pairs(&self, market: MarketKind) -> Result<Vec<String>> {
        let path = format!("{}/exchangeInfo", Self::api_prefix(market));
        let body = self.get_json(market, &path, 10).await?;

        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| EngineError::PermanentExchange("exchangeInfo missing symbols".into()))?;

        let pairs = filter_usdt_pairs(symbols, market);
        debug!(market = %market, count = pairs.len(), "USDT pairs listed");
        Ok(pairs)
    }

    /// 24-hour quote volume per symbol (one bulk request).
    #[instrument(skip(self, symbols), name = "binance::get_24h_volumes")]
    pub async fn get_24h_volumes(
        &self,
        market: MarketKind,
        symbols: &[String],
    ) -> Result<HashMap<String, f64>> {
        let path = format!("{}/ticker/24hr", Self::api_prefix(market));
        // The unfiltered 24hr ticker is the heaviest public endpoint.
        let body = self.get_json(market, &path, 40).await?;

        let wanted: std::collections::HashSet<&str> =
            symbols.iter().map(String::as_str).collect();

        let mut volumes = HashMap::new();
        if let Some(entries) = body.as_array() {
            for entry in entries {
                let Some(symbol) = entry["symbol"].as_str() else {
                    continue;
                };
                if !wanted.contains(symbol) {
                    continue;
                }
                if let Ok(vol) = parse_str_f64(&entry["quoteVolume"]) {
                    volumes.insert(symbol.to_string(), vol);
                }
            }
        }

        debug!(market = %market, count = volumes.len(), "24h volumes fetched");
        Ok(volumes)
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    /// Ordered candle sequence, newest last.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        market: MarketKind,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let path = format!(
            "{}/klines?symbol={}&interval={}&limit={}",
            Self::api_prefix(market),
            symbol,
            timeframe.as_str(),
            limit
        );
        let body = self
            .get_json(market, &path, Self::kline_weight(limit))
            .await?;

        let candles = parse_klines(&body)?;
        debug!(symbol, timeframe = %timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// Fetch klines for many symbols with bounded concurrency: `batch_size`
    /// requests in flight per batch, `batch_delay` quiet period between
    /// batches. Failed symbols are omitted from the result.
    pub async fn batch_get_klines(
        &self,
        market: MarketKind,
        symbols: &[String],
        timeframe: Timeframe,
        limit: u32,
        batch_size: usize,
        batch_delay: std::time::Duration,
    ) -> HashMap<String, Vec<Candle>> {
        let mut results = HashMap::new();
        let batch_size = batch_size.max(1);

        for (i, chunk) in symbols.chunks(batch_size).enumerate() {
            if i > 0 && !batch_delay.is_zero() {
                tokio::time::sleep(batch_delay).await;
            }

            let fetches = chunk.iter().map(|symbol| async move {
                let outcome = self.get_klines(market, symbol, timeframe, limit).await;
                (symbol.clone(), outcome)
            });

            for (symbol, outcome) in join_all(fetches).await {
                match outcome {
                    Ok(candles) => {
                        results.insert(symbol, candles);
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "kline fetch failed — symbol skipped");
                    }
                }
            }
        }

        results
    }

    // -------------------------------------------------------------------------
    // Tickers
    // -------------------------------------------------------------------------

    /// Last trade price for a single symbol.
    #[instrument(skip(self), name = "binance::get_ticker")]
    pub async fn get_ticker(&self, market: MarketKind, symbol: &str) -> Result<Decimal> {
        let path = format!("{}/ticker/price?symbol={}", Self::api_prefix(market), symbol);
        let body = self.get_json(market, &path, 1).await?;
        parse_str_decimal(&body["price"])
    }

    /// Last trade price for many symbols with one bulk request.
    #[instrument(skip(self, symbols), name = "binance::get_batch_tickers")]
    pub async fn get_batch_tickers(
        &self,
        market: MarketKind,
        symbols: &[String],
    ) -> Result<HashMap<String, Decimal>> {
        let path = format!("{}/ticker/price", Self::api_prefix(market));
        let body = self.get_json(market, &path, 2).await?;

        let wanted: std::collections::HashSet<&str> =
            symbols.iter().map(String::as_str).collect();

        let mut prices = HashMap::new();
        if let Some(entries) = body.as_array() {
            for entry in entries {
                let Some(symbol) = entry["symbol"].as_str() else {
                    continue;
                };
                if !wanted.contains(symbol) {
                    continue;
                }
                if let Ok(price) = parse_str_decimal(&entry["price"]) {
                    prices.insert(symbol.to_string(), price);
                }
            }
        }

        debug!(market = %market, count = prices.len(), "batch tickers fetched");
        Ok(prices)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("spot_base_url", &self.spot.base_url)
            .field("futures_base_url", &self.futures.base_url)
            .finish()
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

/// Filter an `exchangeInfo` symbols array down to tradable USDT pairs.
fn filter_usdt_pairs(symbols: &[serde_json::Value], market: MarketKind) -> Vec<String> {
    symbols
        .iter()
        .filter(|s| s["quoteAsset"].as_str() == Some("USDT"))
        .filter(|s| s["status"].as_str() == Some("TRADING"))
        .filter(|s| match market {
            MarketKind::Spot => true,
            // Futures exchangeInfo lists delivery contracts too.
            MarketKind::Futures => s["contractType"].as_str() == Some("PERPETUAL"),
        })
        .filter_map(|s| s["symbol"].as_str().map(str::to_string))
        .collect()
}

/// Parse Binance's array-of-arrays kline payload.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ... (remaining fields unused)
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let raw = body
        .as_array()
        .ok_or_else(|| EngineError::PermanentExchange("klines response is not an array".into()))?;

    let mut candles = Vec::with_capacity(raw.len());

    for entry in raw {
        let Some(arr) = entry.as_array() else {
            warn!("skipping non-array kline entry");
            continue;
        };
        if arr.len() < 7 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let Some(open_time) = millis_to_datetime(arr[0].as_i64()) else {
            warn!("skipping kline entry with bad open time");
            continue;
        };
        let Some(close_time) = millis_to_datetime(arr[6].as_i64()) else {
            warn!("skipping kline entry with bad close time");
            continue;
        };

        candles.push(Candle {
            open_time,
            close_time,
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
        });
    }

    Ok(candles)
}

fn millis_to_datetime(ms: Option<i64>) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms?).single()
}

/// Parse a JSON value that may be either a string or a number into `f64`.
/// Binance sends numeric fields as strings.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| EngineError::PermanentExchange(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(EngineError::PermanentExchange(format!(
            "expected string or number, got: {val}"
        )))
    }
}

/// Same as [`parse_str_f64`] but into a fixed-precision decimal.
fn parse_str_decimal(val: &serde_json::Value) -> Result<Decimal> {
    use std::str::FromStr;
    if let Some(s) = val.as_str() {
        Decimal::from_str(s).map_err(|_| {
            EngineError::PermanentExchange(format!("failed to parse '{s}' as decimal"))
        })
    } else if let Some(n) = val.as_f64() {
        Decimal::from_f64_retain(n)
            .ok_or_else(|| EngineError::PermanentExchange(format!("non-finite price {n}")))
    } else {
        Err(EngineError::PermanentExchange(format!(
            "expected string or number, got: {val}"
        )))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn kline_weight_tiers() {
        assert_eq!(BinanceClient::kline_weight(100), 1);
        assert_eq!(BinanceClient::kline_weight(200), 2);
        assert_eq!(BinanceClient::kline_weight(500), 2);
        assert_eq!(BinanceClient::kline_weight(501), 5);
        assert_eq!(BinanceClient::kline_weight(1000), 5);
        assert_eq!(BinanceClient::kline_weight(1500), 10);
    }

    #[test]
    fn parse_klines_ok() {
        let body = json!([
            [
                1700000000000i64, "37000.00", "37050.00", "36990.00", "37020.00",
                "123.456", 1700000059999i64, "4567890.12", 1500, "60.1", "2224455.66", "0"
            ],
            [
                1700000060000i64, "37020.00", "37100.00", "37010.00", "37090.00",
                "98.7", 1700000119999i64, "3651234.00", 1200, "48.2", "1788123.00", "0"
            ]
        ]);
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert!((candles[0].close - 37020.0).abs() < f64::EPSILON);
        assert!((candles[1].high - 37100.0).abs() < f64::EPSILON);
        assert!(candles[0].open_time < candles[1].open_time);
    }

    #[test]
    fn parse_klines_skips_malformed_entries() {
        let body = json!([
            [1700000000000i64, "1", "2", "0.5", "1.5", "10", 1700000059999i64],
            ["garbage"],
            [1700000060000i64, "1.5", "2.5", "1.0", "2.0", "12", 1700000119999i64]
        ]);
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 2);
    }

    #[test]
    fn parse_klines_rejects_non_array() {
        let body = json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(parse_klines(&body).is_err());
    }

    #[test]
    fn usdt_pair_filter_spot() {
        let symbols = vec![
            json!({"symbol": "BTCUSDT", "quoteAsset": "USDT", "status": "TRADING"}),
            json!({"symbol": "BTCBUSD", "quoteAsset": "BUSD", "status": "TRADING"}),
            json!({"symbol": "OLDUSDT", "quoteAsset": "USDT", "status": "BREAK"}),
        ];
        let pairs = filter_usdt_pairs(&symbols, MarketKind::Spot);
        assert_eq!(pairs, vec!["BTCUSDT"]);
    }

    #[test]
    fn usdt_pair_filter_futures_requires_perpetual() {
        let symbols = vec![
            json!({"symbol": "BTCUSDT", "quoteAsset": "USDT", "status": "TRADING",
                   "contractType": "PERPETUAL"}),
            json!({"symbol": "BTCUSDT_240628", "quoteAsset": "USDT", "status": "TRADING",
                   "contractType": "CURRENT_QUARTER"}),
        ];
        let pairs = filter_usdt_pairs(&symbols, MarketKind::Futures);
        assert_eq!(pairs, vec!["BTCUSDT"]);
    }

    #[test]
    fn decimal_parse_string_and_number() {
        assert_eq!(parse_str_decimal(&json!("123.45678901")).unwrap(), dec!(123.45678901));
        assert!(parse_str_decimal(&json!(null)).is_err());
        assert!(parse_str_decimal(&json!("not-a-number")).is_err());
    }

    #[test]
    fn f64_parse_string_and_number() {
        assert!((parse_str_f64(&json!("1.5")).unwrap() - 1.5).abs() < f64::EPSILON);
        assert!((parse_str_f64(&json!(2.5)).unwrap() - 2.5).abs() < f64::EPSILON);
        assert!(parse_str_f64(&json!([])).is_err());
    }
}
