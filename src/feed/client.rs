// =============================================================================
// Price Feed Client — upstream pools API over HTTP
// =============================================================================
//
// Fetches the raw pool list from the external price feed and maps it into
// Tokens. All JSON numeric fields tolerate string encoding (the upstream
// mixes both). Requests carry a bounded timeout well inside a tick interval
// so a hung upstream degrades to the stale-cache path instead of stalling
// the coordinator.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::types::{MarketSnapshot, Token};

/// QUOTE-USD peg used to convert USD-denominated upstream fields.
pub const QUOTE_USD_PEG: f64 = 300.0;
/// Tokens retained per snapshot.
pub const SNAPSHOT_MAX_TOKENS: usize = 50;
/// Symbols are truncated to this length at ingest.
const SYMBOL_MAX_LEN: usize = 20;
/// Tokens older than one week are not tradeable.
const MAX_TOKEN_AGE_MINUTES: f64 = 10_080.0;
/// Upstream request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// One pool record as returned by the upstream feed.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolRecord {
    pub base_token_address: String,
    #[serde(default)]
    pub base_token_symbol: String,
    /// Price of the base token in QUOTE; may be absent or zero.
    #[serde(default)]
    pub base_token_price_quote: f64,
    /// Price of the base token in USD; fallback when the QUOTE price is gone.
    #[serde(default)]
    pub base_token_price_usd: f64,
    #[serde(default)]
    pub reserve_usd: f64,
    #[serde(default)]
    pub volume_usd_24h: f64,
    /// RFC 3339 pool creation timestamp.
    #[serde(default)]
    pub pool_created_at: String,
    #[serde(default)]
    pub price_change_pct_24h: f64,
    // Safety-scanner fields; absent for most pools.
    #[serde(default)]
    pub tax_pct: f64,
    #[serde(default)]
    pub is_honeypot: bool,
    #[serde(default)]
    pub ownership_renounced: bool,
    #[serde(default)]
    pub liquidity_locked: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct PoolsResponse {
    #[serde(default)]
    pools: Vec<PoolRecord>,
}

/// HTTP client for the upstream pools feed.
#[derive(Clone)]
pub struct FeedClient {
    base_url: String,
    client: reqwest::Client,
}

impl FeedClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// Fetch the raw pool list from the upstream feed.
    #[instrument(skip(self), name = "feed::fetch_pools")]
    pub async fn fetch_pools(&self) -> Result<Vec<PoolRecord>> {
        let url = format!("{}/pools?sort=volume_desc", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("pools request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(400).collect();
            anyhow::bail!("pools feed returned {status}: {snippet}");
        }

        let body: PoolsResponse = resp.json().await.context("failed to parse pools response")?;
        debug!(count = body.pools.len(), "pools fetched");
        Ok(body.pools)
    }

    /// Fetch pools and map them into an ordered snapshot of tradeable
    /// tokens, capped at [`SNAPSHOT_MAX_TOKENS`].
    pub async fn fetch_snapshot(&self) -> Result<MarketSnapshot> {
        let pools = self.fetch_pools().await?;
        let now_ms = Utc::now().timestamp_millis();

        let mut tokens = Vec::new();
        for pool in pools {
            match pool_to_token(&pool, now_ms) {
                Some(token) => tokens.push(token),
                None => debug!(address = %pool.base_token_address, "pool dropped at ingest"),
            }
            if tokens.len() >= SNAPSHOT_MAX_TOKENS {
                break;
            }
        }

        if tokens.is_empty() {
            warn!("upstream returned no tradeable pools");
        }

        Ok(MarketSnapshot {
            fetched_at: now_ms,
            tokens,
        })
    }
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pool → Token transformation
// ---------------------------------------------------------------------------

/// Map one upstream pool record into a Token, or drop it when untradeable.
///
/// Drop rules: non-positive price, liquidity below 1 QUOTE, or age over one
/// week. Holder counts are estimated from volume since the feed does not
/// carry them.
pub fn pool_to_token(pool: &PoolRecord, now_ms: i64) -> Option<Token> {
    let price_quote = if pool.base_token_price_quote > 0.0 {
        pool.base_token_price_quote
    } else {
        pool.base_token_price_usd / QUOTE_USD_PEG
    };
    if price_quote <= 0.0 {
        return None;
    }

    let liquidity_quote = pool.reserve_usd / QUOTE_USD_PEG;
    if liquidity_quote < 1.0 {
        return None;
    }

    let age_minutes = match chrono::DateTime::parse_from_rfc3339(&pool.pool_created_at) {
        Ok(created) => ((now_ms - created.timestamp_millis()) as f64 / 60_000.0).max(0.0),
        Err(_) => return None,
    };
    if age_minutes > MAX_TOKEN_AGE_MINUTES {
        return None;
    }

    // Char-wise truncation: symbols are user-supplied and not always ASCII.
    let symbol: String = pool.base_token_symbol.chars().take(SYMBOL_MAX_LEN).collect();

    let holders = (pool.volume_usd_24h / 100.0).max(20.0) as u64;

    Some(Token {
        address: pool.base_token_address.clone(),
        symbol,
        price_quote,
        liquidity_quote,
        age_minutes,
        volume_usd_24h: pool.volume_usd_24h,
        price_change_24h: pool.price_change_pct_24h,
        holders,
        tax_pct: pool.tax_pct,
        is_honeypot: pool.is_honeypot,
        ownership_renounced: pool.ownership_renounced,
        liquidity_locked: pool.liquidity_locked,
    })
}

// =============================================================================
// Tests
// =============================================================================
