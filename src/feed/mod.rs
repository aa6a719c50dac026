// =============================================================================
// Market Snapshot Fetcher — shared, rate-limited, request-coalesced cache
// =============================================================================
//
// Every coordinator tick and every read endpoint goes through `get_snapshot`.
// The fetcher never errors outward: when the upstream, the rate gate, or the
// credit gate fails, it falls open to the stale cache (any age), and only
// when no cache exists at all does it serve the hard-coded fallback
// snapshot.
//
// Coalescing: a short-lived `inflight:` marker in the blob store signals
// that a fetch is under way; concurrent callers wait briefly and re-read the
// cache instead of stampeding the upstream. Across any 90-second window a
// fleet of N callers costs at most one upstream call when nothing fails.
// =============================================================================

pub mod client;
pub mod quota;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::store::BlobStore;
use crate::types::{MarketSnapshot, Token};
use client::FeedClient;
use quota::QuotaGates;

/// Cache freshness window. The cached entry itself never expires — staleness
/// beyond the TTL only matters on the happy path, because the fail-open path
/// accepts any age.
pub const SNAPSHOT_TTL_SECS: i64 = 90;
/// Lifetime of the in-flight marker.
const INFLIGHT_TTL: Duration = Duration::from_secs(5);
/// How long a concurrent caller waits for the in-flight fetch.
const INFLIGHT_WAIT: Duration = Duration::from_millis(1_000);

const CACHE_KEY: &str = "cache:market";
const INFLIGHT_KEY: &str = "inflight:market";

/// Shared snapshot fetcher over the upstream pools feed.
#[derive(Clone)]
pub struct SnapshotFetcher {
    client: FeedClient,
    blob: Arc<BlobStore>,
    gates: QuotaGates,
}

impl SnapshotFetcher {
    pub fn new(client: FeedClient, blob: Arc<BlobStore>) -> Self {
        let gates = QuotaGates::new(blob.clone());
        Self { client, blob, gates }
    }

    pub fn gates(&self) -> &QuotaGates {
        &self.gates
    }

    /// Age of the cached snapshot in seconds, if any.
    pub fn cache_age_secs(&self) -> Option<i64> {
        let snap: MarketSnapshot = self.blob.get(CACHE_KEY)?;
        Some(snap.age_secs(Utc::now().timestamp_millis()))
    }

    /// Obtain a market snapshot.
    ///
    /// `skip_cache` bypasses the freshness check (simulation ticks always
    /// do) but still honours coalescing and both quota gates. Readers pass
    /// `false` and accept cache age up to the TTL.
    pub async fn get_snapshot(&self, skip_cache: bool) -> MarketSnapshot {
        let now_ms = Utc::now().timestamp_millis();

        if !skip_cache {
            if let Some(snap) = self.cached() {
                if snap.age_secs(now_ms) <= SNAPSHOT_TTL_SECS {
                    return snap;
                }
            }
        }

        // A fetch is already in flight: wait briefly and take whatever it
        // produced; fall through only if the cache is still empty.
        if self.blob.contains(INFLIGHT_KEY) {
            tokio::time::sleep(INFLIGHT_WAIT).await;
            if let Some(snap) = self.cached() {
                return snap;
            }
        }

        // Rate / credit gates: tripping is resolved locally, never surfaced.
        if let Err(trip) = self.gates.check() {
            warn!(gate = %trip, "snapshot gate tripped — serving stale data");
            return self.stale_or_fallback();
        }

        self.blob.put(INFLIGHT_KEY, &true, Some(INFLIGHT_TTL));

        match self.client.fetch_snapshot().await {
            Ok(snap) => {
                // Quota is spent only on success; transport errors are free.
                self.gates.record_success();
                self.blob.put(CACHE_KEY, &snap, None);
                self.blob.delete(INFLIGHT_KEY);
                info!(tokens = snap.tokens.len(), "market snapshot refreshed");
                snap
            }
            Err(e) => {
                self.blob.delete(INFLIGHT_KEY);
                warn!(error = %e, "snapshot fetch failed — serving stale data");
                self.stale_or_fallback()
            }
        }
    }

    fn cached(&self) -> Option<MarketSnapshot> {
        self.blob.get(CACHE_KEY)
    }

    fn stale_or_fallback(&self) -> MarketSnapshot {
        match self.cached() {
            Some(snap) => snap,
            None => {
                warn!("no cached snapshot available — serving fallback");
                fallback_snapshot()
            }
        }
    }
}

impl std::fmt::Debug for SnapshotFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotFetcher")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

/// Hard-coded synthetic snapshot. Served only when the cache, stale cache,
/// and upstream are all unavailable; keeps ticks alive through an outage.
pub fn fallback_snapshot() -> MarketSnapshot {
    MarketSnapshot {
        fetched_at: Utc::now().timestamp_millis(),
        tokens: vec![Token {
            address: "0x0000000000000000000000000000000000000f41".to_string(),
            symbol: "FALLBACK".to_string(),
            price_quote: 0.001,
            liquidity_quote: 100.0,
            age_minutes: 120.0,
            volume_usd_24h: 10_000.0,
            price_change_24h: 0.0,
            holders: 100,
            tax_pct: 0.0,
            is_honeypot: false,
            ownership_renounced: true,
            liquidity_locked: true,
        }],
    }
}

// =============================================================================
// Tests
// =============================================================================
