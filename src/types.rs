// =============================================================================
// Shared types used across the arena engine
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A tradeable token observed in one market snapshot.
///
/// Tokens are values: every snapshot produces fresh instances and nothing
/// retains them across ticks. The `address` is the only stable identity —
/// symbols repeat across pools and must never be used as a lookup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Base-token contract address (unique, opaque).
    pub address: String,
    /// Human-readable symbol, truncated to 20 chars at ingest.
    pub symbol: String,
    /// Price in the QUOTE numeraire.
    pub price_quote: f64,
    /// Pool liquidity in QUOTE units.
    pub liquidity_quote: f64,
    /// Minutes since pool creation.
    pub age_minutes: f64,
    /// 24-hour traded volume in USD.
    pub volume_usd_24h: f64,
    /// 24-hour percent price change.
    pub price_change_24h: f64,
    /// Estimated holder count (derived from volume at ingest).
    pub holders: u64,
    /// Buy/sell tax percent reported by the safety scanner.
    #[serde(default)]
    pub tax_pct: f64,
    #[serde(default)]
    pub is_honeypot: bool,
    #[serde(default)]
    pub ownership_renounced: bool,
    #[serde(default)]
    pub liquidity_locked: bool,
}

/// An ordered list of tokens observed at one logical instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Epoch millis at which the snapshot was assembled.
    pub fetched_at: i64,
    pub tokens: Vec<Token>,
}

impl MarketSnapshot {
    /// Build the address → price map used by the coordinator and the
    /// unrealized-P&L pass.
    pub fn price_by_address(&self) -> HashMap<String, f64> {
        self.tokens
            .iter()
            .map(|t| (t.address.clone(), t.price_quote))
            .collect()
    }

    /// Look a token up by its contract address.
    pub fn token_by_address(&self, address: &str) -> Option<&Token> {
        self.tokens.iter().find(|t| t.address == address)
    }

    /// Age of the snapshot relative to `now_ms`, in seconds.
    pub fn age_secs(&self, now_ms: i64) -> i64 {
        (now_ms - self.fetched_at) / 1000
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Match lifecycle state as stored on the relational match row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Pending,
    Running,
    Settled,
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Settled => write!(f, "settled"),
        }
    }
}

impl std::str::FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "settled" => Ok(Self::Settled),
            other => Err(format!("unknown match status: {other}")),
        }
    }
}

// =============================================================================
// Deterministic hashing
// =============================================================================

/// 32-bit FNV-1a fold over a list of byte slices.
///
/// Every deterministic perturbation in the engine (risk jitter, entry
/// tie-breaks, timing skips, sizing jitter, uniqueness injection) is derived
/// from this fold of explicitly listed inputs — never from a random source.
pub fn fnv1a32(parts: &[&[u8]]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for part in parts {
        for &b in *part {
            h ^= u32::from(b);
            h = h.wrapping_mul(0x0100_0193);
        }
    }
    h
}

/// Stable per-participant seed: the fold of the participant id.
pub fn participant_seed(participant_id: &str) -> u32 {
    fnv1a32(&[participant_id.as_bytes()])
}

// =============================================================================
// Tests
// =============================================================================
