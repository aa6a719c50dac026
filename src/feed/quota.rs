// =============================================================================
// Feed Quota Gates — global per-minute rate and monthly credit caps
// =============================================================================
//
// The upstream feed bills 500 credits/min and 500 000/month; both caps are
// buffered below the real limits. Counters live in the shared blob store so
// every coordinator sees the same numbers — no per-coordinator shadow
// counters. Counters are incremented only after a successful upstream call:
// transport errors never burn quota.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::store::BlobStore;

/// Requests allowed per minute (real limit 500).
pub const RATE_CAP_PER_MIN: i64 = 450;
/// Credits allowed per calendar month (real limit 500 000).
pub const CREDIT_CAP_PER_MONTH: i64 = 480_000;

const CREDIT_WARN_80: i64 = CREDIT_CAP_PER_MONTH * 80 / 100;
const CREDIT_WARN_90: i64 = CREDIT_CAP_PER_MONTH * 90 / 100;

/// Internal gate trip. Never surfaced to callers of the fetcher — it is
/// resolved to stale cache or the fallback snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateTrip {
    #[error("per-minute rate cap reached")]
    RateLimited,
    #[error("monthly credit cap reached")]
    QuotaExceeded,
}

/// Serializable usage report for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ApiUsage {
    pub requests_this_minute: i64,
    pub rate_cap_per_minute: i64,
    pub credits_this_month: i64,
    pub credit_cap_per_month: i64,
    pub status: &'static str,
}

/// Gate checks against the shared counters.
#[derive(Clone)]
pub struct QuotaGates {
    blob: Arc<BlobStore>,
}

impl QuotaGates {
    pub fn new(blob: Arc<BlobStore>) -> Self {
        Self { blob }
    }

    fn minute_key() -> String {
        format!("ratelimit:{}", Utc::now().timestamp() / 60)
    }

    fn month_key() -> String {
        let now = Utc::now();
        format!("credits:{:04}-{:02}", now.year(), now.month())
    }

    /// Pre-flight check. Reads both counters without spending anything.
    pub fn check(&self) -> Result<(), GateTrip> {
        let used_minute: i64 = self.blob.get(&Self::minute_key()).unwrap_or(0);
        if used_minute >= RATE_CAP_PER_MIN {
            warn!(used_minute, cap = RATE_CAP_PER_MIN, "feed rate gate tripped");
            return Err(GateTrip::RateLimited);
        }

        let used_month: i64 = self.blob.get(&Self::month_key()).unwrap_or(0);
        if used_month >= CREDIT_CAP_PER_MONTH {
            warn!(used_month, cap = CREDIT_CAP_PER_MONTH, "feed credit gate tripped");
            return Err(GateTrip::QuotaExceeded);
        }

        Ok(())
    }

    /// Spend one request and one credit after a successful upstream call.
    pub fn record_success(&self) {
        // The minute window gets a 2-minute TTL so stale windows expire on
        // their own instead of accumulating.
        self.blob
            .incr(&Self::minute_key(), 1, Some(Duration::from_secs(120)));

        let used = self
            .blob
            .incr(&Self::month_key(), 1, Some(Duration::from_secs(35 * 86_400)));
        if used == CREDIT_WARN_80 {
            warn!(used, cap = CREDIT_CAP_PER_MONTH, "feed credits at 80% of monthly cap");
        } else if used == CREDIT_WARN_90 {
            warn!(used, cap = CREDIT_CAP_PER_MONTH, "feed credits at 90% of monthly cap");
        }
    }

    /// Usage report for `GET /admin/api-usage`.
    pub fn usage(&self) -> ApiUsage {
        let requests_this_minute: i64 = self.blob.get(&Self::minute_key()).unwrap_or(0);
        let credits_this_month: i64 = self.blob.get(&Self::month_key()).unwrap_or(0);

        let status = if credits_this_month >= CREDIT_CAP_PER_MONTH
            || requests_this_minute >= RATE_CAP_PER_MIN
        {
            "EXCEEDED"
        } else if credits_this_month >= CREDIT_WARN_90 {
            "WARN_90"
        } else if credits_this_month >= CREDIT_WARN_80 {
            "WARN_80"
        } else {
            "OK"
        };

        ApiUsage {
            requests_this_minute,
            rate_cap_per_minute: RATE_CAP_PER_MIN,
            credits_this_month,
            credit_cap_per_month: CREDIT_CAP_PER_MONTH,
            status,
        }
    }
}

impl std::fmt::Debug for QuotaGates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGates").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn gates() -> QuotaGates {
        QuotaGates::new(Arc::new(BlobStore::new()))
    }

    #[test]
    fn fresh_gates_pass() {
        assert!(gates().check().is_ok());
        assert_eq!(gates().usage().status, "OK");
    }

    #[test]
    fn rate_gate_trips_at_cap() {
        let g = gates();
        for _ in 0..RATE_CAP_PER_MIN {
            g.record_success();
        }
        assert_eq!(g.check(), Err(GateTrip::RateLimited));
        assert_eq!(g.usage().status, "EXCEEDED");
    }

    #[test]
    fn credit_gate_trips_at_cap() {
        let g = gates();
        // Seed the monthly counter directly; spinning 480k increments in a
        // test is pointless.
        g.blob.incr(
            &QuotaGates::month_key(),
            CREDIT_CAP_PER_MONTH,
            None,
        );
        assert_eq!(g.check(), Err(GateTrip::QuotaExceeded));
        assert_eq!(g.usage().status, "EXCEEDED");
    }

    #[test]
    fn warn_statuses_reported() {
        let g = gates();
        g.blob.incr(&QuotaGates::month_key(), CREDIT_WARN_80, None);
        assert_eq!(g.usage().status, "WARN_80");
        g.blob
            .incr(&QuotaGates::month_key(), CREDIT_WARN_90 - CREDIT_WARN_80, None);
        assert_eq!(g.usage().status, "WARN_90");
        assert!(g.check().is_ok());
    }

    #[test]
    fn usage_counts_successes() {
        let g = gates();
        g.record_success();
        g.record_success();
        let usage = g.usage();
        assert_eq!(usage.requests_this_minute, 2);
        assert_eq!(usage.credits_this_month, 2);
    }
}
