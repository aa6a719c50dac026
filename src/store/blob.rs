// =============================================================================
// Keyed Blob Store — process-wide KV with per-key TTL
// =============================================================================
//
// Holds every piece of cross-coordinator shared state: the snapshot cache,
// the in-flight fetch marker, rate-limit and monthly credit counters, result
// archives, and serialized coordinator state. Keys follow the
// `namespace:qualifier` convention (`cache:market`, `ratelimit:<minute>`,
// `credits:YYYY-MM`, `inflight:market`, `results:match-<id>`).
//
// Values are stored as JSON. Expiry is lazy: expired entries are dropped on
// read and on the periodic sweep. `incr` is an atomic read-modify-write
// under a single write lock, which is what makes the global rate and credit
// gates safe across coordinators.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    /// Epoch millis; `None` means no expiry.
    expires_at: Option<i64>,
}

/// In-process keyed blob store with TTL semantics.
#[derive(Default)]
pub struct BlobStore {
    entries: RwLock<HashMap<String, Entry>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, optionally expiring after `ttl`.
    pub fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "blob store put failed to serialise");
                return;
            }
        };
        let expires_at = ttl.map(|d| now_ms() + d.as_millis() as i64);
        self.entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
    }

    /// Fetch and deserialise the value under `key`, honouring expiry.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = now_ms();
        {
            let entries = self.entries.read();
            let entry = entries.get(key)?;
            if entry.expires_at.map_or(true, |exp| now < exp) {
                return serde_json::from_value(entry.value.clone()).ok();
            }
        }
        // Entry existed but is expired: drop it.
        self.entries.write().remove(key);
        None
    }

    /// True if a live (unexpired) entry exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = now_ms();
        self.entries
            .read()
            .get(key)
            .map_or(false, |e| e.expires_at.map_or(true, |exp| now < exp))
    }

    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Remove every key starting with `prefix`. Used by the admin reset path.
    pub fn delete_prefix(&self, prefix: &str) {
        self.entries.write().retain(|k, _| !k.starts_with(prefix));
    }

    /// Atomically add `by` to the integer counter under `key`, creating it
    /// at zero (with `ttl`) if missing or expired. Returns the new value.
    /// The TTL set at creation is preserved on subsequent increments so a
    /// counter window rolls exactly once.
    pub fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> i64 {
        let now = now_ms();
        let mut entries = self.entries.write();

        let live = entries
            .get(key)
            .filter(|e| e.expires_at.map_or(true, |exp| now < exp))
            .cloned();

        let (current, expires_at) = match live {
            Some(e) => (e.value.as_i64().unwrap_or(0), e.expires_at),
            None => (0, ttl.map(|d| now + d.as_millis() as i64)),
        };

        let next = current + by;
        entries.insert(
            key.to_string(),
            Entry {
                value: serde_json::Value::from(next),
                expires_at,
            },
        );
        next
    }

    /// Drop every expired entry. Called opportunistically from the
    /// coordinator tick so abandoned keys do not accumulate.
    pub fn sweep_expired(&self) {
        let now = now_ms();
        self.entries
            .write()
            .retain(|_, e| e.expires_at.map_or(true, |exp| now < exp));
    }

    /// Live entry count (test and stats use).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let store = BlobStore::new();
        store.put("cache:test", &vec![1, 2, 3], None);
        let v: Vec<i32> = store.get("cache:test").unwrap();
        assert_eq!(v, vec![1, 2, 3]);
    }

    #[test]
    fn missing_key_is_none() {
        let store = BlobStore::new();
        assert!(store.get::<String>("nope").is_none());
    }

    #[test]
    fn expired_entry_is_dropped_on_read() {
        let store = BlobStore::new();
        store.put("cache:short", &"x", Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(store.get::<String>("cache:short").is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn incr_counts_and_preserves_window() {
        let store = BlobStore::new();
        assert_eq!(store.incr("ratelimit:1", 1, Some(Duration::from_secs(60))), 1);
        assert_eq!(store.incr("ratelimit:1", 1, Some(Duration::from_secs(60))), 2);
        assert_eq!(store.incr("ratelimit:1", 5, None), 7);
    }

    #[test]
    fn incr_restarts_after_expiry() {
        let store = BlobStore::new();
        store.incr("ratelimit:w", 10, Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.incr("ratelimit:w", 1, Some(Duration::from_secs(60))), 1);
    }

    #[test]
    fn delete_prefix_clears_namespace() {
        let store = BlobStore::new();
        store.put("match:1:state", &"a", None);
        store.put("match:1:history", &"b", None);
        store.put("match:2:state", &"c", None);
        store.delete_prefix("match:1:");
        assert!(store.get::<String>("match:1:state").is_none());
        assert!(store.get::<String>("match:2:state").is_some());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = BlobStore::new();
        store.put("keep", &1, None);
        store.put("drop", &2, Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));
        store.sweep_expired();
        assert_eq!(store.len(), 1);
        assert!(store.contains("keep"));
    }
}
