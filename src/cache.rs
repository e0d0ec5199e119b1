//! Two-tier cache: an in-process local tier always present, plus an
//! optional shared tier behind a trait object (spec §4.1).
//!
//! Grounded on the `DashMap`-backed bucket map in the teacher's
//! `RateLimiter` (`src/api/agents/middleware.rs`) — same shape (string key,
//! TTL-bearing counters guarded by a concurrent map) repurposed for
//! rpm/tpm counters and response caching instead of request throttling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

/// Pluggable shared tier (e.g. Redis in a real deployment). The Router core
/// ships no concrete implementation; a host process supplies one.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>);
    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Option<i64>;
    async fn delete(&self, key: &str);
}

/// Local in-process tier. Always present even with no shared tier
/// configured (spec §4.1 "never depends on an external store being up").
pub struct Cache {
    local: DashMap<String, Entry>,
    shared: Option<Arc<dyn SharedCache>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            local: DashMap::new(),
            shared: None,
        }
    }

    pub fn with_shared(shared: Arc<dyn SharedCache>) -> Self {
        Self {
            local: DashMap::new(),
            shared: Some(shared),
        }
    }

    fn local_get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.local.get(key)?;
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() >= expires_at {
                drop(entry);
                self.local.remove(key);
                return None;
            }
        }
        Some(entry.value.clone())
    }

    fn local_set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        self.local.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    /// Local tier first, falling through to the shared tier on miss. A
    /// shared-tier error degrades silently to a miss rather than failing the
    /// request (spec §4.1 "graceful degradation").
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(v) = self.local_get(key) {
            return Some(v);
        }
        match &self.shared {
            Some(shared) => shared.get(key).await,
            None => None,
        }
    }

    pub async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        self.local_set(key, value.clone(), ttl);
        if let Some(shared) = &self.shared {
            shared.set(key, value, ttl).await;
        }
    }

    /// Atomic increment used for rpm/tpm counters (spec §4.1 "counter
    /// increments must be atomic under concurrent access"). Falls back to a
    /// best-effort local-only increment if the shared tier is absent or
    /// errors.
    pub async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> i64 {
        if let Some(shared) = &self.shared {
            match shared.incr_by(key, delta, ttl).await {
                Some(v) => return v,
                None => warn!(key, "shared cache incr failed, degrading to local-only"),
            }
        }

        let mut entry = self
            .local
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: serde_json::json!(0_i64),
                expires_at: ttl.map(|d| Instant::now() + d),
            });
        let current = entry.value.as_i64().unwrap_or(0);
        let next = current + delta;
        entry.value = serde_json::json!(next);
        next
    }

    pub async fn delete(&self, key: &str) {
        self.local.remove(key);
        if let Some(shared) = &self.shared {
            shared.delete(key).await;
        }
    }

    pub fn flush_local(&self) {
        self.local.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_only_get_set_roundtrips() {
        let cache = Cache::new();
        cache.set("k", serde_json::json!("v"), None).await;
        assert_eq!(cache.get("k").await, Some(serde_json::json!("v")));
    }

    #[tokio::test]
    async fn local_entry_expires_after_ttl() {
        let cache = Cache::new();
        cache
            .set("k", serde_json::json!(1), Some(Duration::from_millis(1)))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn incr_accumulates_without_shared_tier() {
        let cache = Cache::new();
        assert_eq!(cache.incr("rpm:d1", 1, None).await, 1);
        assert_eq!(cache.incr("rpm:d1", 1, None).await, 2);
    }
}
