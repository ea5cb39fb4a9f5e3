// =============================================================================
// Cache — best-effort keyed store with TTL (Redis-backed, in-memory for tests)
// =============================================================================
//
// The cache absorbs burst market-data calls, holds LLM response entries, and
// keeps the LLM daily cost/token aggregates. Every operation is best-effort:
// a Redis failure logs at debug/warn and returns `None` — trading never
// blocks on the cache.
//
// `MemoryCache` implements the same interface over a parking_lot map with
// explicit expiry instants, which keeps the full engine testable without a
// Redis server.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use tracing::{debug, warn};

/// Best-effort keyed store. Implementations must never block trading: any
/// backend failure surfaces as `None` / a silent no-op.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a value, `None` on miss, expiry, or backend failure.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store a value with a TTL. Failures are swallowed.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration);

    /// Atomically add to a float counter and return the new total.
    /// Used for the LLM daily cost aggregate.
    async fn incr_f64(&self, key: &str, delta: f64) -> Option<f64>;

    /// Atomically add to an integer counter and return the new total.
    async fn incr_i64(&self, key: &str, delta: i64) -> Option<i64>;
}

// =============================================================================
// Redis backend
// =============================================================================

/// Redis-backed cache using a multiplexed connection manager. The manager
/// reconnects internally; individual command failures degrade to `None`.
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis at `url`. Connection failure is an error here (the
    /// caller decides whether to fall back to `MemoryCache`), but once
    /// connected every operation is best-effort.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!(url, "redis cache connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                debug!(key, error = %e, "cache get failed");
                None
            }
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            warn!(key, error = %e, "cache set failed");
        }
    }

    async fn incr_f64(&self, key: &str, delta: f64) -> Option<f64> {
        let mut conn = self.conn.clone();
        match redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async::<f64>(&mut conn)
            .await
        {
            Ok(total) => Some(total),
            Err(e) => {
                warn!(key, error = %e, "cache float increment failed");
                None
            }
        }
    }

    async fn incr_i64(&self, key: &str, delta: i64) -> Option<i64> {
        let mut conn = self.conn.clone();
        match conn.incr::<_, _, i64>(key, delta).await {
            Ok(total) => Some(total),
            Err(e) => {
                warn!(key, error = %e, "cache int increment failed");
                None
            }
        }
    }
}

// =============================================================================
// In-memory backend (tests, cacheless deployments)
// =============================================================================

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory cache with the same TTL semantics as the Redis backend.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| Instant::now() >= at) {
                    entries.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.live_value(key)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    async fn incr_f64(&self, key: &str, delta: f64) -> Option<f64> {
        let mut entries = self.entries.lock();
        let current = entries
            .get(key)
            .and_then(|e| e.value.parse::<f64>().ok())
            .unwrap_or(0.0);
        let total = current + delta;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: total.to_string(),
                expires_at: None,
            },
        );
        Some(total)
    }

    async fn incr_i64(&self, key: &str, delta: i64) -> Option<i64> {
        let mut entries = self.entries.lock();
        let current = entries
            .get(key)
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        let total = current + delta;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: total.to_string(),
                expires_at: None,
            },
        );
        Some(total)
    }
}

/// A cache that drops everything. Used when neither Redis nor an in-memory
/// cache is wanted; keeps callers free of `Option<Arc<dyn Cache>>`.
pub struct NullCache;

#[async_trait]
impl Cache for NullCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) {}

    async fn incr_f64(&self, _key: &str, _delta: f64) -> Option<f64> {
        None
    }

    async fn incr_i64(&self, _key: &str, _delta: i64) -> Option<i64> {
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert!(cache.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn memory_cache_expires() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn memory_cache_float_counter() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr_f64("cost", 0.25).await, Some(0.25));
        assert_eq!(cache.incr_f64("cost", 0.50).await, Some(0.75));
    }

    #[tokio::test]
    async fn memory_cache_int_counter() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr_i64("tokens", 100).await, Some(100));
        assert_eq!(cache.incr_i64("tokens", 50).await, Some(150));
    }

    #[tokio::test]
    async fn null_cache_swallows_everything() {
        let cache = NullCache;
        cache.set_ex("k", "v", Duration::from_secs(60)).await;
        assert!(cache.get("k").await.is_none());
        assert!(cache.incr_f64("c", 1.0).await.is_none());
    }
}
