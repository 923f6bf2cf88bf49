use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout as tokio_timeout;

use crate::config::CacheConfig;
use crate::error::TransportError;

/// One configured Redis endpoint: a lazily-reconnected `ConnectionManager`
/// guarded by its own mutex so endpoints reconnect independently.
struct Endpoint {
    connection_string: String,
    manager: Mutex<Option<ConnectionManager>>,
}

/// Remote key/value facade over one or more Redis endpoints, implementing
/// the reconnect/retry algorithm of spec.md §4.1 precisely: a single
/// timed-mutex reconnect on `Unavailable`, then N retries with
/// `retryInterval + (attempt-1)*2` backoff; `Timeout` skips the reconnect
/// step; any other error is logged and the zero value is returned.
pub struct KvCache {
    config: CacheConfig,
    endpoints: Vec<Endpoint>,
    reconnect_lock: Mutex<()>,
    reconnect_timestamp: AtomicU64,
}

impl KvCache {
    pub fn new(config: CacheConfig) -> Self {
        let endpoints = config
            .connection_strings
            .iter()
            .map(|cs| Endpoint {
                connection_string: cs.clone(),
                manager: Mutex::new(None),
            })
            .collect();

        Self {
            config,
            endpoints,
            reconnect_lock: Mutex::new(()),
            reconnect_timestamp: AtomicU64::new(0),
        }
    }

    async fn connection_for(&self, endpoint: &Endpoint) -> Result<ConnectionManager, TransportError> {
        let mut guard = endpoint.manager.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let client = Client::open(endpoint.connection_string.as_str())
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
        let manager = tokio_timeout(self.config.connection_timeout, client.get_connection_manager())
            .await
            .map_err(|_| TransportError::Timeout("redis connect timeout".to_string()))?
            .map_err(TransportError::from)?;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    /// Forces every endpoint's cached connection to be rebuilt on next use,
    /// under the shared reconnect lock (spec.md §4.1 step 1: "only one
    /// reconnect runs at a time"). Single-flight: `observed_generation` is
    /// the `reconnect_timestamp` the caller saw before its own op failed; if
    /// another caller already reconnected since then, this call is a no-op,
    /// so N concurrent callers racing on the same dead connection produce
    /// exactly one reset and one counter increment (spec.md §8 scenario 6).
    async fn reconnect(&self, observed_generation: u64) {
        let _guard = match tokio_timeout(self.config.reconnect_lock_timeout, self.reconnect_lock.lock()).await {
            Ok(g) => g,
            Err(_) => return,
        };
        if self.reconnect_timestamp.load(Ordering::Acquire) != observed_generation {
            return;
        }
        for endpoint in &self.endpoints {
            *endpoint.manager.lock().await = None;
        }
        self.reconnect_timestamp.fetch_add(1, Ordering::AcqRel);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_interval + Duration::from_secs((attempt.saturating_sub(1) as u64) * 2)
    }

    /// Runs `op` against the first endpoint, applying the reconnect/retry
    /// policy. Returns `default` (the zero value for `T`) on anything other
    /// than success, after logging.
    async fn with_retry<T, F, Fut>(&self, op_name: &str, default: T, op: F) -> T
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let endpoint = match self.endpoints.first() {
            Some(e) => e,
            None => return default,
        };

        for attempt in 1..=self.config.retry_attempts.max(1) {
            let generation = self.reconnect_timestamp.load(Ordering::Acquire);
            let conn = match self.connection_for(endpoint).await {
                Ok(c) => c,
                Err(e) => {
                    log::error!("kv-cache {} failed to obtain connection: {}", op_name, e);
                    if attempt < self.config.retry_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                    continue;
                }
            };

            match op(conn).await {
                Ok(value) => return value,
                Err(redis_err) => {
                    let classified = TransportError::from(redis_err);
                    match classified {
                        TransportError::Unavailable(_) => {
                            self.reconnect(generation).await;
                        }
                        TransportError::Timeout(_) => {
                            // Skip reconnect, retry directly (spec.md §4.1 step 3).
                        }
                        other => {
                            log::error!("kv-cache {} failed: {}", op_name, other);
                            return default;
                        }
                    }
                }
            }

            if attempt < self.config.retry_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        default
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let key = key.to_string();
        self.with_retry("Get", None, move |mut conn| {
            let key = key.clone();
            async move { conn.get::<_, Option<Vec<u8>>>(key).await }
        })
        .await
    }

    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> bool {
        let key = key.to_string();
        let value = value.to_vec();
        self.with_retry("Set", false, move |mut conn| {
            let key = key.clone();
            let value = value.clone();
            async move {
                match ttl {
                    Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await,
                    None => conn.set::<_, _, ()>(key, value).await,
                }
                .map(|_| true)
            }
        })
        .await
    }

    pub async fn set_typed<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, &bytes, ttl).await,
            Err(e) => {
                log::error!("kv-cache Set failed to serialize value for {}: {}", key, e);
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let key = key.to_string();
        self.with_retry("Exists", false, move |mut conn| {
            let key = key.clone();
            async move { conn.exists(key).await }
        })
        .await
    }

    pub async fn remove(&self, key: &str) -> u64 {
        let key = key.to_string();
        self.with_retry("Remove", 0, move |mut conn| {
            let key = key.clone();
            async move { conn.del(key).await }
        })
        .await
    }

    /// Iterates every configured endpoint with `SCAN` (never the blocking
    /// `KEYS`), matching `glob_pattern`, and deletes every match.
    pub async fn remove_by_pattern(&self, glob_pattern: &str) -> u64 {
        let mut removed = 0u64;
        for endpoint in &self.endpoints {
            let conn = match self.connection_for(endpoint).await {
                Ok(c) => c,
                Err(e) => {
                    log::error!("kv-cache RemoveByPattern failed to obtain connection: {}", e);
                    continue;
                }
            };
            removed += scan_and_delete(conn, glob_pattern).await;
        }
        removed
    }

    pub async fn hash_get(&self, hash_key: &str, field: &str) -> Option<Vec<u8>> {
        let hash_key = hash_key.to_string();
        let field = field.to_string();
        self.with_retry("HashGet", None, move |mut conn| {
            let hash_key = hash_key.clone();
            let field = field.clone();
            async move { conn.hget(hash_key, field).await }
        })
        .await
    }

    pub async fn hash_set(&self, hash_key: &str, field: &str, value: &[u8], ttl: Option<Duration>) -> bool {
        let hash_key = hash_key.to_string();
        let field = field.to_string();
        let value = value.to_vec();
        self.with_retry("HashSet", false, move |mut conn| {
            let hash_key = hash_key.clone();
            let field = field.clone();
            let value = value.clone();
            async move {
                conn.hset::<_, _, _, ()>(&hash_key, field, value).await?;
                if let Some(ttl) = ttl {
                    conn.expire::<_, ()>(&hash_key, ttl.as_secs().max(1) as i64).await?;
                }
                Ok(true)
            }
        })
        .await
    }

    pub async fn hash_get_all(&self, hash_key: &str) -> HashMap<String, Vec<u8>> {
        let hash_key = hash_key.to_string();
        self.with_retry("HashGetAll", HashMap::new(), move |mut conn| {
            let hash_key = hash_key.clone();
            async move { conn.hgetall(hash_key).await }
        })
        .await
    }

    pub async fn hash_exists(&self, hash_key: &str, field: &str) -> bool {
        let hash_key = hash_key.to_string();
        let field = field.to_string();
        self.with_retry("HashExists", false, move |mut conn| {
            let hash_key = hash_key.clone();
            let field = field.clone();
            async move { conn.hexists(hash_key, field).await }
        })
        .await
    }

    pub async fn hash_delete(&self, hash_key: &str, field: &str) -> u64 {
        let hash_key = hash_key.to_string();
        let field = field.to_string();
        self.with_retry("HashDelete", 0, move |mut conn| {
            let hash_key = hash_key.clone();
            let field = field.clone();
            async move { conn.hdel(hash_key, field).await }
        })
        .await
    }

    pub async fn hash_increment(&self, hash_key: &str, field: &str, delta: i64) -> i64 {
        let hash_key = hash_key.to_string();
        let field = field.to_string();
        self.with_retry("HashIncrement", 0, move |mut conn| {
            let hash_key = hash_key.clone();
            let field = field.clone();
            async move { conn.hincr(hash_key, field, delta).await }
        })
        .await
    }

    pub async fn string_increment(&self, key: &str) -> i64 {
        let key = key.to_string();
        self.with_retry("StringIncrement", 0, move |mut conn| {
            let key = key.clone();
            async move { conn.incr(key, 1).await }
        })
        .await
    }

    /// Expensive: scans every endpoint for `pattern` and returns every
    /// matching key's value. Documented by spec.md §4.1 as unfit for hot
    /// paths.
    pub async fn get_all(&self, pattern: &str) -> HashMap<String, Vec<u8>> {
        let mut all = HashMap::new();
        for endpoint in &self.endpoints {
            let conn = match self.connection_for(endpoint).await {
                Ok(c) => c,
                Err(e) => {
                    log::error!("kv-cache GetAll failed to obtain connection: {}", e);
                    continue;
                }
            };
            collect_matching(conn, pattern, &mut all).await;
        }
        all
    }

    /// When `use_remote` is false, always invokes `producer`. Otherwise
    /// returns the cached value, or invokes `producer`, stores the result,
    /// and returns it.
    pub async fn get_or_create<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, use_remote: bool, producer: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !use_remote {
            return producer().await;
        }
        if let Some(cached) = self.get_typed::<T>(key).await {
            return cached;
        }
        let value = producer().await;
        self.set_typed(key, &value, ttl).await;
        value
    }

    /// Enumerates every endpoint and issues a flush, bumping the internal
    /// `reconnect-timestamp` counter (spec.md §4.1 step 5).
    pub async fn flush_db(&self) -> Result<(), TransportError> {
        for endpoint in &self.endpoints {
            let mut conn = self.connection_for(endpoint).await?;
            redis::cmd("FLUSHDB")
                .query_async::<()>(&mut conn)
                .await
                .map_err(TransportError::from)?;
        }
        self.reconnect_timestamp.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn reconnect_timestamp(&self) -> u64 {
        self.reconnect_timestamp.load(Ordering::Relaxed)
    }
}

async fn scan_and_delete(mut conn: ConnectionManager, glob_pattern: &str) -> u64 {
    let mut removed = 0u64;
    let mut cursor: u64 = 0;
    loop {
        let (next_cursor, keys): (u64, Vec<String>) = match redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(glob_pattern)
            .arg("COUNT")
            .arg(200)
            .query_async(&mut conn)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                log::error!("kv-cache RemoveByPattern scan failed: {}", e);
                break;
            }
        };

        if !keys.is_empty() {
            match conn.del::<_, u64>(keys).await {
                Ok(n) => removed += n,
                Err(e) => log::error!("kv-cache RemoveByPattern delete failed: {}", e),
            }
        }

        cursor = next_cursor;
        if cursor == 0 {
            break;
        }
    }
    removed
}

async fn collect_matching(mut conn: ConnectionManager, pattern: &str, out: &mut HashMap<String, Vec<u8>>) {
    let mut cursor: u64 = 0;
    loop {
        let (next_cursor, keys): (u64, Vec<String>) = match redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(200)
            .query_async(&mut conn)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                log::error!("kv-cache GetAll scan failed: {}", e);
                break;
            }
        };

        for key in keys {
            if let Ok(value) = conn.get::<_, Vec<u8>>(&key).await {
                out.insert(key, value);
            }
        }

        cursor = next_cursor;
        if cursor == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn backoff_matches_spec_formula() {
        let cache = KvCache::new(CacheConfig {
            connection_strings: vec!["redis://127.0.0.1:6399".to_string()],
            retry_attempts: 3,
            retry_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_millis(50),
            static_data_root_key: "static".to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_lock_timeout: Duration::from_secs(3),
        });
        assert_eq!(cache.backoff(1), Duration::from_secs(1));
        assert_eq!(cache.backoff(2), Duration::from_secs(3));
        assert_eq!(cache.backoff(3), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn get_or_create_skips_cache_when_use_remote_is_false() {
        let cache = KvCache::new(CacheConfig {
            connection_strings: vec!["redis://127.0.0.1:6399".to_string()],
            retry_attempts: 1,
            retry_interval: Duration::from_millis(10),
            connection_timeout: Duration::from_millis(50),
            static_data_root_key: "static".to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_lock_timeout: Duration::from_millis(50),
        });

        let value = cache
            .get_or_create("k", None, false, || async { 42i32 })
            .await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn reconnect_is_single_flight_under_concurrent_callers() {
        let cache = Arc::new(KvCache::new(CacheConfig {
            connection_strings: vec!["redis://127.0.0.1:6399".to_string()],
            retry_attempts: 1,
            retry_interval: Duration::from_millis(10),
            connection_timeout: Duration::from_millis(50),
            static_data_root_key: "static".to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_lock_timeout: Duration::from_secs(3),
        }));

        let generation = cache.reconnect_timestamp();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.reconnect(generation).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.reconnect_timestamp(), generation + 1);
    }
}
