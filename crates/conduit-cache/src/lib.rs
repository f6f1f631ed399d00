//! Read-through cache over the shared store
//!
//! Values are stored as JSON with a TTL spread by a random jitter so that
//! entries written together do not expire together. Versioned entries
//! carry the domain version they were computed under, and a version bump
//! invalidates every entry of the domain without deleting keys.
//! [`CacheLayer::get_or_load`] coalesces concurrent refreshes of one key
//! through a lock in the shared store.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conduit_config::CacheConfig;
use conduit_store::{SharedStore, StoreError};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Shared store failure
    #[error("cache backend: {0}")]
    Backend(#[from] StoreError),
    /// Serialization error
    #[error("serialization: {0}")]
    Serialization(String),
}

/// Cached value together with the domain version it was computed under
#[derive(Serialize, serde::Deserialize)]
struct Versioned<T> {
    version: u64,
    value: T,
}

/// Read-through cache with single-flight refresh
#[derive(Clone)]
pub struct CacheLayer {
    store: Arc<dyn SharedStore>,
    config: CacheConfig,
    namespace: String,
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("backend", &self.store.backend())
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl CacheLayer {
    pub fn new(store: Arc<dyn SharedStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            namespace: "cache".to_owned(),
        }
    }

    /// Cache sharing the store and tuning but writing under another namespace
    #[must_use]
    pub fn scoped(&self, namespace: &str) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            namespace: namespace.to_owned(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }

    fn version_key(&self, domain: &str) -> String {
        format!("{}:version:{domain}", self.namespace)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{key}", self.namespace)
    }

    /// TTL spread uniformly over `ttl * (1 ± jitter_ratio)`, never below one second
    pub fn jittered_ttl(&self, ttl: Duration) -> Duration {
        let ratio = self.config.jitter_ratio;
        if ratio <= 0.0 {
            return ttl.max(Duration::from_secs(1));
        }

        let factor = rand::rng().random_range((1.0 - ratio)..=(1.0 + ratio));
        ttl.mul_f64(factor).max(Duration::from_secs(1))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(raw) = self.store.get(&self.key(key)).await? else {
            return Ok(None);
        };

        decode(key, &raw).map(Some)
    }

    /// Values for several keys, skipping misses and undecodable entries
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[String]) -> Result<HashMap<String, T>, CacheError> {
        let full: Vec<String> = keys.iter().map(|key| self.key(key)).collect();
        let values = self.store.get_many(&full).await?;

        let mut found = HashMap::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else { continue };
            match decode(key, &raw) {
                Ok(value) => {
                    found.insert(key.clone(), value);
                }
                Err(e) => tracing::debug!(cache_key = %key, error = %e, "skipping undecodable cache entry"),
            }
        }

        Ok(found)
    }

    /// Store a value. `None` uses the configured default TTL.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), CacheError> {
        let data = encode(value)?;
        let ttl = self.jittered_ttl(ttl.unwrap_or(self.config.default_ttl));
        self.store.set(&self.key(key), &data, Some(ttl)).await?;

        tracing::debug!(cache_key = key, ttl_ms = ttl.as_millis(), "cached value");
        Ok(())
    }

    /// Current version of a cache domain, zero until first bumped
    pub async fn current_version(&self, domain: &str) -> Result<u64, CacheError> {
        let Some(raw) = self.store.get(&self.version_key(domain)).await? else {
            return Ok(0);
        };

        raw.parse()
            .map_err(|_| CacheError::Serialization(format!("version of {domain} is not a number: {raw}")))
    }

    /// Invalidate every versioned entry of a domain
    pub async fn bump_version(&self, domain: &str) -> Result<u64, CacheError> {
        let next = self.store.incr(&self.version_key(domain), 1).await?;
        Ok(u64::try_from(next).unwrap_or(0))
    }

    /// Value cached under exactly `version`; older or newer entries read as misses
    pub async fn get_with_version<T: DeserializeOwned>(&self, key: &str, version: u64) -> Result<Option<T>, CacheError> {
        let entry: Option<Versioned<T>> = self.get(key).await?;
        Ok(entry.filter(|entry| entry.version == version).map(|entry| entry.value))
    }

    pub async fn set_with_version<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        version: u64,
    ) -> Result<(), CacheError> {
        self.set(key, &Versioned { version, value }, ttl).await
    }

    async fn read<T: DeserializeOwned>(&self, key: &str, version: Option<u64>) -> Result<Option<T>, CacheError> {
        match version {
            Some(version) => self.get_with_version(key, version).await,
            None => self.get(key).await,
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>, version: Option<u64>) {
        let result = match version {
            Some(version) => self.set_with_version(key, value, ttl, version).await,
            None => self.set(key, value, ttl).await,
        };

        if let Err(e) = result {
            tracing::warn!(cache_key = key, error = %e, "failed to populate cache");
        }
    }

    /// Read a value, computing and caching it on a miss
    ///
    /// Of several concurrent callers missing the same key, one acquires a
    /// short lock in the shared store and runs `loader`. The others poll
    /// the cache for its result and only run `loader` themselves after the
    /// bounded wait runs out. Store failures degrade to calling `loader`
    /// directly. Loader errors are returned and never cached.
    pub async fn get_or_load<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        version: Option<u64>,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        match self.read(key, version).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(cache_key = key, error = %e, "cache read failed, loading directly");
                return loader().await;
            }
        }

        let lock_key = self.lock_key(key);
        let token = uuid::Uuid::new_v4().to_string();

        match self.store.set_nx(&lock_key, &token, self.config.lock_ttl).await {
            Ok(true) => {
                let result = self.load_holding_lock(key, ttl, version, loader).await;

                if let Err(e) = self.store.compare_and_delete(&lock_key, &token).await {
                    tracing::warn!(cache_key = key, error = %e, "failed to release cache lock");
                }

                result
            }
            Ok(false) => {
                for _ in 0..self.config.wait_attempts {
                    tokio::time::sleep(self.config.wait_interval).await;

                    if let Ok(Some(value)) = self.read(key, version).await {
                        return Ok(value);
                    }
                }

                tracing::debug!(cache_key = key, "gave up waiting for concurrent refresh");
                let value = loader().await?;
                self.write(key, &value, ttl, version).await;
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(cache_key = key, error = %e, "cache lock unavailable, loading directly");
                loader().await
            }
        }
    }

    async fn load_holding_lock<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        version: Option<u64>,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        // Another holder may have finished between our miss and our lock
        if let Ok(Some(value)) = self.read(key, version).await {
            return Ok(value);
        }

        let value = loader().await?;
        self.write(key, &value, ttl, version).await;
        Ok(value)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, CacheError> {
    serde_json::to_string(value).map_err(|e| CacheError::Serialization(format!("serialize: {e}")))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, CacheError> {
    serde_json::from_str(raw).map_err(|e| CacheError::Serialization(format!("deserialize {key}: {e}")))
}

/// Hex SHA-256 digest of a serializable value's canonical JSON
pub fn compute_cache_key<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_string(value).unwrap_or_default();
    hash_bytes(json.as_bytes())
}

/// Hex SHA-256 digest of raw bytes
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use conduit_store::MemoryStore;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        score: u32,
    }

    fn config() -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(2),
            wait_interval: Duration::from_millis(10),
            wait_attempts: 50,
            jitter_ratio: 0.1,
        }
    }

    fn layer() -> (MemoryStore, CacheLayer) {
        let store = MemoryStore::new();
        let cache = CacheLayer::new(Arc::new(store.clone()), config());
        (store, cache)
    }

    #[tokio::test]
    async fn set_then_get() {
        let (_, cache) = layer();
        let profile = Profile {
            name: "a".to_string(),
            score: 1,
        };

        cache.set("p", &profile, None).await.unwrap();

        assert_eq!(cache.get::<Profile>("p").await.unwrap(), Some(profile));
        assert_eq!(cache.get::<Profile>("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn version_bump_invalidates_entries() {
        let (_, cache) = layer();

        let v0 = cache.current_version("arms").await.unwrap();
        assert_eq!(v0, 0);
        cache.set_with_version("k", &7u32, None, v0).await.unwrap();
        assert_eq!(cache.get_with_version::<u32>("k", v0).await.unwrap(), Some(7));

        let v1 = cache.bump_version("arms").await.unwrap();
        assert_eq!(v1, 1);
        assert_eq!(cache.get_with_version::<u32>("k", v1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn jitter_stays_within_ratio() {
        let (_, cache) = layer();
        let base = Duration::from_secs(100);

        for _ in 0..200 {
            let ttl = cache.jittered_ttl(base);
            assert!(ttl >= Duration::from_secs(90), "{ttl:?} below range");
            assert!(ttl <= Duration::from_secs(110), "{ttl:?} above range");
        }
    }

    #[tokio::test]
    async fn get_many_skips_misses() {
        let (_, cache) = layer();
        cache.set("a", &1u32, None).await.unwrap();
        cache.set("c", &3u32, None).await.unwrap();

        let found: HashMap<String, u32> = cache
            .get_many(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found.get("c"), Some(&3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_load() {
        let (_, cache) = layer();
        let loads = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let loads = Arc::clone(&loads);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("hot", None, None, || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(Profile {
                            name: "hot".to_string(),
                            score: 42,
                        })
                    })
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value.score, 42);
        }

        assert!(loads.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test]
    async fn store_outage_falls_back_to_loader() {
        let (store, cache) = layer();
        store.set_offline(true);

        let value = cache
            .get_or_load("k", None, None, || async { Ok::<_, String>(5u32) })
            .await
            .unwrap();

        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn loader_errors_are_not_cached() {
        let (_, cache) = layer();

        let err = cache
            .get_or_load("k", None, None, || async { Err::<u32, _>("boom".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");

        let value = cache
            .get_or_load("k", None, None, || async { Ok::<_, String>(9u32) })
            .await
            .unwrap();
        assert_eq!(value, 9);
    }

    #[test]
    fn cache_key_is_deterministic() {
        let a = serde_json::json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});
        let b = serde_json::json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "bye"}]});

        assert_eq!(compute_cache_key(&a), compute_cache_key(&a));
        assert_ne!(compute_cache_key(&a), compute_cache_key(&b));
        assert_eq!(hash_bytes(b"abc").len(), 64);
    }
}
