//! Stampede-protected read-through cache
//!
//! Per lookup:
//! 1. existence filter says absent: not found, nothing else is touched
//! 2. cache hit: return it (an empty payload is a cached "not found")
//! 3. miss: claim the key in this process, then take the per-key store lock;
//!    on contention for either wait one backoff, re-read once and answer
//!    `RetryLater` if still cold
//! 4. lock held: re-read, another caller may have just filled it
//! 5. reload from the system of record under a deadline, renewing the lock
//!    until the reload ends, then fill and unlock
//!
//! A payload that fails to deserialize counts as a miss. Writers invalidate
//! by deleting the entry; the next read fills it lazily.

pub mod shop;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::configure::CacheConfig;
use crate::error::{CoreError, RepoError};
use crate::filter::ExistenceFilter;
use crate::lock::DistributedLock;
use crate::metrics::FlashSaleMetrics;
use crate::models::EntityKind;
use crate::store::keys::{cache_key, lock_key};
use crate::store::FastStore;

pub use shop::ShopService;

/// Payload cached for ids the system of record does not know
pub const NULL_MARKER: &str = "";

/// Outcome of a cached lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    /// Another caller is reloading this key; try again shortly
    RetryLater,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }
}

enum Cached<T> {
    Hit(T),
    Null,
    Miss,
}

/// Marks a key as being reloaded by this process until dropped
struct InFlight<'a> {
    keys: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> InFlight<'a> {
    fn claim(keys: &'a Mutex<HashSet<String>>, key: &str) -> Option<Self> {
        keys.lock().insert(key.to_string()).then(|| Self { keys, key: key.to_string() })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}

pub struct ReadThroughCache {
    store: Arc<dyn FastStore>,
    filter: Arc<ExistenceFilter>,
    lock: DistributedLock,
    config: CacheConfig,
    metrics: Arc<FlashSaleMetrics>,
    reloading: Mutex<HashSet<String>>,
}

impl ReadThroughCache {
    pub fn new(
        store: Arc<dyn FastStore>,
        filter: Arc<ExistenceFilter>,
        config: CacheConfig,
        metrics: Arc<FlashSaleMetrics>,
    ) -> Self {
        let lock = DistributedLock::new(store.clone());
        Self { store, filter, lock, config, metrics, reloading: Mutex::new(HashSet::new()) }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `kind`/`id`, reloading through `loader` on a miss. The reload
    /// is abandoned with `CoreError::Timeout` once `deadline` has elapsed;
    /// the lock is renewed for as long as it runs.
    pub async fn get<T, F, Fut>(
        &self,
        kind: EntityKind,
        id: u64,
        ttl: Duration,
        deadline: Duration,
        loader: F,
    ) -> Result<Lookup<T>, CoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, RepoError>>,
    {
        if !self.filter.might_exist(kind, id).await? {
            self.metrics.record_filter_rejection();
            return Ok(Lookup::NotFound);
        }

        let key = cache_key(kind, id);
        if let Some(answer) = self.read(&key).await?.answer() {
            return Ok(answer);
        }
        self.metrics.record_cache_miss();

        let Some(_in_flight) = InFlight::claim(&self.reloading, &key) else {
            return self.contended(&key).await;
        };
        let lock_key = lock_key(kind, id);
        let Some(token) = self.lock.try_acquire(&lock_key, self.config.lock_ttl()).await? else {
            return self.contended(&key).await;
        };

        let result = self.reload_locked(&key, &lock_key, &token, ttl, deadline, loader).await;

        if let Err(e) = self.lock.release(&lock_key, &token).await {
            log::warn!("Failed to release {}: {}", lock_key, e);
        }
        result
    }

    /// Delete the cached entry so the next read reloads it
    pub async fn invalidate(&self, kind: EntityKind, id: u64) -> Result<(), CoreError> {
        self.store.del(&cache_key(kind, id)).await?;
        Ok(())
    }

    /// Someone else is reloading: one backoff, one more read
    async fn contended<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>, CoreError> {
        tokio::time::sleep(self.config.lock_backoff()).await;
        match self.read(key).await?.answer() {
            Some(answer) => Ok(answer),
            None => {
                self.metrics.record_cache_retry_later();
                Ok(Lookup::RetryLater)
            }
        }
    }

    async fn reload_locked<T, F, Fut>(
        &self,
        key: &str,
        lock_key: &str,
        token: &str,
        ttl: Duration,
        deadline: Duration,
        loader: F,
    ) -> Result<Lookup<T>, CoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, RepoError>>,
    {
        if let Some(answer) = self.read(key).await?.answer() {
            return Ok(answer);
        }

        self.metrics.record_cache_reload();
        let reload = tokio::time::timeout(deadline, loader());
        let loaded = self
            .lock
            .renew_while(lock_key, token, self.config.lock_ttl(), reload)
            .await
            .map_err(|_| CoreError::Timeout("cache reload"))??;

        match loaded {
            Some(value) => {
                match serde_json::to_string(&value) {
                    Ok(payload) => {
                        if let Err(e) = self.store.set_ex(key, &payload, ttl).await {
                            log::warn!("Failed to fill cache entry {}: {}", key, e);
                        }
                    }
                    Err(e) => log::warn!("Failed to serialize cache entry {}: {}", key, e),
                }
                Ok(Lookup::Found(value))
            }
            None => {
                if let Err(e) = self.store.set_ex(key, NULL_MARKER, self.config.null_ttl()).await {
                    log::warn!("Failed to cache not-found marker {}: {}", key, e);
                }
                Ok(Lookup::NotFound)
            }
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Cached<T>, CoreError> {
        let Some(payload) = self.store.get(key).await? else {
            return Ok(Cached::Miss);
        };
        if payload == NULL_MARKER {
            self.metrics.record_cache_null_hit();
            return Ok(Cached::Null);
        }
        match serde_json::from_str(&payload) {
            Ok(value) => {
                self.metrics.record_cache_hit();
                Ok(Cached::Hit(value))
            }
            Err(e) => {
                log::warn!("Corrupt cache entry {}, treating as miss: {}", key, e);
                Ok(Cached::Miss)
            }
        }
    }
}

impl<T> Cached<T> {
    fn answer(self) -> Option<Lookup<T>> {
        match self {
            Cached::Hit(value) => Some(Lookup::Found(value)),
            Cached::Null => Some(Lookup::NotFound),
            Cached::Miss => None,
        }
    }
}
