//! Approximate-existence filters
//!
//! One Bloom filter per [`EntityKind`], held in the fast store so every
//! process shares it. A filter answers "definitely absent" or "possibly
//! present"; it never forgets an id, so deleted entities keep passing until
//! the next full rebuild.
//!
//! Two rules keep the no-false-negative guarantee:
//! - a kind whose warm-up failed answers "possibly present" for every id
//! - a rebuild registers its staging filter in the store before scanning, and
//!   every `add` from any process lands in each registered staging filter
//!   until it is swapped in

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::configure::FiltersConfig;
use crate::error::CoreError;
use crate::lock::new_token;
use crate::logging;
use crate::models::EntityKind;
use crate::persistence::Repository;
use crate::store::keys::{bloom_key, bloom_staging_key};
use crate::store::FastStore;

/// An abandoned staging filter disappears after this long
const STAGING_TTL: Duration = Duration::from_secs(600);

/// Build state of one kind's filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindHealth {
    /// The filter was built from a full scan at least once
    pub warmed: bool,
    /// Ids loaded by the last successful (re)build
    pub loaded: usize,
    pub last_built_ms: Option<i64>,
    pub last_error: Option<String>,
}

pub struct ExistenceFilter {
    store: Arc<dyn FastStore>,
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    config: FiltersConfig,
    health: Mutex<HashMap<EntityKind, KindHealth>>,
}

impl ExistenceFilter {
    pub fn new(
        store: Arc<dyn FastStore>,
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        config: FiltersConfig,
    ) -> Self {
        Self {
            store,
            repo,
            clock,
            config,
            health: Mutex::new(HashMap::new()),
        }
    }

    /// Insert an id. Adding an id twice is a no-op.
    pub async fn add(&self, kind: EntityKind, id: u64) -> Result<(), CoreError> {
        self.store.bloom_add(&bloom_key(kind), &[id.to_string()]).await?;
        Ok(())
    }

    /// False only when `id` was never added
    pub async fn might_exist(&self, kind: EntityKind, id: u64) -> Result<bool, CoreError> {
        if !self.is_warmed(kind) {
            return Ok(true);
        }
        Ok(self.store.bloom_exists(&bloom_key(kind), &id.to_string()).await?)
    }

    pub fn is_warmed(&self, kind: EntityKind) -> bool {
        self.health.lock().get(&kind).is_some_and(|h| h.warmed)
    }

    pub fn health(&self) -> Vec<(EntityKind, KindHealth)> {
        let health = self.health.lock();
        EntityKind::ALL
            .iter()
            .map(|kind| (*kind, health.get(kind).cloned().unwrap_or_default()))
            .collect()
    }

    /// Build every kind from a full scan. A kind that fails stays in
    /// fail-open mode; the error is logged and recorded in its health.
    pub async fn warm_up(&self) -> Vec<(EntityKind, Result<usize, CoreError>)> {
        let mut results = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            let result = self.rebuild(kind).await;
            if let Err(e) = &result {
                log::error!("Filter warm-up for {} failed, answering possibly-present: {}", kind, e);
            }
            results.push((kind, result));
        }
        results
    }

    /// Rebuild one kind from a full scan into a fresh filter and swap it in
    pub async fn rebuild(&self, kind: EntityKind) -> Result<usize, CoreError> {
        let started = Instant::now();
        let result = self.scan_and_swap(kind).await;

        let mut health = self.health.lock();
        let entry = health.entry(kind).or_default();
        match result {
            Ok(loaded) => {
                entry.warmed = true;
                entry.loaded = loaded;
                entry.last_built_ms = Some(self.clock.now_ms());
                entry.last_error = None;
                drop(health);
                logging::log_filter_rebuilt(kind.as_str(), loaded, started.elapsed().as_millis() as u64);
                Ok(loaded)
            }
            Err(e) => {
                entry.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn scan_and_swap(&self, kind: EntityKind) -> Result<usize, CoreError> {
        let settings = self.config.settings(kind);
        let capacity = settings.capacity.max(self.loaded(kind));
        let key = bloom_key(kind);
        let staging = bloom_staging_key(kind, &new_token());

        // Staged before the scan: ids added from here on reach both filters
        self.store.bloom_stage(&key, &staging, settings.error_rate, capacity, STAGING_TTL).await?;

        let ids = match self.repo.all_ids(kind).await {
            Ok(ids) => ids,
            Err(e) => {
                self.discard(&key, &staging).await;
                return Err(e.into());
            }
        };
        let items: Vec<String> = ids.iter().map(|id| id.to_string()).collect();

        match self.store.bloom_commit(&key, &staging, &items).await {
            Ok(true) => Ok(items.len()),
            Ok(false) => Err(CoreError::Timeout("filter rebuild")),
            Err(e) => {
                self.discard(&key, &staging).await;
                Err(e.into())
            }
        }
    }

    async fn discard(&self, key: &str, staging: &str) {
        if let Err(e) = self.store.bloom_discard(key, staging).await {
            log::warn!("Failed to discard staged filter {}: {}", staging, e);
        }
    }

    fn loaded(&self, kind: EntityKind) -> usize {
        self.health.lock().get(&kind).map_or(0, |h| h.loaded)
    }
}

/// Periodically rebuilds every filter so deleted ids eventually stop passing
pub struct FilterRebuilder {
    filter: Arc<ExistenceFilter>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl FilterRebuilder {
    pub fn new(filter: Arc<ExistenceFilter>, interval: Duration, running: Arc<AtomicBool>) -> Self {
        Self { filter, interval: interval.max(Duration::from_millis(1)), running }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        log::info!("Filter rebuilder started, interval {:?}", self.interval);
        let tick = Duration::from_millis(200).min(self.interval);

        'outer: loop {
            let mut waited = Duration::ZERO;
            while waited < self.interval {
                if !self.running.load(Ordering::SeqCst) {
                    break 'outer;
                }
                tokio::time::sleep(tick).await;
                waited += tick;
            }

            for kind in EntityKind::ALL {
                if let Err(e) = self.filter.rebuild(kind).await {
                    log::warn!("Periodic rebuild of {} filter failed: {}", kind, e);
                }
            }
        }
        log::info!("Filter rebuilder stopped");
    }
}
