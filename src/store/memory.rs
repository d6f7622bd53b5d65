//! In-process fast store
//!
//! Mirrors the Redis backend's semantics, including the admission script's
//! branch order, so the whole crate can run against a single process. Every
//! operation runs inside one critical section, which gives the same
//! indivisibility the Lua scripts give on Redis.

use async_trait::async_trait;
use bloomfilter::Bloom;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::{
    AdmissionCode, AdmissionRequest, CouponKeys, CouponSeed, FastStore, PendingSummary, ReadFrom,
    StoreResult, StreamEntry,
};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::models::{CouponWindow, OrderQueueEntry};

const DEFAULT_BLOOM_CAPACITY: usize = 100_000;
const DEFAULT_BLOOM_ERROR_RATE: f64 = 0.01;

struct Expiring<T> {
    value: T,
    expire_at_ms: Option<i64>,
}

impl<T> Expiring<T> {
    fn persistent(value: T) -> Self {
        Self { value, expire_at_ms: None }
    }

    fn until(value: T, expire_at_ms: i64) -> Self {
        Self { value, expire_at_ms: Some(expire_at_ms) }
    }

    fn is_live(&self, now_ms: i64) -> bool {
        self.expire_at_ms.map_or(true, |at| now_ms < at)
    }
}

/// Drop the entry when it has expired, then hand out the live value
fn live<'a, T>(
    map: &'a mut HashMap<String, Expiring<T>>,
    key: &str,
    now_ms: i64,
) -> Option<&'a mut Expiring<T>> {
    if map.get(key).is_some_and(|e| !e.is_live(now_ms)) {
        map.remove(key);
    }
    map.get_mut(key)
}

struct PendingEntry {
    consumer: String,
    delivered_at_ms: i64,
    deliveries: u64,
}

#[derive(Default)]
struct ConsumerGroup {
    /// Number of entries handed out through `ReadFrom::New`
    next_index: usize,
    pending: BTreeMap<usize, PendingEntry>,
}

/// Acknowledged entries are removed, so `entries` holds the backlog only
#[derive(Default)]
struct OrderLog {
    entries: BTreeMap<usize, StreamEntry>,
    next_seq: usize,
    index_of: HashMap<String, usize>,
    groups: HashMap<String, ConsumerGroup>,
}

impl OrderLog {
    fn push(&mut self, now_ms: i64, fields: Vec<(String, String)>) -> String {
        let index = self.next_seq;
        self.next_seq += 1;
        let id = format!("{}-{}", now_ms.max(0), index);
        self.index_of.insert(id.clone(), index);
        self.entries.insert(index, StreamEntry { id: id.clone(), fields });
        id
    }

    fn remove(&mut self, index: usize) {
        if let Some(entry) = self.entries.remove(&index) {
            self.index_of.remove(&entry.id);
        }
    }
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Expiring<String>>,
    windows: HashMap<String, Expiring<CouponWindow>>,
    sets: HashMap<String, Expiring<HashSet<String>>>,
    blooms: HashMap<String, Bloom<String>>,
    /// Live filter key to its staged rebuilds and their expiry (epoch ms)
    rebuilds: HashMap<String, HashMap<String, i64>>,
    streams: HashMap<String, OrderLog>,
}

impl State {
    /// Staging keys still registered for `key`; expired ones are dropped
    fn staged_for(&mut self, key: &str, now_ms: i64) -> Vec<String> {
        let Some(staged) = self.rebuilds.get_mut(key) else {
            return Vec::new();
        };
        let expired: Vec<String> =
            staged.iter().filter(|(_, at)| now_ms >= **at).map(|(k, _)| k.clone()).collect();
        for staging in &expired {
            staged.remove(staging);
            self.blooms.remove(staging);
        }
        staged.keys().cloned().collect()
    }
}

fn insert_items(bloom: &mut Bloom<String>, items: &[String]) -> usize {
    items.iter().filter(|item| !bloom.check_and_set(item)).count()
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    appended: Notify,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, state: Mutex::new(State::default()), appended: Notify::new() }
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn new_bloom(error_rate: f64, capacity: usize) -> StoreResult<Bloom<String>> {
        Bloom::new_for_fp_rate(capacity.max(1), error_rate)
            .map_err(|e| StoreError::Script(format!("bloom filter: {}", e)))
    }

    fn no_group(stream: &str, group: &str) -> StoreError {
        StoreError::Script(format!("NOGROUP No such key '{}' or consumer group '{}'", stream, group))
    }

    /// Hand out never-delivered entries and record them as pending
    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        let log = state.streams.get_mut(stream).ok_or_else(|| Self::no_group(stream, group))?;
        let group_state = log.groups.get_mut(group).ok_or_else(|| Self::no_group(stream, group))?;

        let mut delivered = Vec::new();
        for (index, entry) in log.entries.range(group_state.next_index..).take(count) {
            group_state.pending.insert(
                *index,
                PendingEntry { consumer: consumer.to_string(), delivered_at_ms: now_ms, deliveries: 1 },
            );
            delivered.push(entry.clone());
            group_state.next_index = index + 1;
        }
        Ok(delivered)
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        Ok(live(&mut state.strings, key, now_ms).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let expire_at = self.now_ms() + ttl.as_millis() as i64;
        let mut state = self.state.lock();
        state.strings.insert(key.to_string(), Expiring::until(value.to_string(), expire_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        let removed = live(&mut state.strings, key, now_ms).is_some();
        state.strings.remove(key);
        Ok(removed)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        if live(&mut state.strings, key, now_ms).is_some() {
            return Ok(false);
        }
        state
            .strings
            .insert(key.to_string(), Expiring::until(value.to_string(), now_ms + ttl.as_millis() as i64));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        let owned = live(&mut state.strings, key, now_ms).is_some_and(|e| e.value == expected);
        if owned {
            state.strings.remove(key);
        }
        Ok(owned)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        match live(&mut state.strings, key, now_ms) {
            Some(entry) if entry.value == expected => {
                entry.expire_at_ms = Some(now_ms + ttl.as_millis() as i64);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn bloom_reserve(&self, key: &str, error_rate: f64, capacity: usize) -> StoreResult<()> {
        let mut state = self.state.lock();
        if !state.blooms.contains_key(key) {
            state.blooms.insert(key.to_string(), Self::new_bloom(error_rate, capacity)?);
        }
        Ok(())
    }

    async fn bloom_add(&self, key: &str, items: &[String]) -> StoreResult<usize> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        if !state.blooms.contains_key(key) {
            let bloom = Self::new_bloom(DEFAULT_BLOOM_ERROR_RATE, DEFAULT_BLOOM_CAPACITY)?;
            state.blooms.insert(key.to_string(), bloom);
        }
        for staging in state.staged_for(key, now_ms) {
            if let Some(bloom) = state.blooms.get_mut(&staging) {
                insert_items(bloom, items);
            }
        }
        let bloom = state
            .blooms
            .get_mut(key)
            .ok_or_else(|| StoreError::Protocol(format!("bloom filter {} vanished", key)))?;
        Ok(insert_items(bloom, items))
    }

    async fn bloom_exists(&self, key: &str, item: &str) -> StoreResult<bool> {
        let state = self.state.lock();
        Ok(state.blooms.get(key).is_some_and(|b| b.check(&item.to_string())))
    }

    async fn bloom_stage(
        &self,
        key: &str,
        staging_key: &str,
        error_rate: f64,
        capacity: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let fresh = Self::new_bloom(error_rate, capacity)?;
        let expire_at = self.now_ms() + ttl.as_millis() as i64;
        let mut state = self.state.lock();
        state.blooms.insert(staging_key.to_string(), fresh);
        state.rebuilds.entry(key.to_string()).or_default().insert(staging_key.to_string(), expire_at);
        Ok(())
    }

    async fn bloom_commit(&self, key: &str, staging_key: &str, items: &[String]) -> StoreResult<bool> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        let staged = state.staged_for(key, now_ms).iter().any(|s| s == staging_key);
        if let Some(rebuilds) = state.rebuilds.get_mut(key) {
            rebuilds.remove(staging_key);
        }
        if !staged {
            return Ok(false);
        }
        let Some(mut fresh) = state.blooms.remove(staging_key) else {
            return Ok(false);
        };
        insert_items(&mut fresh, items);
        state.blooms.insert(key.to_string(), fresh);
        Ok(true)
    }

    async fn bloom_discard(&self, key: &str, staging_key: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some(rebuilds) = state.rebuilds.get_mut(key) {
            rebuilds.remove(staging_key);
        }
        state.blooms.remove(staging_key);
        Ok(())
    }

    async fn seed_coupon(&self, keys: &CouponKeys, seed: &CouponSeed) -> StoreResult<bool> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        if !seed.overwrite && live(&mut state.windows, &keys.window, now_ms).is_some() {
            return Ok(false);
        }
        if seed.overwrite {
            state.sets.remove(&keys.buyers);
        }
        state.windows.insert(keys.window.clone(), Expiring::until(seed.window, seed.expire_at_ms));
        state
            .strings
            .insert(keys.stock.clone(), Expiring::until(seed.stock.to_string(), seed.expire_at_ms));
        Ok(true)
    }

    async fn restock(&self, keys: &CouponKeys, amount: i64) -> StoreResult<Option<i64>> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        if live(&mut state.windows, &keys.window, now_ms).is_none() {
            return Ok(None);
        }
        if live(&mut state.strings, &keys.stock, now_ms).is_none() {
            state.strings.insert(keys.stock.clone(), Expiring::persistent("0".to_string()));
        }
        let entry = state
            .strings
            .get_mut(&keys.stock)
            .ok_or_else(|| StoreError::Protocol("stock key vanished".to_string()))?;
        let current = entry
            .value
            .parse::<i64>()
            .map_err(|_| StoreError::Script("value is not an integer".to_string()))?;
        let updated = current + amount;
        entry.value = updated.to_string();
        Ok(Some(updated))
    }

    async fn stock(&self, keys: &CouponKeys) -> StoreResult<Option<i64>> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        match live(&mut state.strings, &keys.stock, now_ms) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map(Some)
                .map_err(|_| StoreError::Protocol("stock is not an integer".to_string())),
            None => Ok(None),
        }
    }

    async fn is_buyer(&self, keys: &CouponKeys, buyer_id: u64) -> StoreResult<bool> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock();
        Ok(live(&mut state.sets, &keys.buyers, now_ms)
            .is_some_and(|set| set.value.contains(&buyer_id.to_string())))
    }

    async fn admit(
        &self,
        keys: &CouponKeys,
        order_stream: &str,
        request: &AdmissionRequest,
    ) -> StoreResult<AdmissionCode> {
        let now_ms = self.now_ms();
        let buyer = request.buyer_id.to_string();
        {
            let mut state = self.state.lock();

            let window = match live(&mut state.windows, &keys.window, now_ms) {
                Some(entry) => entry.value,
                None => return Ok(AdmissionCode::Unseeded),
            };
            if request.now_ms < window.begin_ms {
                return Ok(AdmissionCode::NotYetOpen);
            }
            if request.now_ms >= window.end_ms {
                return Ok(AdmissionCode::Closed);
            }

            let stock = match live(&mut state.strings, &keys.stock, now_ms) {
                Some(entry) => entry
                    .value
                    .parse::<i64>()
                    .map_err(|_| StoreError::Script("value is not an integer".to_string()))?,
                None => 0,
            };
            if stock <= 0 {
                return Ok(AdmissionCode::SoldOut);
            }

            if live(&mut state.sets, &keys.buyers, now_ms).is_some_and(|s| s.value.contains(&buyer)) {
                return Ok(AdmissionCode::Duplicate);
            }

            if let Some(entry) = live(&mut state.strings, &keys.stock, now_ms) {
                entry.value = (stock - 1).to_string();
            }
            let buyers_expire_at = window.end_ms + request.retention_ms;
            match live(&mut state.sets, &keys.buyers, now_ms) {
                Some(set) => {
                    set.value.insert(buyer.clone());
                    set.expire_at_ms = Some(buyers_expire_at);
                }
                None => {
                    let set = HashSet::from([buyer.clone()]);
                    state.sets.insert(keys.buyers.clone(), Expiring::until(set, buyers_expire_at));
                }
            }

            let fields = vec![
                (OrderQueueEntry::FIELD_BUYER.to_string(), buyer),
                (OrderQueueEntry::FIELD_COUPON.to_string(), request.coupon_id.to_string()),
                (OrderQueueEntry::FIELD_TOKEN.to_string(), request.token.clone()),
            ];
            state.streams.entry(order_stream.to_string()).or_default().push(now_ms, fields);
        }

        self.appended.notify_waiters();
        Ok(AdmissionCode::Admitted)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> StoreResult<String> {
        let now_ms = self.now_ms();
        let id = {
            let mut state = self.state.lock();
            state.streams.entry(stream.to_string()).or_default().push(now_ms, fields.to_vec())
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>> {
        if from == ReadFrom::OwnPending {
            let now_ms = self.now_ms();
            let mut state = self.state.lock();
            let log = state.streams.get_mut(stream).ok_or_else(|| Self::no_group(stream, group))?;
            let group_state =
                log.groups.get_mut(group).ok_or_else(|| Self::no_group(stream, group))?;

            let mut entries = Vec::new();
            for (index, pending) in group_state.pending.iter_mut() {
                if entries.len() >= count {
                    break;
                }
                if pending.consumer != consumer {
                    continue;
                }
                let Some(entry) = log.entries.get(index) else {
                    continue;
                };
                pending.deliveries += 1;
                pending.delivered_at_ms = now_ms;
                entries.push(entry.clone());
            }
            return Ok(entries);
        }

        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.deliver_new(stream, group, consumer, count)?;
            if !entries.is_empty() || block.is_zero() {
                return Ok(entries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(entries);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let now_ms = self.now_ms();
        let min_idle_ms = min_idle.as_millis() as i64;
        let mut state = self.state.lock();
        let log = state.streams.get_mut(stream).ok_or_else(|| Self::no_group(stream, group))?;
        let group_state = log.groups.get_mut(group).ok_or_else(|| Self::no_group(stream, group))?;

        let mut claimed = Vec::new();
        for (index, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now_ms - pending.delivered_at_ms < min_idle_ms {
                continue;
            }
            let Some(entry) = log.entries.get(index) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at_ms = now_ms;
            pending.deliveries += 1;
            claimed.push(entry.clone());
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let Some(log) = state.streams.get_mut(stream) else {
            return Ok(false);
        };
        let Some(index) = log.index_of.get(id).copied() else {
            return Ok(false);
        };
        let acked = log.groups.get_mut(group).is_some_and(|g| g.pending.remove(&index).is_some());
        if acked {
            log.remove(index);
        }
        Ok(acked)
    }

    async fn stream_len(&self, stream: &str) -> StoreResult<u64> {
        let state = self.state.lock();
        Ok(state.streams.get(stream).map_or(0, |log| log.entries.len() as u64))
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> StoreResult<PendingSummary> {
        let state = self.state.lock();
        let Some(group_state) = state.streams.get(stream).and_then(|log| log.groups.get(group)) else {
            return Ok(PendingSummary::default());
        };

        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for pending in group_state.pending.values() {
            *counts.entry(pending.consumer.as_str()).or_default() += 1;
        }
        Ok(PendingSummary {
            total: group_state.pending.len() as u64,
            by_consumer: counts.into_iter().map(|(name, n)| (name.to_string(), n)).collect(),
        })
    }

    async fn group_lag(&self, stream: &str, group: &str) -> StoreResult<Option<u64>> {
        let state = self.state.lock();
        Ok(state.streams.get(stream).and_then(|log| {
            log.groups
                .get(group)
                .map(|g| log.entries.range(g.next_index..).count() as u64)
        }))
    }
}
