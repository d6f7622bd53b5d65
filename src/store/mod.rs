//! Fast shared store
//!
//! Everything that must be coordinated across request handlers and processes
//! (stock counters, buyer sets, cache blobs, lock tokens, existence filters and
//! the order log) lives behind [`FastStore`]. Multi-step mutations are exposed
//! as single operations so each backend can execute them indivisibly: a Lua
//! script on Redis, one critical section in memory.

pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod scripts;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;
use crate::models::CouponWindow;

pub use keys::CouponKeys;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of the indivisible check-and-reserve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionCode {
    Admitted,
    SoldOut,
    Duplicate,
    NotYetOpen,
    Closed,
    /// No window/stock state for this coupon in the fast store
    Unseeded,
}

impl AdmissionCode {
    /// Decode the integer returned by the admission script
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AdmissionCode::Admitted),
            1 => Some(AdmissionCode::SoldOut),
            2 => Some(AdmissionCode::Duplicate),
            3 => Some(AdmissionCode::NotYetOpen),
            4 => Some(AdmissionCode::Closed),
            5 => Some(AdmissionCode::Unseeded),
            _ => None,
        }
    }
}

/// Inputs of one admission attempt
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub buyer_id: u64,
    pub coupon_id: u64,
    pub token: String,
    pub now_ms: i64,
    /// How long the buyer set outlives the coupon window
    pub retention_ms: i64,
}

/// Initial fast-store state of a coupon
#[derive(Debug, Clone, Copy)]
pub struct CouponSeed {
    pub window: CouponWindow,
    pub stock: i64,
    /// Absolute expiry (epoch ms) for the stock, window and buyer keys
    pub expire_at_ms: i64,
    /// Replace existing state instead of leaving it untouched
    pub overwrite: bool,
}

/// Where a consumer-group read starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries already delivered to this consumer but never acknowledged
    OwnPending,
    /// Entries never delivered to any consumer of the group
    New,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub total: u64,
    pub by_consumer: Vec<(String, u64)>,
}

#[async_trait]
pub trait FastStore: Send + Sync {
    // Plain keys
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
    async fn del(&self, key: &str) -> StoreResult<bool>;

    // Lock primitives
    /// SET key value NX PX ttl
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;
    /// Delete only when the stored value equals `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;
    /// Renew the TTL only when the stored value equals `expected`
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
        -> StoreResult<bool>;

    // Approximate-existence filters
    /// Create the filter if it does not exist yet
    async fn bloom_reserve(&self, key: &str, error_rate: f64, capacity: usize) -> StoreResult<()>;
    /// Returns how many items were not present before in `key`. Items also
    /// land in every rebuild currently staged for `key`.
    async fn bloom_add(&self, key: &str, items: &[String]) -> StoreResult<usize>;
    async fn bloom_exists(&self, key: &str, item: &str) -> StoreResult<bool>;
    /// Create an empty filter under `staging_key` and register it as a
    /// rebuild of `key`. The staging filter expires after `ttl` unless committed.
    async fn bloom_stage(
        &self,
        key: &str,
        staging_key: &str,
        error_rate: f64,
        capacity: usize,
        ttl: Duration,
    ) -> StoreResult<()>;
    /// Load `items` into the staged filter and swap it in under `key`.
    /// Returns false when the staging filter no longer exists.
    async fn bloom_commit(&self, key: &str, staging_key: &str, items: &[String]) -> StoreResult<bool>;
    /// Drop a staged rebuild without touching `key`
    async fn bloom_discard(&self, key: &str, staging_key: &str) -> StoreResult<()>;

    // Flash-sale state
    /// Returns true when state was written
    async fn seed_coupon(&self, keys: &CouponKeys, seed: &CouponSeed) -> StoreResult<bool>;
    /// Returns the new stock, or None when the coupon is not seeded
    async fn restock(&self, keys: &CouponKeys, amount: i64) -> StoreResult<Option<i64>>;
    /// Remaining units, or None when the coupon is not seeded
    async fn stock(&self, keys: &CouponKeys) -> StoreResult<Option<i64>>;
    async fn is_buyer(&self, keys: &CouponKeys, buyer_id: u64) -> StoreResult<bool>;
    /// Window check, stock check, dedup check, decrement, dedup insert and
    /// order-log append as one indivisible unit
    async fn admit(
        &self,
        keys: &CouponKeys,
        order_stream: &str,
        request: &AdmissionRequest,
    ) -> StoreResult<AdmissionCode>;

    // Order log
    /// Create the consumer group (and stream) if missing
    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()>;
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> StoreResult<String>;
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>>;
    /// Transfer entries idle for at least `min_idle` from any consumer to `consumer`
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>>;
    /// Acknowledge and delete the entry. Returns false when it was not pending.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> StoreResult<bool>;
    /// Entries still in the log: undelivered plus delivered but unacknowledged
    async fn stream_len(&self, stream: &str) -> StoreResult<u64>;
    async fn pending_summary(&self, stream: &str, group: &str) -> StoreResult<PendingSummary>;
    /// Entries not yet delivered to the group, when the backend can tell
    async fn group_lag(&self, stream: &str, group: &str) -> StoreResult<Option<u64>>;
}
