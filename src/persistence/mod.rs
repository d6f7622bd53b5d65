//! System of record
//!
//! The durable side of the system: shops, users, flash coupons and the orders
//! materialised by the pipeline. [`Repository`] is the seam; production uses
//! [`ScyllaRepository`], tests and single-process runs use
//! [`InMemoryRepository`].

pub mod memory;
pub mod scylla_repo;

use async_trait::async_trait;

use crate::error::RepoError;
use crate::models::{EntityKind, FlashCoupon, NewFlashCoupon, OrderQueueEntry, PersistedOrder, Shop};

pub use self::memory::InMemoryRepository;
pub use self::scylla_repo::ScyllaRepository;

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Window and stock of a flash coupon
    async fn load_coupon(&self, coupon_id: u64) -> RepoResult<Option<FlashCoupon>>;

    async fn create_coupon(&self, coupon: &NewFlashCoupon) -> RepoResult<u64>;

    /// Orders persisted so far for a coupon
    async fn count_orders(&self, coupon_id: u64) -> RepoResult<u64>;

    /// Persist the order for an admitted purchase.
    ///
    /// Returns the new order id, or `RepoError::DuplicateOrder` carrying the
    /// existing row when (buyer, coupon) already has an order.
    async fn create_order(&self, entry: &OrderQueueEntry) -> RepoResult<u64>;

    async fn find_order(&self, buyer_id: u64, coupon_id: u64) -> RepoResult<Option<PersistedOrder>>;

    async fn all_shop_ids(&self) -> RepoResult<Vec<u64>>;
    async fn all_user_ids(&self) -> RepoResult<Vec<u64>>;
    async fn all_coupon_ids(&self) -> RepoResult<Vec<u64>>;

    async fn load_shop(&self, shop_id: u64) -> RepoResult<Option<Shop>>;

    /// Update an existing shop; `RepoError::NotFound` when there is none
    async fn save_shop(&self, shop: &Shop) -> RepoResult<()>;

    /// Insert a new shop and return its id (assigned when `shop.id` is 0)
    async fn create_shop(&self, shop: &Shop) -> RepoResult<u64>;

    /// Full id scan used to (re)build the existence filter of `kind`
    async fn all_ids(&self, kind: EntityKind) -> RepoResult<Vec<u64>> {
        match kind {
            EntityKind::Shop => self.all_shop_ids().await,
            EntityKind::User => self.all_user_ids().await,
            EntityKind::Coupon => self.all_coupon_ids().await,
        }
    }
}
