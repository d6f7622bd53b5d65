/// In-process system of record for tests and single-node runs.
///
/// Besides the data itself it counts calls per operation and lets a test
/// inject latency or make the whole repository unavailable, so scenario
/// tests can assert how often the slow path was actually hit.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{RepoResult, Repository};
use crate::clock::Clock;
use crate::error::RepoError;
use crate::id_gen::IdGenerator;
use crate::models::{
    CouponWindow, FlashCoupon, NewFlashCoupon, OrderQueueEntry, OrderStatus, PersistedOrder, Shop,
};

#[derive(Default)]
struct Tables {
    shops: BTreeMap<u64, Shop>,
    users: BTreeSet<u64>,
    coupons: BTreeMap<u64, FlashCoupon>,
    /// Keyed by (buyer_id, coupon_id), the uniqueness constraint
    orders: HashMap<(u64, u64), PersistedOrder>,
}

#[derive(Debug, Default)]
pub struct CallCounters {
    pub load_shop: AtomicU64,
    pub load_coupon: AtomicU64,
    pub create_order: AtomicU64,
    pub id_scans: AtomicU64,
}

pub struct InMemoryRepository {
    tables: Mutex<Tables>,
    ids: IdGenerator,
    clock: Arc<dyn Clock>,
    latency_ms: AtomicU64,
    scan_stall_ms: AtomicU64,
    unavailable: AtomicBool,
    pub calls: CallCounters,
}

impl InMemoryRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            ids: IdGenerator::new(2),
            clock,
            latency_ms: AtomicU64::new(0),
            scan_stall_ms: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            calls: CallCounters::default(),
        }
    }

    pub fn insert_shop(&self, shop: Shop) {
        self.tables.lock().shops.insert(shop.id, shop);
    }

    pub fn insert_user(&self, user_id: u64) {
        self.tables.lock().users.insert(user_id);
    }

    pub fn insert_coupon(&self, coupon: FlashCoupon) {
        self.tables.lock().coupons.insert(coupon.id, coupon);
    }

    pub fn remove_shop(&self, shop_id: u64) {
        self.tables.lock().shops.remove(&shop_id);
    }

    /// Every call sleeps this long before touching the tables
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Id scans sleep this long after reading, before returning the ids
    pub fn set_scan_stall(&self, stall: Duration) {
        self.scan_stall_ms.store(stall.as_millis() as u64, Ordering::SeqCst);
    }

    /// While set, every call fails with `RepoError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn orders(&self) -> Vec<PersistedOrder> {
        let mut orders: Vec<_> = self.tables.lock().orders.values().cloned().collect();
        orders.sort_by_key(|o| (o.coupon_id, o.buyer_id));
        orders
    }

    pub fn load_shop_calls(&self) -> u64 {
        self.calls.load_shop.load(Ordering::SeqCst)
    }

    pub fn create_order_calls(&self) -> u64 {
        self.calls.create_order.load(Ordering::SeqCst)
    }

    async fn enter(&self, counter: Option<&AtomicU64>) -> RepoResult<()> {
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }

    async fn finish_scan(&self, ids: Vec<u64>) -> RepoResult<Vec<u64>> {
        let stall = self.scan_stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        Ok(ids)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn load_coupon(&self, coupon_id: u64) -> RepoResult<Option<FlashCoupon>> {
        self.enter(Some(&self.calls.load_coupon)).await?;
        Ok(self.tables.lock().coupons.get(&coupon_id).cloned())
    }

    async fn create_coupon(&self, coupon: &NewFlashCoupon) -> RepoResult<u64> {
        self.enter(None).await?;
        let id = self.ids.next_id();
        let record = FlashCoupon {
            id,
            shop_id: coupon.shop_id,
            title: coupon.title.clone(),
            pay_value: coupon.pay_value,
            actual_value: coupon.actual_value,
            window: CouponWindow::new(coupon.begin_ms, coupon.end_ms),
            stock: coupon.stock,
        };
        self.tables.lock().coupons.insert(id, record);
        Ok(id)
    }

    async fn count_orders(&self, coupon_id: u64) -> RepoResult<u64> {
        self.enter(None).await?;
        let tables = self.tables.lock();
        Ok(tables.orders.values().filter(|o| o.coupon_id == coupon_id).count() as u64)
    }

    async fn create_order(&self, entry: &OrderQueueEntry) -> RepoResult<u64> {
        self.enter(Some(&self.calls.create_order)).await?;
        let now_ms = self.clock.now_ms();
        let mut tables = self.tables.lock();

        if let Some(existing) = tables.orders.get(&(entry.buyer_id, entry.coupon_id)) {
            return Err(RepoError::DuplicateOrder { existing: existing.clone() });
        }

        let order_id = self.ids.next_id();
        tables.orders.insert(
            (entry.buyer_id, entry.coupon_id),
            PersistedOrder {
                order_id,
                buyer_id: entry.buyer_id,
                coupon_id: entry.coupon_id,
                token: entry.token.clone(),
                status: OrderStatus::Unpaid,
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
            },
        );
        Ok(order_id)
    }

    async fn find_order(&self, buyer_id: u64, coupon_id: u64) -> RepoResult<Option<PersistedOrder>> {
        self.enter(None).await?;
        Ok(self.tables.lock().orders.get(&(buyer_id, coupon_id)).cloned())
    }

    async fn all_shop_ids(&self) -> RepoResult<Vec<u64>> {
        self.enter(Some(&self.calls.id_scans)).await?;
        let ids = self.tables.lock().shops.keys().copied().collect();
        self.finish_scan(ids).await
    }

    async fn all_user_ids(&self) -> RepoResult<Vec<u64>> {
        self.enter(Some(&self.calls.id_scans)).await?;
        let ids = self.tables.lock().users.iter().copied().collect();
        self.finish_scan(ids).await
    }

    async fn all_coupon_ids(&self) -> RepoResult<Vec<u64>> {
        self.enter(Some(&self.calls.id_scans)).await?;
        let ids = self.tables.lock().coupons.keys().copied().collect();
        self.finish_scan(ids).await
    }

    async fn load_shop(&self, shop_id: u64) -> RepoResult<Option<Shop>> {
        self.enter(Some(&self.calls.load_shop)).await?;
        Ok(self.tables.lock().shops.get(&shop_id).cloned())
    }

    async fn save_shop(&self, shop: &Shop) -> RepoResult<()> {
        self.enter(None).await?;
        let mut tables = self.tables.lock();
        match tables.shops.get_mut(&shop.id) {
            Some(row) => {
                *row = shop.clone();
                Ok(())
            }
            None => Err(RepoError::NotFound(shop.id)),
        }
    }

    async fn create_shop(&self, shop: &Shop) -> RepoResult<u64> {
        self.enter(None).await?;
        let id = if shop.id == 0 { self.ids.next_id() } else { shop.id };
        let mut tables = self.tables.lock();
        if tables.shops.contains_key(&id) {
            return Err(RepoError::Invalid(format!("shop {} already exists", id)));
        }
        tables.shops.insert(id, Shop { id, ..shop.clone() });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn repo() -> InMemoryRepository {
        InMemoryRepository::new(Arc::new(MockClock::at_ms(1_000)))
    }

    fn entry(buyer_id: u64, token: &str) -> OrderQueueEntry {
        OrderQueueEntry { buyer_id, coupon_id: 9, token: token.to_string() }
    }

    #[tokio::test]
    async fn test_order_uniqueness_per_buyer_and_coupon() {
        let repo = repo();
        let order_id = repo.create_order(&entry(1, "a")).await.unwrap();

        match repo.create_order(&entry(1, "b")).await {
            Err(RepoError::DuplicateOrder { existing }) => {
                assert_eq!(existing.order_id, order_id);
                assert_eq!(existing.token, "a");
            }
            other => panic!("expected duplicate, got {:?}", other),
        }

        repo.create_order(&entry(2, "c")).await.unwrap();
        assert_eq!(repo.count_orders(9).await.unwrap(), 2);
        assert_eq!(repo.create_order_calls(), 3);
    }

    #[tokio::test]
    async fn test_injected_outage() {
        let repo = repo();
        repo.set_unavailable(true);
        assert!(matches!(repo.load_shop(1).await, Err(RepoError::Unavailable(_))));
        assert_eq!(repo.load_shop_calls(), 1);

        repo.set_unavailable(false);
        assert_eq!(repo.load_shop(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shop_writes() {
        let repo = repo();
        let id = repo.create_shop(&Shop { name: "noodles".into(), ..Default::default() }).await.unwrap();
        assert_ne!(id, 0);

        let mut shop = repo.load_shop(id).await.unwrap().unwrap();
        shop.name = "better noodles".into();
        repo.save_shop(&shop).await.unwrap();
        assert_eq!(repo.load_shop(id).await.unwrap().unwrap().name, "better noodles");

        let missing = Shop { id: 77, ..Default::default() };
        assert_eq!(repo.save_shop(&missing).await, Err(RepoError::NotFound(77)));
        assert_eq!(repo.all_shop_ids().await.unwrap(), vec![id]);
    }
}
