use std::sync::Arc;

use crate::clock::Clock;
use crate::configure::SeckillConfig;
use crate::error::CoreError;
use crate::filter::ExistenceFilter;
use crate::logging;
use crate::models::{CouponWindow, EntityKind, NewFlashCoupon};
use crate::persistence::Repository;
use crate::store::{CouponKeys, CouponSeed, FastStore};

/// Publication and restock of flash-sale coupons
pub struct CouponAdmin {
    store: Arc<dyn FastStore>,
    repo: Arc<dyn Repository>,
    filter: Arc<ExistenceFilter>,
    clock: Arc<dyn Clock>,
    config: SeckillConfig,
}

impl CouponAdmin {
    pub fn new(
        store: Arc<dyn FastStore>,
        repo: Arc<dyn Repository>,
        filter: Arc<ExistenceFilter>,
        clock: Arc<dyn Clock>,
        config: SeckillConfig,
    ) -> Self {
        Self { store, repo, filter, clock, config }
    }

    pub fn validate(&self, coupon: &NewFlashCoupon) -> Result<(), CoreError> {
        if coupon.end_ms <= coupon.begin_ms {
            return Err(CoreError::Invalid("end time must be after begin time".to_string()));
        }
        if coupon.begin_ms < self.clock.now_ms() {
            return Err(CoreError::Invalid("begin time must not be in the past".to_string()));
        }
        if coupon.stock < 1 {
            return Err(CoreError::Invalid("stock must be at least 1".to_string()));
        }
        if coupon.pay_value <= coupon.actual_value {
            return Err(CoreError::Invalid("pay value must exceed actual value".to_string()));
        }
        Ok(())
    }

    /// Create the coupon, register it with the coupon filter and seed its
    /// window and stock, replacing any earlier fast-store state for the id.
    pub async fn publish(&self, coupon: &NewFlashCoupon) -> Result<u64, CoreError> {
        self.validate(coupon)?;

        let coupon_id = self.repo.create_coupon(coupon).await?;
        self.filter.add(EntityKind::Coupon, coupon_id).await?;

        let seed = CouponSeed {
            window: CouponWindow::new(coupon.begin_ms, coupon.end_ms),
            stock: coupon.stock,
            expire_at_ms: coupon.end_ms + self.config.dedup_retention().as_millis() as i64,
            overwrite: true,
        };
        self.store.seed_coupon(&CouponKeys::new(coupon_id), &seed).await?;

        logging::log_coupon_published(coupon_id, coupon.shop_id, coupon.stock, coupon.begin_ms, coupon.end_ms);
        Ok(coupon_id)
    }

    /// Add `amount` units to a seeded coupon's stock; returns the new stock
    pub async fn restock(&self, coupon_id: u64, amount: i64) -> Result<i64, CoreError> {
        if amount <= 0 {
            return Err(CoreError::Invalid("restock amount must be positive".to_string()));
        }
        match self.store.restock(&CouponKeys::new(coupon_id), amount).await? {
            Some(stock) => {
                log::info!("Coupon {} restocked by {}, stock now {}", coupon_id, amount, stock);
                Ok(stock)
            }
            None => Err(CoreError::Invalid(format!("coupon {} has no active sale state", coupon_id))),
        }
    }

    /// Units left in the fast store; None while the coupon is not seeded
    pub async fn remaining_stock(&self, coupon_id: u64) -> Result<Option<i64>, CoreError> {
        Ok(self.store.stock(&CouponKeys::new(coupon_id)).await?)
    }

    /// Whether `buyer_id` was admitted for the coupon's current sale
    pub async fn has_purchased(&self, coupon_id: u64, buyer_id: u64) -> Result<bool, CoreError> {
        Ok(self.store.is_buyer(&CouponKeys::new(coupon_id), buyer_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::configure::FiltersConfig;
    use crate::persistence::InMemoryRepository;
    use crate::store::MemoryStore;

    fn new_coupon(begin_ms: i64, end_ms: i64) -> NewFlashCoupon {
        NewFlashCoupon {
            shop_id: 1,
            title: "100 off".into(),
            sub_title: String::new(),
            rules: String::new(),
            pay_value: 10_000,
            actual_value: 8_000,
            stock: 3,
            begin_ms,
            end_ms,
        }
    }

    async fn admin() -> (Arc<MemoryStore>, Arc<InMemoryRepository>, CouponAdmin) {
        let clock = Arc::new(MockClock::at_ms(1_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let repo = Arc::new(InMemoryRepository::new(clock.clone()));
        let filter = Arc::new(ExistenceFilter::new(store.clone(), repo.clone(), clock.clone(), FiltersConfig::default()));
        filter.warm_up().await;
        let admin = CouponAdmin::new(store.clone(), repo.clone(), filter, clock, SeckillConfig::default());
        (store, repo, admin)
    }

    #[tokio::test]
    async fn test_publish_seeds_stock() {
        let (store, repo, admin) = admin().await;
        let id = admin.publish(&new_coupon(2_000, 3_000)).await.unwrap();

        assert_eq!(store.stock(&CouponKeys::new(id)).await.unwrap(), Some(3));
        assert_eq!(repo.load_coupon(id).await.unwrap().unwrap().window, CouponWindow::new(2_000, 3_000));
        assert_eq!(admin.restock(id, 2).await.unwrap(), 5);
        assert_eq!(admin.remaining_stock(id).await.unwrap(), Some(5));
        assert_eq!(admin.remaining_stock(id + 1).await.unwrap(), None);
        assert!(!admin.has_purchased(id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_validation() {
        let (_store, _repo, admin) = admin().await;
        assert!(matches!(admin.publish(&new_coupon(3_000, 2_000)).await, Err(CoreError::Invalid(_))));
        assert!(matches!(admin.publish(&new_coupon(500, 2_000)).await, Err(CoreError::Invalid(_))));

        let mut cheap = new_coupon(2_000, 3_000);
        cheap.pay_value = cheap.actual_value;
        assert!(matches!(admin.publish(&cheap).await, Err(CoreError::Invalid(_))));

        let mut empty = new_coupon(2_000, 3_000);
        empty.stock = 0;
        assert!(matches!(admin.publish(&empty).await, Err(CoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_restock_rules() {
        let (_store, _repo, admin) = admin().await;
        assert!(matches!(admin.restock(42, 0).await, Err(CoreError::Invalid(_))));
        assert!(matches!(admin.restock(42, 5).await, Err(CoreError::Invalid(_))));
    }
}
