use std::sync::Arc;

use super::AdmissionOutcome;
use crate::clock::Clock;
use crate::configure::SeckillConfig;
use crate::error::{CoreError, StoreError};
use crate::filter::ExistenceFilter;
use crate::id_gen::IdGenerator;
use crate::log_order_admitted;
use crate::metrics::{AdmissionKind, FlashSaleMetrics, LatencyTimer};
use crate::models::{EntityKind, FlashCoupon, WindowPhase};
use crate::persistence::Repository;
use crate::store::{AdmissionCode, AdmissionRequest, CouponKeys, CouponSeed, FastStore};

/// Admission control for flash-sale purchases.
///
/// The window check, stock check, buyer dedup, decrement, dedup insert and
/// order-log append run as one store-side operation; this type only adds the
/// coupon filter in front and seeds a coupon's fast-store state on first use.
/// It never retries the reservation itself.
pub struct AdmissionGate {
    store: Arc<dyn FastStore>,
    repo: Arc<dyn Repository>,
    filter: Arc<ExistenceFilter>,
    clock: Arc<dyn Clock>,
    ids: Arc<IdGenerator>,
    config: SeckillConfig,
    metrics: Arc<FlashSaleMetrics>,
}

impl AdmissionGate {
    pub fn new(
        store: Arc<dyn FastStore>,
        repo: Arc<dyn Repository>,
        filter: Arc<ExistenceFilter>,
        clock: Arc<dyn Clock>,
        ids: Arc<IdGenerator>,
        config: SeckillConfig,
        metrics: Arc<FlashSaleMetrics>,
    ) -> Self {
        Self { store, repo, filter, clock, ids, config, metrics }
    }

    pub async fn attempt_purchase(&self, buyer_id: u64, coupon_id: u64) -> Result<AdmissionOutcome, CoreError> {
        let timer = LatencyTimer::start();
        let result = self.admit(buyer_id, coupon_id).await;

        let kind = match &result {
            Ok(AdmissionOutcome::Admitted { .. }) => AdmissionKind::Admitted,
            Ok(AdmissionOutcome::SoldOut) => AdmissionKind::SoldOut,
            Ok(AdmissionOutcome::Duplicate) => AdmissionKind::Duplicate,
            Ok(AdmissionOutcome::NotYetOpen) => AdmissionKind::NotYetOpen,
            Ok(AdmissionOutcome::Closed) => AdmissionKind::Closed,
            Ok(AdmissionOutcome::NotFound) => AdmissionKind::NotFound,
            Err(_) => AdmissionKind::Error,
        };
        self.metrics.record_admission(kind, timer.elapsed_us());

        match &result {
            Ok(AdmissionOutcome::Admitted { token }) => {
                log_order_admitted!(coupon_id, buyer_id, token.as_str());
            }
            Ok(outcome) => log::debug!(
                "Purchase by buyer {} for coupon {} rejected: {}",
                buyer_id,
                coupon_id,
                outcome.as_str()
            ),
            Err(e) => log::error!("Purchase by buyer {} for coupon {} failed: {}", buyer_id, coupon_id, e),
        }
        result
    }

    async fn admit(&self, buyer_id: u64, coupon_id: u64) -> Result<AdmissionOutcome, CoreError> {
        if !self.filter.might_exist(EntityKind::Coupon, coupon_id).await? {
            return Ok(AdmissionOutcome::NotFound);
        }

        let keys = CouponKeys::new(coupon_id);
        let request = AdmissionRequest {
            buyer_id,
            coupon_id,
            token: self.ids.next_token(),
            now_ms: self.clock.now_ms(),
            retention_ms: self.config.dedup_retention().as_millis() as i64,
        };

        let code = self.store.admit(&keys, &self.config.order_stream, &request).await?;
        if code != AdmissionCode::Unseeded {
            return Ok(Self::outcome(code, request.token));
        }

        // First purchase attempt for this coupon in this store
        let Some(coupon) = self.seed(coupon_id, &keys).await? else {
            return Ok(AdmissionOutcome::NotFound);
        };
        match self.store.admit(&keys, &self.config.order_stream, &request).await? {
            // Seeded state already expired: the window ended long ago
            AdmissionCode::Unseeded => match coupon.window.phase(request.now_ms) {
                WindowPhase::Closed => Ok(AdmissionOutcome::Closed),
                WindowPhase::NotYetOpen => Ok(AdmissionOutcome::NotYetOpen),
                WindowPhase::Open => Err(CoreError::Store(StoreError::Protocol(format!(
                    "coupon {} state missing right after seeding",
                    coupon_id
                )))),
            },
            code => Ok(Self::outcome(code, request.token)),
        }
    }

    /// Load the coupon and write its window and remaining stock, unless
    /// another caller seeded it first.
    async fn seed(&self, coupon_id: u64, keys: &CouponKeys) -> Result<Option<FlashCoupon>, CoreError> {
        let Some(coupon) = self.repo.load_coupon(coupon_id).await? else {
            return Ok(None);
        };
        let persisted = self.repo.count_orders(coupon_id).await?;
        let seed = CouponSeed {
            window: coupon.window,
            stock: (coupon.stock - persisted as i64).max(0),
            expire_at_ms: coupon.window.end_ms + self.config.dedup_retention().as_millis() as i64,
            overwrite: false,
        };
        if self.store.seed_coupon(keys, &seed).await? {
            self.metrics.record_lazy_seed();
            log::info!(
                "Seeded coupon {} with stock {} ({} orders already persisted)",
                coupon_id,
                seed.stock,
                persisted
            );
        }
        Ok(Some(coupon))
    }

    fn outcome(code: AdmissionCode, token: String) -> AdmissionOutcome {
        match code {
            AdmissionCode::Admitted => AdmissionOutcome::Admitted { token },
            AdmissionCode::SoldOut => AdmissionOutcome::SoldOut,
            AdmissionCode::Duplicate => AdmissionOutcome::Duplicate,
            AdmissionCode::NotYetOpen => AdmissionOutcome::NotYetOpen,
            AdmissionCode::Closed => AdmissionOutcome::Closed,
            AdmissionCode::Unseeded => AdmissionOutcome::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::configure::FiltersConfig;
    use crate::models::{CouponWindow, OrderQueueEntry};
    use crate::persistence::InMemoryRepository;
    use crate::store::MemoryStore;

    struct Fixture {
        clock: Arc<MockClock>,
        store: Arc<MemoryStore>,
        repo: Arc<InMemoryRepository>,
        gate: AdmissionGate,
        metrics: Arc<FlashSaleMetrics>,
    }

    async fn fixture(stock: i64) -> Fixture {
        let clock = Arc::new(MockClock::at_ms(10_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let repo = Arc::new(InMemoryRepository::new(clock.clone()));
        repo.insert_coupon(FlashCoupon {
            id: 7,
            shop_id: 1,
            title: "half price".into(),
            pay_value: 5_000,
            actual_value: 2_500,
            window: CouponWindow::new(5_000, 20_000),
            stock,
        });
        let filter = Arc::new(ExistenceFilter::new(store.clone(), repo.clone(), clock.clone(), FiltersConfig::default()));
        filter.warm_up().await;

        let metrics = Arc::new(FlashSaleMetrics::new());
        let gate = AdmissionGate::new(
            store.clone(),
            repo.clone(),
            filter,
            clock.clone(),
            Arc::new(IdGenerator::default()),
            SeckillConfig::default(),
            metrics.clone(),
        );
        Fixture { clock, store, repo, gate, metrics }
    }

    #[tokio::test]
    async fn test_lazy_seed_then_admit() {
        let f = fixture(2).await;
        let outcome = f.gate.attempt_purchase(1, 7).await.unwrap();
        assert!(outcome.is_admitted());
        assert_eq!(f.store.stock(&CouponKeys::new(7)).await.unwrap(), Some(1));
        assert_eq!(f.metrics.snapshot().lazy_seeds, 1);
        assert_eq!(f.store.stream_len("stream:orders").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_coupon() {
        let f = fixture(2).await;
        assert_eq!(f.gate.attempt_purchase(1, 999).await.unwrap(), AdmissionOutcome::NotFound);
        assert_eq!(f.repo.calls.load_coupon.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_seed_accounts_for_persisted_orders() {
        let f = fixture(2).await;
        f.repo
            .create_order(&OrderQueueEntry { buyer_id: 50, coupon_id: 7, token: "old".into() })
            .await
            .unwrap();

        assert!(f.gate.attempt_purchase(1, 7).await.unwrap().is_admitted());
        assert_eq!(f.gate.attempt_purchase(2, 7).await.unwrap(), AdmissionOutcome::SoldOut);
    }

    #[tokio::test]
    async fn test_long_closed_coupon() {
        let f = fixture(2).await;
        // Past end + retention, seeded keys expire immediately
        f.clock.set_ms(20_000 + 86_400_000);
        assert_eq!(f.gate.attempt_purchase(1, 7).await.unwrap(), AdmissionOutcome::Closed);
    }

    #[tokio::test]
    async fn test_token_travels_with_queue_entry() {
        let f = fixture(2).await;
        let AdmissionOutcome::Admitted { token } = f.gate.attempt_purchase(3, 7).await.unwrap() else {
            panic!("expected admission");
        };
        f.store.ensure_group("stream:orders", "g").await.unwrap();
        let entries = f
            .store
            .read_group("stream:orders", "g", "c", crate::store::ReadFrom::New, 10, std::time::Duration::ZERO)
            .await
            .unwrap();
        let entry = OrderQueueEntry::from_fields(&entries[0].fields).unwrap();
        assert_eq!(entry.token, token);
        assert_eq!(entry.buyer_id, 3);
    }
}
