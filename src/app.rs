//! Wiring of the flash-sale components behind the operations the HTTP layer calls

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cache::shop::ShopService;
use crate::cache::{Lookup, ReadThroughCache};
use crate::clock::Clock;
use crate::configure::AppConfig;
use crate::error::CoreError;
use crate::filter::{ExistenceFilter, FilterRebuilder, KindHealth};
use crate::id_gen::IdGenerator;
use crate::metrics::{FlashSaleMetrics, MetricsSnapshot};
use crate::models::{EntityKind, NewFlashCoupon, Shop};
use crate::persistence::Repository;
use crate::seckill::{AdmissionGate, AdmissionOutcome, CouponAdmin, OrderPipeline, QueueAdmin, WorkerConfig};
use crate::store::FastStore;

pub struct FlashSaleApp {
    pub filter: Arc<ExistenceFilter>,
    pub gate: AdmissionGate,
    pub coupons: CouponAdmin,
    pub shops: ShopService,
    pub pipeline: OrderPipeline,
    pub queue: QueueAdmin,
    pub metrics: Arc<FlashSaleMetrics>,
    config: AppConfig,
    running: Arc<AtomicBool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl FlashSaleApp {
    pub fn new(store: Arc<dyn FastStore>, repo: Arc<dyn Repository>, clock: Arc<dyn Clock>, config: AppConfig) -> Self {
        let metrics = Arc::new(FlashSaleMetrics::new());
        let ids = Arc::new(IdGenerator::with_clock(config.machine_id, clock.clone()));

        let filter = Arc::new(ExistenceFilter::new(store.clone(), repo.clone(), clock.clone(), config.filters.clone()));
        let cache = Arc::new(ReadThroughCache::new(
            store.clone(),
            filter.clone(),
            config.cache.clone(),
            metrics.clone(),
        ));
        let gate = AdmissionGate::new(
            store.clone(),
            repo.clone(),
            filter.clone(),
            clock.clone(),
            ids,
            config.seckill.clone(),
            metrics.clone(),
        );
        let coupons = CouponAdmin::new(store.clone(), repo.clone(), filter.clone(), clock, config.seckill.clone());
        let shops = ShopService::new(cache, filter.clone(), repo.clone());

        let worker_config = WorkerConfig::from_config(&config.seckill, &config.pipeline);
        let pipeline = OrderPipeline::new(store.clone(), repo, worker_config.clone(), metrics.clone());
        let queue = QueueAdmin::new(store, worker_config);

        Self {
            filter,
            gate,
            coupons,
            shops,
            pipeline,
            queue,
            metrics,
            config,
            running: Arc::new(AtomicBool::new(false)),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Warm up the filters, start the order workers and the filter rebuilder.
    /// A kind whose warm-up fails stays open (every id passes) until a rebuild succeeds.
    pub async fn start(&self) -> Result<(), CoreError> {
        for (kind, result) in self.filter.warm_up().await {
            match result {
                Ok(loaded) => log::info!("{} filter warmed with {} ids", kind, loaded),
                Err(e) => log::error!("{} filter warm-up failed, failing open: {}", kind, e),
            }
        }

        self.pipeline.start().await?;

        self.running.store(true, Ordering::SeqCst);
        if let Some(interval) = self.config.filters.rebuild_interval() {
            let rebuilder = FilterRebuilder::new(self.filter.clone(), interval, self.running.clone());
            self.background.lock().push(rebuilder.spawn());
        }
        Ok(())
    }

    /// Stop background tasks and wait for every worker to finish its current batch
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.pipeline.shutdown().await;

        let handles = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Background task failed: {}", e);
            }
        }
    }

    pub async fn attempt_purchase(&self, buyer_id: u64, coupon_id: u64) -> Result<AdmissionOutcome, CoreError> {
        self.gate.attempt_purchase(buyer_id, coupon_id).await
    }

    pub async fn get_shop(&self, shop_id: u64) -> Result<Lookup<Shop>, CoreError> {
        self.shops.get_shop(shop_id).await
    }

    pub async fn update_shop(&self, shop: &Shop) -> Result<(), CoreError> {
        self.shops.update_shop(shop).await
    }

    pub async fn create_shop(&self, shop: &Shop) -> Result<u64, CoreError> {
        self.shops.create_shop(shop).await
    }

    pub async fn publish_coupon(&self, coupon: &NewFlashCoupon) -> Result<u64, CoreError> {
        self.coupons.publish(coupon).await
    }

    pub async fn restock(&self, coupon_id: u64, amount: i64) -> Result<i64, CoreError> {
        self.coupons.restock(coupon_id, amount).await
    }

    pub async fn remaining_stock(&self, coupon_id: u64) -> Result<Option<i64>, CoreError> {
        self.coupons.remaining_stock(coupon_id).await
    }

    pub async fn has_purchased(&self, coupon_id: u64, buyer_id: u64) -> Result<bool, CoreError> {
        self.coupons.has_purchased(coupon_id, buyer_id).await
    }

    pub async fn queue_depth(&self) -> Result<u64, CoreError> {
        self.queue.queue_depth().await
    }

    pub async fn pending_by_worker(&self) -> Result<Vec<(String, u64)>, CoreError> {
        self.queue.pending_by_worker().await
    }

    pub async fn consumer_group_lag(&self) -> Result<Option<u64>, CoreError> {
        self.queue.consumer_group_lag().await
    }

    pub fn filter_health(&self) -> Vec<(EntityKind, KindHealth)> {
        self.filter.health()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
