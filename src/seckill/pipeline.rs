//! Order-materialization pipeline
//!
//! A fixed pool of workers drains the order stream through one consumer
//! group. Delivery is at least once; the (buyer, coupon) uniqueness
//! constraint in the system of record turns redeliveries into no-ops.
//!
//! Per worker loop:
//! 1. entries delivered to this worker but never acknowledged (crash recovery)
//! 2. entries idle too long under another consumer (dead worker takeover)
//! 3. new entries, blocking for at most `block_ms`
//!
//! An entry is acknowledged once it is persisted, found already persisted
//! with the same admission token, or routed to the dead-letter stream.
//! Infrastructure failures leave it pending and back off.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::configure::{PipelineConfig, SeckillConfig};
use crate::error::{CoreError, RepoError};
use crate::metrics::FlashSaleMetrics;
use crate::models::OrderQueueEntry;
use crate::persistence::Repository;
use crate::store::{FastStore, ReadFrom, StreamEntry};
use crate::{log_order_dead_lettered, log_order_persisted};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub order_stream: String,
    pub consumer_group: String,
    pub dead_letter_stream: String,
    /// Worker `i` consumes as `{consumer_prefix}-{i}`
    pub consumer_prefix: String,
    pub workers: usize,
    pub batch_size: usize,
    /// Bound on the blocking read, and so on shutdown latency
    pub block_ms: u64,
    /// Entries pending this long under another consumer are taken over
    pub claim_idle_ms: u64,
    pub retry_backoff_ms: u64,
    /// Alert after this many consecutive failures
    pub alert_threshold: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_config(&SeckillConfig::default(), &PipelineConfig::default())
    }
}

impl WorkerConfig {
    pub fn from_config(seckill: &SeckillConfig, pipeline: &PipelineConfig) -> Self {
        Self {
            order_stream: seckill.order_stream.clone(),
            consumer_group: seckill.consumer_group.clone(),
            dead_letter_stream: seckill.dead_letter_stream.clone(),
            consumer_prefix: pipeline.consumer_prefix.clone(),
            workers: pipeline.workers,
            batch_size: pipeline.batch_size,
            block_ms: pipeline.block_ms,
            claim_idle_ms: pipeline.claim_idle_ms,
            retry_backoff_ms: pipeline.retry_backoff_ms,
            alert_threshold: pipeline.alert_threshold,
        }
    }

    pub fn consumer_name(&self, index: usize) -> String {
        format!("{}-{}", self.consumer_prefix, index)
    }
}

/// One consumer of the order stream
pub struct OrderWorker {
    name: String,
    store: Arc<dyn FastStore>,
    repo: Arc<dyn Repository>,
    config: WorkerConfig,
    metrics: Arc<FlashSaleMetrics>,
    running: Arc<AtomicBool>,
}

impl OrderWorker {
    pub fn new(
        name: String,
        store: Arc<dyn FastStore>,
        repo: Arc<dyn Repository>,
        config: WorkerConfig,
        metrics: Arc<FlashSaleMetrics>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self { name, store, repo, config, metrics, running }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the worker loop until the running flag is cleared
    pub async fn run(self) {
        log::info!(
            "Order worker {} started (batch={}, block={}ms, claim_idle={}ms)",
            self.name,
            self.config.batch_size,
            self.config.block_ms,
            self.config.claim_idle_ms
        );

        let mut consecutive_failures: u32 = 0;
        while self.running.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.alert_threshold {
                        log::error!(
                            "ALERT: order worker {} failing for {} consecutive cycles: {}",
                            self.name,
                            consecutive_failures,
                            e
                        );
                    } else {
                        log::warn!("Order worker {} cycle failed, backing off: {}", self.name, e);
                    }
                    sleep(Duration::from_millis(self.config.retry_backoff_ms)).await;
                }
            }
        }

        log::info!("Order worker {} stopped", self.name);
    }

    /// One read cycle. Returns how many entries were settled; an error means
    /// at least one entry stays pending for a later attempt.
    pub async fn run_once(&self) -> Result<usize, CoreError> {
        let entries = self.next_batch().await?;
        let mut settled = 0;
        for entry in &entries {
            self.process(entry).await?;
            settled += 1;
        }
        Ok(settled)
    }

    async fn next_batch(&self) -> Result<Vec<StreamEntry>, CoreError> {
        let cfg = &self.config;

        let own = self
            .store
            .read_group(&cfg.order_stream, &cfg.consumer_group, &self.name, ReadFrom::OwnPending, cfg.batch_size, Duration::ZERO)
            .await?;
        if !own.is_empty() {
            log::info!("Worker {} recovering {} unacknowledged entries", self.name, own.len());
            return Ok(own);
        }

        let claimed = self
            .store
            .claim_idle(
                &cfg.order_stream,
                &cfg.consumer_group,
                &self.name,
                Duration::from_millis(cfg.claim_idle_ms),
                cfg.batch_size,
            )
            .await?;
        if !claimed.is_empty() {
            log::warn!("Worker {} took over {} idle entries", self.name, claimed.len());
            return Ok(claimed);
        }

        Ok(self
            .store
            .read_group(
                &cfg.order_stream,
                &cfg.consumer_group,
                &self.name,
                ReadFrom::New,
                cfg.batch_size,
                Duration::from_millis(cfg.block_ms),
            )
            .await?)
    }

    /// Settle one entry: persist, recognise a redelivery, or dead-letter it
    async fn process(&self, entry: &StreamEntry) -> Result<(), CoreError> {
        let order = match OrderQueueEntry::from_fields(&entry.fields) {
            Ok(order) => order,
            Err(reason) => {
                self.dead_letter(entry, &format!("unparseable entry: {}", reason)).await?;
                return self.ack(entry).await;
            }
        };

        match self.repo.create_order(&order).await {
            Ok(order_id) => {
                self.metrics.record_persisted();
                log_order_persisted!(entry.id.as_str(), order_id, order.coupon_id, order.buyer_id, self.name.as_str());
            }
            Err(RepoError::DuplicateOrder { existing }) if existing.token == order.token => {
                // Persisted by an earlier delivery that never got acknowledged
                self.metrics.record_redelivered();
                log::info!(
                    "Entry {} already persisted as order {}, acknowledging",
                    entry.id,
                    existing.order_id
                );
            }
            Err(RepoError::DuplicateOrder { existing }) => {
                let reason = format!(
                    "order {} for buyer {} coupon {} exists with a different admission token",
                    existing.order_id, existing.buyer_id, existing.coupon_id
                );
                self.dead_letter(entry, &reason).await?;
            }
            Err(RepoError::Corrupt(msg)) | Err(RepoError::Invalid(msg)) => {
                self.dead_letter(entry, &msg).await?;
            }
            Err(e) => {
                self.metrics.record_persist_failure();
                return Err(e.into());
            }
        }

        self.ack(entry).await
    }

    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) -> Result<(), CoreError> {
        let mut fields = entry.fields.clone();
        fields.push(("sourceId".to_string(), entry.id.clone()));
        fields.push(("reason".to_string(), reason.to_string()));
        fields.push(("worker".to_string(), self.name.clone()));
        self.store.append(&self.config.dead_letter_stream, &fields).await?;

        self.metrics.record_dead_lettered();
        log_order_dead_lettered!(entry.id.as_str(), reason, self.name.as_str());
        Ok(())
    }

    async fn ack(&self, entry: &StreamEntry) -> Result<(), CoreError> {
        let acked = self
            .store
            .ack(&self.config.order_stream, &self.config.consumer_group, &entry.id)
            .await?;
        if !acked {
            log::debug!("Entry {} was not pending for {} at ack time", entry.id, self.name);
        }
        Ok(())
    }
}

/// Worker pool with cooperative shutdown
pub struct OrderPipeline {
    store: Arc<dyn FastStore>,
    repo: Arc<dyn Repository>,
    config: WorkerConfig,
    metrics: Arc<FlashSaleMetrics>,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderPipeline {
    pub fn new(
        store: Arc<dyn FastStore>,
        repo: Arc<dyn Repository>,
        config: WorkerConfig,
        metrics: Arc<FlashSaleMetrics>,
    ) -> Self {
        Self {
            store,
            repo,
            config,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Worker bound to this pipeline's stream, group and running flag
    pub fn worker(&self, index: usize) -> OrderWorker {
        OrderWorker::new(
            self.config.consumer_name(index),
            self.store.clone(),
            self.repo.clone(),
            self.config.clone(),
            self.metrics.clone(),
            self.running.clone(),
        )
    }

    /// Create the consumer group if needed and spawn the workers
    pub async fn start(&self) -> Result<(), CoreError> {
        self.store
            .ensure_group(&self.config.order_stream, &self.config.consumer_group)
            .await?;

        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("Order pipeline already running");
            return Ok(());
        }

        let mut handles = self.handles.lock();
        for index in 0..self.config.workers {
            let worker = self.worker(index);
            handles.push(tokio::spawn(async move { worker.run().await }));
        }
        log::info!(
            "Order pipeline started: {} workers on {} / {}",
            self.config.workers,
            self.config.order_stream,
            self.config.consumer_group
        );
        Ok(())
    }

    /// Stop taking new entries, let in-flight ones finish, join every worker
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Order worker task failed: {}", e);
            }
        }
        log::info!("Order pipeline stopped");
    }
}

/// Observability surface of the order stream
#[derive(Clone)]
pub struct QueueAdmin {
    store: Arc<dyn FastStore>,
    config: WorkerConfig,
}

impl QueueAdmin {
    pub fn new(store: Arc<dyn FastStore>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    /// Backlog of the order stream: undelivered plus unacknowledged entries.
    /// Acknowledged entries are deleted, so this drains back to zero.
    pub async fn queue_depth(&self) -> Result<u64, CoreError> {
        Ok(self.store.stream_len(&self.config.order_stream).await?)
    }

    /// Unacknowledged entries per consumer
    pub async fn pending_by_worker(&self) -> Result<Vec<(String, u64)>, CoreError> {
        let summary = self
            .store
            .pending_summary(&self.config.order_stream, &self.config.consumer_group)
            .await?;
        Ok(summary.by_consumer)
    }

    /// Entries not yet delivered to any worker; None when the store cannot tell
    pub async fn consumer_group_lag(&self) -> Result<Option<u64>, CoreError> {
        Ok(self
            .store
            .group_lag(&self.config.order_stream, &self.config.consumer_group)
            .await?)
    }

    pub async fn dead_letter_depth(&self) -> Result<u64, CoreError> {
        Ok(self.store.stream_len(&self.config.dead_letter_stream).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::persistence::InMemoryRepository;
    use crate::store::MemoryStore;

    fn fields(buyer: &str, coupon: &str, token: &str) -> Vec<(String, String)> {
        vec![
            ("buyerId".to_string(), buyer.to_string()),
            ("couponId".to_string(), coupon.to_string()),
            ("token".to_string(), token.to_string()),
        ]
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<InMemoryRepository>, OrderPipeline) {
        let clock = Arc::new(MockClock::at_ms(1_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let repo = Arc::new(InMemoryRepository::new(clock));
        let config = WorkerConfig { block_ms: 10, retry_backoff_ms: 10, ..WorkerConfig::default() };
        let pipeline = OrderPipeline::new(store.clone(), repo.clone(), config, Arc::new(FlashSaleMetrics::new()));
        store.ensure_group("stream:orders", "order-workers").await.unwrap();
        (store, repo, pipeline)
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.claim_idle_ms, 30_000);
        assert_eq!(config.alert_threshold, 10);
        assert_eq!(config.consumer_name(2), "worker-2");
    }

    #[tokio::test]
    async fn test_persist_and_ack() {
        let (store, repo, pipeline) = setup().await;
        store.append("stream:orders", &fields("1", "7", "tok")).await.unwrap();

        let worker = pipeline.worker(0);
        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(repo.orders().len(), 1);
        assert_eq!(store.pending_summary("stream:orders", "order-workers").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_garbage_goes_to_dead_letter() {
        let (store, repo, pipeline) = setup().await;
        store.append("stream:orders", &fields("abc", "7", "tok")).await.unwrap();

        pipeline.worker(0).run_once().await.unwrap();
        assert!(repo.orders().is_empty());
        assert_eq!(store.stream_len("stream:orders:dlq").await.unwrap(), 1);
        assert_eq!(store.pending_summary("stream:orders", "order-workers").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_outage_leaves_entry_pending() {
        let (store, repo, pipeline) = setup().await;
        store.append("stream:orders", &fields("1", "7", "tok")).await.unwrap();
        repo.set_unavailable(true);

        let worker = pipeline.worker(0);
        assert!(worker.run_once().await.is_err());
        let pending = store.pending_summary("stream:orders", "order-workers").await.unwrap();
        assert_eq!(pending.by_consumer, vec![("worker-0".to_string(), 1)]);
        // Unacknowledged entries stay in the backlog
        assert_eq!(store.stream_len("stream:orders").await.unwrap(), 1);

        repo.set_unavailable(false);
        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(repo.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_admin() {
        let (store, _repo, pipeline) = setup().await;
        store.append("stream:orders", &fields("1", "7", "a")).await.unwrap();
        store.append("stream:orders", &fields("2", "7", "b")).await.unwrap();

        let admin = QueueAdmin::new(store.clone(), pipeline.config().clone());
        assert_eq!(admin.queue_depth().await.unwrap(), 2);
        assert_eq!(admin.consumer_group_lag().await.unwrap(), Some(2));
        assert!(admin.pending_by_worker().await.unwrap().is_empty());
        assert_eq!(admin.dead_letter_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_depth_drains_to_zero() {
        let (store, repo, pipeline) = setup().await;
        for buyer in 1..=5 {
            let token = format!("t{}", buyer);
            store.append("stream:orders", &fields(&buyer.to_string(), "7", &token)).await.unwrap();
        }
        let admin = QueueAdmin::new(store.clone(), pipeline.config().clone());
        assert_eq!(admin.queue_depth().await.unwrap(), 5);

        assert_eq!(pipeline.worker(0).run_once().await.unwrap(), 5);
        assert_eq!(repo.orders().len(), 5);
        assert_eq!(admin.queue_depth().await.unwrap(), 0);
        assert_eq!(admin.consumer_group_lag().await.unwrap(), Some(0));
        assert!(admin.pending_by_worker().await.unwrap().is_empty());
    }
}
