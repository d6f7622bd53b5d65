/// Redis-backed scenarios
///
/// The same properties the in-memory store is tested for, exercised through
/// the Lua scripts, RedisBloom commands and stream commands of `RedisStore`.
/// Needs a disposable Redis Stack (RedisBloom loaded, Redis 7+):
///
///   REDIS_URL=redis://127.0.0.1:6379/ cargo test --test redis_integration -- --ignored
///
/// The shop filter key is shared with anything else on that server.

use flashsale::app::FlashSaleApp;
use flashsale::cache::Lookup;
use flashsale::clock::{Clock, SystemClock};
use flashsale::configure::{AppConfig, FiltersConfig};
use flashsale::filter::ExistenceFilter;
use flashsale::models::{CouponWindow, EntityKind, FlashCoupon, Shop};
use flashsale::persistence::InMemoryRepository;
use flashsale::seckill::AdmissionOutcome;
use flashsale::store::{CouponKeys, CouponSeed, FastStore, ReadFrom, RedisStore};
use std::sync::Arc;
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
}

async fn connect() -> Arc<RedisStore> {
    let store = RedisStore::connect(&redis_url(), 1).await.expect("Redis reachable");
    store.ping().await.unwrap();
    Arc::new(store)
}

/// Ids far from anything a running service would use, fresh per test run
fn fresh_id() -> u64 {
    (1 << 40) + rand::random::<u32>() as u64
}

struct Sale {
    coupon_id: u64,
    app: Arc<FlashSaleApp>,
}

async fn sale(stock: i64, begin_offset_ms: i64) -> Sale {
    let now_ms = SystemClock.now_ms();
    let coupon_id = fresh_id();
    let repo = Arc::new(InMemoryRepository::new(Arc::new(SystemClock)));
    repo.insert_coupon(FlashCoupon {
        id: coupon_id,
        shop_id: 1,
        title: "flash".into(),
        pay_value: 10_000,
        actual_value: 1_000,
        window: CouponWindow::new(now_ms + begin_offset_ms, now_ms + 3_600_000),
        stock,
    });

    let mut config = AppConfig::default();
    config.seckill.order_stream = format!("stream:orders:it:{}", coupon_id);
    config.seckill.dead_letter_stream = format!("stream:orders:it:{}:dlq", coupon_id);
    config.seckill.dedup_retention_secs = 60;

    // Filters stay cold, so every coupon id passes
    let app = FlashSaleApp::new(connect().await, repo, Arc::new(SystemClock), config);
    Sale { coupon_id, app: Arc::new(app) }
}

async fn purchase_concurrently(sale: &Sale, buyers: Vec<u64>) -> Vec<AdmissionOutcome> {
    let handles: Vec<_> = buyers
        .into_iter()
        .map(|buyer| {
            let app = sale.app.clone();
            let coupon_id = sale.coupon_id;
            tokio::spawn(async move { app.attempt_purchase(buyer, coupon_id).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }
    outcomes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn test_admission_script_never_oversells() {
    let sale = sale(10, -60_000).await;

    let outcomes = purchase_concurrently(&sale, (1..=200).collect()).await;

    assert_eq!(outcomes.iter().filter(|o| o.is_admitted()).count(), 10);
    assert_eq!(outcomes.iter().filter(|o| **o == AdmissionOutcome::SoldOut).count(), 190);
    assert_eq!(sale.app.remaining_stock(sale.coupon_id).await.unwrap(), Some(0));
    assert_eq!(sale.app.queue_depth().await.unwrap(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn test_admission_script_admits_a_buyer_once() {
    let sale = sale(100, -60_000).await;

    let outcomes = purchase_concurrently(&sale, vec![4001; 50]).await;

    assert_eq!(outcomes.iter().filter(|o| o.is_admitted()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == AdmissionOutcome::Duplicate).count(), 49);
    assert_eq!(sale.app.remaining_stock(sale.coupon_id).await.unwrap(), Some(99));
    assert!(sale.app.has_purchased(sale.coupon_id, 4001).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_admission_script_respects_window() {
    let sale = sale(3, 60_000).await;

    assert_eq!(sale.app.attempt_purchase(1, sale.coupon_id).await.unwrap(), AdmissionOutcome::NotYetOpen);
    assert_eq!(sale.app.remaining_stock(sale.coupon_id).await.unwrap(), Some(3));
    assert!(!sale.app.has_purchased(sale.coupon_id, 1).await.unwrap());
    assert_eq!(sale.app.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_seed_and_restock_scripts() {
    let store = connect().await;
    let keys = CouponKeys::new(fresh_id());
    let now_ms = SystemClock.now_ms();
    let seed = CouponSeed {
        window: CouponWindow::new(now_ms, now_ms + 60_000),
        stock: 2,
        expire_at_ms: now_ms + 120_000,
        overwrite: false,
    };

    assert_eq!(store.restock(&keys, 1).await.unwrap(), None);
    assert!(store.seed_coupon(&keys, &seed).await.unwrap());
    assert!(!store.seed_coupon(&keys, &CouponSeed { stock: 99, ..seed }).await.unwrap());
    assert_eq!(store.stock(&keys).await.unwrap(), Some(2));
    assert_eq!(store.restock(&keys, 3).await.unwrap(), Some(5));

    assert!(store.seed_coupon(&keys, &CouponSeed { stock: 7, overwrite: true, ..seed }).await.unwrap());
    assert_eq!(store.stock(&keys).await.unwrap(), Some(7));
}

#[tokio::test]
#[ignore]
async fn test_lock_scripts() {
    let store = connect().await;
    let key = format!("lock:it:{}", fresh_id());
    let ttl = Duration::from_secs(5);

    assert!(store.set_nx_px(&key, "owner", ttl).await.unwrap());
    assert!(!store.set_nx_px(&key, "other", ttl).await.unwrap());
    assert!(!store.compare_and_delete(&key, "other").await.unwrap());
    assert!(!store.compare_and_expire(&key, "other", ttl).await.unwrap());
    assert!(store.compare_and_expire(&key, "owner", Duration::from_secs(10)).await.unwrap());
    assert!(store.compare_and_delete(&key, "owner").await.unwrap());
    assert!(store.set_nx_px(&key, "other", Duration::from_millis(50)).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_acknowledged_entries_leave_the_stream() {
    let store = connect().await;
    let stream = format!("stream:orders:it:{}", fresh_id());
    store.ensure_group(&stream, "order-workers").await.unwrap();
    store.ensure_group(&stream, "order-workers").await.unwrap();

    let fields = vec![("buyerId".to_string(), "1".to_string())];
    store.append(&stream, &fields).await.unwrap();
    store.append(&stream, &fields).await.unwrap();

    let got = store
        .read_group(&stream, "order-workers", "w1", ReadFrom::New, 10, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(got.len(), 2);
    assert!(store.ack(&stream, "order-workers", &got[0].id).await.unwrap());
    assert!(!store.ack(&stream, "order-workers", &got[0].id).await.unwrap());

    assert_eq!(store.stream_len(&stream).await.unwrap(), 1);
    assert_eq!(store.pending_summary(&stream, "order-workers").await.unwrap().total, 1);
    assert_eq!(store.group_lag(&stream, "order-workers").await.unwrap(), Some(0));
    store.del(&stream).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn test_filter_add_survives_rebuild_by_another_instance() {
    let repo = Arc::new(InMemoryRepository::new(Arc::new(SystemClock)));
    let existing = fresh_id();
    repo.insert_shop(Shop { id: existing, ..Default::default() });

    let a = ExistenceFilter::new(connect().await, repo.clone(), Arc::new(SystemClock), FiltersConfig::default());
    let b = Arc::new(ExistenceFilter::new(connect().await, repo.clone(), Arc::new(SystemClock), FiltersConfig::default()));
    a.rebuild(EntityKind::Shop).await.unwrap();

    repo.set_scan_stall(Duration::from_millis(200));
    let rebuild = {
        let b = b.clone();
        tokio::spawn(async move { b.rebuild(EntityKind::Shop).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let added = fresh_id();
    repo.insert_shop(Shop { id: added, ..Default::default() });
    a.add(EntityKind::Shop, added).await.unwrap();

    rebuild.await.unwrap().unwrap();
    assert!(a.might_exist(EntityKind::Shop, added).await.unwrap());
    assert!(a.might_exist(EntityKind::Shop, existing).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn test_concurrent_misses_reload_once() {
    let shop_id = fresh_id();
    let repo = Arc::new(InMemoryRepository::new(Arc::new(SystemClock)));
    repo.insert_shop(Shop { id: shop_id, name: "noodle bar".into(), ..Default::default() });
    // Cold filter: the lookups go straight to the cache and lock
    let app = Arc::new(FlashSaleApp::new(connect().await, repo.clone(), Arc::new(SystemClock), AppConfig::default()));
    repo.set_latency(Duration::from_millis(300));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { app.get_shop(shop_id).await })
        })
        .collect();
    for handle in handles {
        assert_ne!(handle.await.unwrap().unwrap(), Lookup::NotFound);
    }
    assert_eq!(repo.load_shop_calls(), 1);

    let again = app.get_shop(shop_id).await.unwrap();
    assert_eq!(again.found().map(|s| s.name), Some("noodle bar".to_string()));
    assert_eq!(repo.load_shop_calls(), 1);
}
