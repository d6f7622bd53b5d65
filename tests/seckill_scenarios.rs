/// Flash-sale admission scenarios
///
/// Concurrency properties of the admission gate: no oversell, no double
/// admission, and window enforcement without stock mutation.

use flashsale::app::FlashSaleApp;
use flashsale::clock::MockClock;
use flashsale::configure::AppConfig;
use flashsale::models::{CouponWindow, FlashCoupon};
use flashsale::persistence::InMemoryRepository;
use flashsale::seckill::AdmissionOutcome;
use flashsale::store::MemoryStore;
use std::sync::Arc;

const COUPON_ID: u64 = 7;
const NOW_MS: i64 = 1_700_000_000_000;

struct Harness {
    clock: Arc<MockClock>,
    app: Arc<FlashSaleApp>,
}

async fn harness(stock: i64, window: CouponWindow) -> Harness {
    let clock = Arc::new(MockClock::at_ms(NOW_MS));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let repo = Arc::new(InMemoryRepository::new(clock.clone()));
    repo.insert_coupon(FlashCoupon {
        id: COUPON_ID,
        shop_id: 1,
        title: "flash".into(),
        pay_value: 10_000,
        actual_value: 1_000,
        window,
        stock,
    });

    let app = FlashSaleApp::new(store, repo, clock.clone(), AppConfig::default());
    app.filter.warm_up().await;
    Harness { clock, app: Arc::new(app) }
}

fn open_window() -> CouponWindow {
    CouponWindow::new(NOW_MS - 60_000, NOW_MS + 3_600_000)
}

async fn purchase_concurrently(app: &Arc<FlashSaleApp>, buyers: Vec<u64>) -> Vec<AdmissionOutcome> {
    let handles: Vec<_> = buyers
        .into_iter()
        .map(|buyer| {
            let app = app.clone();
            tokio::spawn(async move { app.attempt_purchase(buyer, COUPON_ID).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }
    outcomes
}

fn count(outcomes: &[AdmissionOutcome], pred: impl Fn(&AdmissionOutcome) -> bool) -> usize {
    outcomes.iter().filter(|&o| pred(o)).count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_no_oversell_under_contention() {
    let h = harness(10, open_window()).await;

    let outcomes = purchase_concurrently(&h.app, (1..=200).collect()).await;

    assert_eq!(count(&outcomes, AdmissionOutcome::is_admitted), 10);
    assert_eq!(count(&outcomes, |o| *o == AdmissionOutcome::SoldOut), 190);
    assert_eq!(h.app.remaining_stock(COUPON_ID).await.unwrap(), Some(0));
    assert_eq!(h.app.queue_depth().await.unwrap(), 10);
    assert_eq!(h.app.metrics().lazy_seeds, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_no_double_admission_for_one_buyer() {
    let h = harness(100, open_window()).await;

    let outcomes = purchase_concurrently(&h.app, vec![4001; 50]).await;

    assert_eq!(count(&outcomes, AdmissionOutcome::is_admitted), 1);
    assert_eq!(count(&outcomes, |o| *o == AdmissionOutcome::Duplicate), 49);
    assert_eq!(h.app.remaining_stock(COUPON_ID).await.unwrap(), Some(99));
    assert!(h.app.has_purchased(COUPON_ID, 4001).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_a_last_unit() {
    let h = harness(1, open_window()).await;

    let outcomes = purchase_concurrently(&h.app, vec![1, 2]).await;

    assert_eq!(count(&outcomes, AdmissionOutcome::is_admitted), 1);
    assert_eq!(count(&outcomes, |o| *o == AdmissionOutcome::SoldOut), 1);
}

#[tokio::test]
async fn test_scenario_b_same_buyer_twice() {
    let h = harness(5, open_window()).await;

    assert!(h.app.attempt_purchase(9, COUPON_ID).await.unwrap().is_admitted());
    assert_eq!(h.app.attempt_purchase(9, COUPON_ID).await.unwrap(), AdmissionOutcome::Duplicate);
    assert_eq!(h.app.remaining_stock(COUPON_ID).await.unwrap(), Some(4));
    assert_eq!(h.app.queue_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn test_scenario_c_outside_window() {
    let begin = NOW_MS + 60_000;
    let end = NOW_MS + 120_000;
    let h = harness(3, CouponWindow::new(begin, end)).await;

    assert_eq!(h.app.attempt_purchase(1, COUPON_ID).await.unwrap(), AdmissionOutcome::NotYetOpen);
    assert_eq!(h.app.remaining_stock(COUPON_ID).await.unwrap(), Some(3));

    // end is exclusive
    h.clock.set_ms(end);
    assert_eq!(h.app.attempt_purchase(1, COUPON_ID).await.unwrap(), AdmissionOutcome::Closed);
    assert_eq!(h.app.remaining_stock(COUPON_ID).await.unwrap(), Some(3));
    assert!(!h.app.has_purchased(COUPON_ID, 1).await.unwrap());
    assert_eq!(h.app.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_coupon_and_restock() {
    let h = harness(1, open_window()).await;

    assert_eq!(h.app.attempt_purchase(1, 999).await.unwrap(), AdmissionOutcome::NotFound);

    assert!(h.app.attempt_purchase(1, COUPON_ID).await.unwrap().is_admitted());
    assert_eq!(h.app.attempt_purchase(2, COUPON_ID).await.unwrap(), AdmissionOutcome::SoldOut);

    assert_eq!(h.app.restock(COUPON_ID, 1).await.unwrap(), 1);
    assert!(h.app.attempt_purchase(2, COUPON_ID).await.unwrap().is_admitted());

    let metrics = h.app.metrics();
    assert_eq!(metrics.admitted, 2);
    assert_eq!(metrics.sold_out, 1);
    assert_eq!(metrics.not_found, 1);
}
