//! Structured business events
//!
//! Admissions, persisted and dead-lettered orders, filter rebuilds and coupon
//! publications are logged as one JSON object per line so they can be
//! grepped and shipped as-is. Diagnostics stay plain `log::` text.

use log::Level;
use serde_json::{json, Map, Value};

pub const SERVICE: &str = "flashsale";

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One structured event
///
/// ```
/// use flashsale::logging::LogEvent;
///
/// let event = LogEvent::new("ORDER_ADMITTED")
///     .field("coupon_id", 7)
///     .field("buyer_id", 4001)
///     .build();
///
/// assert_eq!(event["service"], "flashsale");
/// ```
pub struct LogEvent {
    fields: Map<String, Value>,
}

impl LogEvent {
    pub fn new(event: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("event".to_string(), json!(event));
        fields.insert("timestamp_ms".to_string(), json!(now_ms()));
        fields.insert("service".to_string(), json!(SERVICE));
        Self { fields }
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn emit(self, level: Level) {
        log::log!(level, "{}", self.build());
    }
}

#[macro_export]
macro_rules! log_order_admitted {
    ($coupon_id:expr, $buyer_id:expr, $token:expr) => {
        $crate::logging::LogEvent::new("ORDER_ADMITTED")
            .field("coupon_id", $coupon_id)
            .field("buyer_id", $buyer_id)
            .field("token", $token)
            .emit(log::Level::Info)
    };
}

#[macro_export]
macro_rules! log_order_persisted {
    ($entry_id:expr, $order_id:expr, $coupon_id:expr, $buyer_id:expr, $worker:expr) => {
        $crate::logging::LogEvent::new("ORDER_PERSISTED")
            .field("entry_id", $entry_id)
            .field("order_id", $order_id)
            .field("coupon_id", $coupon_id)
            .field("buyer_id", $buyer_id)
            .field("worker", $worker)
            .emit(log::Level::Info)
    };
}

/// Irrecoverable entries need a human; logged at error level
#[macro_export]
macro_rules! log_order_dead_lettered {
    ($entry_id:expr, $reason:expr, $worker:expr) => {
        $crate::logging::LogEvent::new("ORDER_DEAD_LETTERED")
            .field("entry_id", $entry_id)
            .field("reason", $reason)
            .field("worker", $worker)
            .emit(log::Level::Error)
    };
}

pub fn log_filter_rebuilt(kind: &str, loaded: usize, elapsed_ms: u64) {
    LogEvent::new("FILTER_REBUILT")
        .field("kind", kind)
        .field("loaded", loaded)
        .field("elapsed_ms", elapsed_ms)
        .emit(Level::Info);
}

pub fn log_coupon_published(coupon_id: u64, shop_id: u64, stock: i64, begin_ms: i64, end_ms: i64) {
    LogEvent::new("COUPON_PUBLISHED")
        .field("coupon_id", coupon_id)
        .field("shop_id", shop_id)
        .field("stock", stock)
        .field("begin_ms", begin_ms)
        .field("end_ms", end_ms)
        .emit(Level::Info);
}
