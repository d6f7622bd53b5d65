//! Domain records shared by the fast store, the system of record and the
//! request-facing services.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kinds guarded by an approximate-existence filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Shop,
    User,
    Coupon,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Shop, EntityKind::User, EntityKind::Coupon];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Shop => "shop",
            EntityKind::User => "user",
            EntityKind::Coupon => "coupon",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub id: u64,
    pub name: String,
    pub type_id: u64,
    pub images: String,
    pub area: String,
    pub address: String,
    pub x: f64,
    pub y: f64,
    pub avg_price: i64,
    pub sold: i64,
    pub comments: i64,
    pub score: i64,
    pub open_hours: String,
}

/// Where "now" falls relative to a coupon's validity window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    NotYetOpen,
    Open,
    Closed,
}

/// Half-open validity window `[begin_ms, end_ms)`, epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponWindow {
    pub begin_ms: i64,
    pub end_ms: i64,
}

impl CouponWindow {
    pub fn new(begin_ms: i64, end_ms: i64) -> Self {
        Self { begin_ms, end_ms }
    }

    pub fn phase(&self, now_ms: i64) -> WindowPhase {
        if now_ms < self.begin_ms {
            WindowPhase::NotYetOpen
        } else if now_ms >= self.end_ms {
            WindowPhase::Closed
        } else {
            WindowPhase::Open
        }
    }
}

/// Flash-sale coupon as stored in the system of record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashCoupon {
    pub id: u64,
    pub shop_id: u64,
    pub title: String,
    pub pay_value: i64,
    pub actual_value: i64,
    pub window: CouponWindow,
    pub stock: i64,
}

/// Request to publish a new flash-sale coupon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFlashCoupon {
    pub shop_id: u64,
    pub title: String,
    #[serde(default)]
    pub sub_title: String,
    #[serde(default)]
    pub rules: String,
    pub pay_value: i64,
    pub actual_value: i64,
    pub stock: i64,
    pub begin_ms: i64,
    pub end_ms: i64,
}

/// One admitted purchase waiting to be materialised as an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderQueueEntry {
    pub buyer_id: u64,
    pub coupon_id: u64,
    pub token: String,
}

impl OrderQueueEntry {
    pub const FIELD_BUYER: &'static str = "buyerId";
    pub const FIELD_COUPON: &'static str = "couponId";
    pub const FIELD_TOKEN: &'static str = "token";

    /// Parse the stream fields written by the admission script
    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, String> {
        let field = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| format!("missing field {}", name))
        };

        let buyer_id = field(Self::FIELD_BUYER)?
            .parse::<u64>()
            .map_err(|e| format!("invalid buyerId: {}", e))?;
        let coupon_id = field(Self::FIELD_COUPON)?
            .parse::<u64>()
            .map_err(|e| format!("invalid couponId: {}", e))?;
        let token = field(Self::FIELD_TOKEN)?.to_string();
        if token.is_empty() {
            return Err("empty token".to_string());
        }

        Ok(Self { buyer_id, coupon_id, token })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Unpaid,
    Paid,
    Used,
    Cancelled,
    Refunding,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Unpaid => "unpaid",
            OrderStatus::Paid => "paid",
            OrderStatus::Used => "used",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunding => "refunding",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(OrderStatus::Unpaid),
            "paid" => Some(OrderStatus::Paid),
            "used" => Some(OrderStatus::Used),
            "cancelled" => Some(OrderStatus::Cancelled),
            "refunding" => Some(OrderStatus::Refunding),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }
}

/// Order row owned by the system of record; unique per (buyer_id, coupon_id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedOrder {
    pub order_id: u64,
    pub buyer_id: u64,
    pub coupon_id: u64,
    pub token: String,
    pub status: OrderStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_phase_is_half_open() {
        let window = CouponWindow::new(1_000, 2_000);
        assert_eq!(window.phase(999), WindowPhase::NotYetOpen);
        assert_eq!(window.phase(1_000), WindowPhase::Open);
        assert_eq!(window.phase(1_999), WindowPhase::Open);
        assert_eq!(window.phase(2_000), WindowPhase::Closed);
    }

    #[test]
    fn test_queue_entry_from_fields() {
        let fields = vec![
            ("buyerId".to_string(), "4001".to_string()),
            ("couponId".to_string(), "7".to_string()),
            ("token".to_string(), "0ABC".to_string()),
        ];
        let entry = OrderQueueEntry::from_fields(&fields).unwrap();
        assert_eq!(entry.buyer_id, 4001);
        assert_eq!(entry.coupon_id, 7);
        assert_eq!(entry.token, "0ABC");
    }

    #[test]
    fn test_queue_entry_rejects_garbage() {
        let fields = vec![("buyerId".to_string(), "abc".to_string())];
        assert!(OrderQueueEntry::from_fields(&fields).is_err());
        assert!(OrderQueueEntry::from_fields(&[]).is_err());
    }

    #[test]
    fn test_shop_json_is_camel_case() {
        let shop = Shop { id: 1, type_id: 2, avg_price: 80, ..Default::default() };
        let json = serde_json::to_string(&shop).unwrap();
        assert!(json.contains("\"typeId\":2"));
        assert!(json.contains("\"avgPrice\":80"));
    }
}
