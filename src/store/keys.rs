//! Fast-store key layout
//!
//! Keys are namespaced by purpose first, entity kind second:
//!   cache:{kind}:{id}            serialized entity snapshot (TTL)
//!   lock:{kind}:{id}             lock ownership token (TTL)
//!   bloom:{kind}                 approximate-existence filter
//!   bloom:{kind}:staging:{token} filter being rebuilt (TTL)
//!   bloom:{kind}:rebuilds        set of staging keys receiving live adds
//!   seckill:stock:{{id}}         remaining units
//!   seckill:window:{{id}}        hash { begin, end } in epoch ms
//!   seckill:buyers:{{id}}        set of admitted buyer ids
//!
//! The three coupon keys share a hash tag so they live in one slot.

use crate::models::EntityKind;

pub fn cache_key(kind: EntityKind, id: u64) -> String {
    format!("cache:{}:{}", kind.as_str(), id)
}

pub fn lock_key(kind: EntityKind, id: u64) -> String {
    format!("lock:{}:{}", kind.as_str(), id)
}

pub fn bloom_key(kind: EntityKind) -> String {
    format!("bloom:{}", kind.as_str())
}

/// One staging key per rebuild, so concurrent rebuilders never share one
pub fn bloom_staging_key(kind: EntityKind, token: &str) -> String {
    format!("bloom:{}:staging:{}", kind.as_str(), token)
}

pub fn bloom_rebuilds_key(bloom_key: &str) -> String {
    format!("{}:rebuilds", bloom_key)
}

/// Keys touched by the admission script for one coupon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponKeys {
    pub stock: String,
    pub window: String,
    pub buyers: String,
}

impl CouponKeys {
    pub fn new(coupon_id: u64) -> Self {
        Self {
            stock: format!("seckill:stock:{{{}}}", coupon_id),
            window: format!("seckill:window:{{{}}}", coupon_id),
            buyers: format!("seckill:buyers:{{{}}}", coupon_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(cache_key(EntityKind::Shop, 7), "cache:shop:7");
        assert_eq!(lock_key(EntityKind::Shop, 7), "lock:shop:7");
        assert_eq!(bloom_key(EntityKind::User), "bloom:user");
        assert_eq!(bloom_staging_key(EntityKind::Shop, "ab12"), "bloom:shop:staging:ab12");
        assert_eq!(bloom_rebuilds_key("bloom:shop"), "bloom:shop:rebuilds");

        let keys = CouponKeys::new(42);
        assert_eq!(keys.stock, "seckill:stock:{42}");
        assert_eq!(keys.window, "seckill:window:{42}");
        assert_eq!(keys.buyers, "seckill:buyers:{42}");
    }
}
