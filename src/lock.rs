//! Distributed mutual-exclusion lock
//!
//! `SET key token NX PX ttl` to acquire, compare-and-delete to release,
//! compare-and-pexpire to extend. The lock is best effort: no queueing, no
//! fairness, and a holder that stops renewing loses ownership once its TTL
//! runs out. Failing to acquire is a normal outcome, not an error.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::CoreError;
use crate::store::FastStore;

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn FastStore>,
}

/// Random 128-bit ownership token, hex encoded
pub fn new_token() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

impl DistributedLock {
    pub fn new(store: Arc<dyn FastStore>) -> Self {
        Self { store }
    }

    /// Never blocks. Returns the ownership token when the lock was taken.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>, CoreError> {
        let token = new_token();
        if self.store.set_nx_px(key, &token, ttl).await? {
            log::debug!("Lock {} acquired", key);
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    /// Release only if `token` still owns the lock
    pub async fn release(&self, key: &str, token: &str) -> Result<bool, CoreError> {
        let released = self.store.compare_and_delete(key, token).await?;
        if !released {
            log::warn!("Lock {} was no longer held by this owner at release", key);
        }
        Ok(released)
    }

    /// Renew the TTL only if `token` still owns the lock
    pub async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CoreError> {
        Ok(self.store.compare_and_expire(key, token, ttl).await?)
    }

    /// Drive `work` to completion, renewing the lock to `ttl` every third of
    /// `ttl` meanwhile. A failed renewal is logged; `work` keeps running.
    pub async fn renew_while<F: Future>(&self, key: &str, token: &str, ttl: Duration, work: F) -> F::Output {
        let every = (ttl / 3).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(Instant::now() + every, every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = renew.tick() => match self.extend(key, token, ttl).await {
                    Ok(true) => log::debug!("Lock {} renewed", key),
                    Ok(false) => log::warn!("Lock {} was lost while held", key),
                    Err(e) => log::warn!("Failed to renew lock {}: {}", key, e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::MemoryStore;

    fn setup() -> (Arc<MockClock>, DistributedLock) {
        let clock = Arc::new(MockClock::at_ms(0));
        let lock = DistributedLock::new(Arc::new(MemoryStore::new(clock.clone())));
        (clock, lock)
    }

    #[test]
    fn test_token_format() {
        let token = new_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, new_token());
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let (_clock, lock) = setup();
        let ttl = Duration::from_secs(10);
        let token = lock.try_acquire("lock:shop:1", ttl).await.unwrap().unwrap();
        assert!(lock.try_acquire("lock:shop:1", ttl).await.unwrap().is_none());
        // Different key is independent
        assert!(lock.try_acquire("lock:shop:2", ttl).await.unwrap().is_some());

        assert!(!lock.release("lock:shop:1", "not-the-owner").await.unwrap());
        assert!(lock.release("lock:shop:1", &token).await.unwrap());
        assert!(lock.try_acquire("lock:shop:1", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_owner_cannot_release_after_expiry() {
        let (clock, lock) = setup();
        let ttl = Duration::from_millis(100);
        let stale = lock.try_acquire("lock:shop:1", ttl).await.unwrap().unwrap();

        clock.advance(Duration::from_millis(150));
        let fresh = lock.try_acquire("lock:shop:1", ttl).await.unwrap().unwrap();

        assert!(!lock.release("lock:shop:1", &stale).await.unwrap());
        assert!(!lock.extend("lock:shop:1", &stale, ttl).await.unwrap());
        assert!(lock.extend("lock:shop:1", &fresh, Duration::from_secs(1)).await.unwrap());

        clock.advance(Duration::from_millis(500));
        assert!(lock.try_acquire("lock:shop:1", ttl).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_while_outlives_ttl() {
        let (clock, lock) = setup();
        let ttl = Duration::from_millis(300);
        let token = lock.try_acquire("lock:shop:1", ttl).await.unwrap().unwrap();

        // Twice the TTL passes on the store clock while the work runs
        let work = async {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_millis(150)).await;
                clock.advance(Duration::from_millis(150));
            }
            "loaded"
        };
        assert_eq!(lock.renew_while("lock:shop:1", &token, ttl, work).await, "loaded");

        assert!(lock.try_acquire("lock:shop:1", ttl).await.unwrap().is_none());
        assert!(lock.release("lock:shop:1", &token).await.unwrap());
    }
}
