//! Time source shared by the admission gate and the in-memory store.
//!
//! Admission decisions compare "now" against a coupon's validity window, and
//! the in-memory store expires keys; both read time through [`Clock`] so tests
//! can pin it.

use parking_lot::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as i64
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Debug)]
pub struct MockClock {
    now: RwLock<SystemTime>,
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.read()
    }
}

impl MockClock {
    pub fn with_time(time: SystemTime) -> Self {
        Self { now: RwLock::new(time) }
    }

    pub fn at_ms(ms: i64) -> Self {
        Self::with_time(UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64))
    }

    pub fn new() -> Self {
        Self::with_time(SystemTime::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write();
        *now += duration;
    }

    pub fn set_ms(&self, ms: i64) {
        *self.now.write() = UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}
