//! A clock that advances only when told to, so retry backoff and lease
//! expiry can be tested without sleeping in real time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use schwartz_core::Clock;

/// A controllable clock starting at a fixed instant.
#[derive(Debug)]
pub struct FakeClock {
    now: AtomicI64,
}

impl FakeClock {
    pub fn new(start: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start),
        })
    }

    /// Advance the clock by `seconds` and return the new time.
    pub fn advance(&self, seconds: i64) -> i64 {
        self.now.fetch_add(seconds, Ordering::SeqCst) + seconds
    }

    /// Jump the clock to an absolute time.
    pub fn set(&self, at: i64) {
        self.now.store(at, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
