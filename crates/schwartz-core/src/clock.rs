//! Wall-clock abstraction.
//!
//! Every comparison against `now` in the lease protocol and retry schedule
//! goes through a [`Clock`], so `schwartz-testing` can substitute a fake
//! clock and make backoff and lease-expiry tests deterministic instead of
//! sleeping in real time.

use std::sync::Arc;

/// A source of wall-clock seconds.
pub trait Clock: Send + Sync {
    /// The current wall-clock time, in seconds since the Unix epoch.
    fn now(&self) -> i64;
}

/// The real system clock, backed by [`chrono::Utc::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Construct the default production clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
