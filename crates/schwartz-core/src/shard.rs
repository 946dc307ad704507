//! Per-shard runtime state the [`crate::client::Client`] and [`crate::job::Job`]
//! share: the driver handle, the clock, coalescing affinity, and the health
//! tracker that backs transient-failure backoff.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use crate::clock::Clock;
use crate::config::FaultInjection;
use crate::driver::ShardDriver;

/// Minimum and maximum exponential-backoff window, in seconds, applied to a
/// shard after it raises a transient error.
pub const BACKOFF_FLOOR_SECS: i64 = 1;
pub const BACKOFF_CEIL_SECS: i64 = 60;

/// Tracks whether a shard is currently healthy and, if not, when its
/// backoff window expires.
#[derive(Debug, Default)]
pub struct ShardHealth {
    /// Wall-clock second at which this shard becomes eligible again. Zero
    /// means healthy.
    unhealthy_until: AtomicI64,
    /// Number of consecutive transient failures, used to grow the backoff
    /// window exponentially up to [`BACKOFF_CEIL_SECS`].
    consecutive_failures: AtomicU32,
}

impl ShardHealth {
    pub fn is_healthy(&self, now: i64) -> bool {
        self.unhealthy_until.load(Ordering::Relaxed) <= now
    }

    /// Record a transient failure, extending the backoff window from `now`.
    /// The first failure gets the floor window (1s); each consecutive
    /// failure doubles it, capped at [`BACKOFF_CEIL_SECS`].
    pub fn mark_unhealthy(&self, now: i64) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let window = BACKOFF_FLOOR_SECS
            .saturating_mul(1i64 << (failures - 1).min(6))
            .min(BACKOFF_CEIL_SECS);
        self.unhealthy_until.store(now + window, Ordering::Relaxed);
    }

    /// Record a success, resetting the backoff window immediately.
    pub fn mark_healthy(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.unhealthy_until.store(0, Ordering::Relaxed);
    }
}

/// The `(funcid, coalesce)` pair a shard last yielded a grab for, used to
/// bias the next batch toward the same affinity group. Cleared after one
/// full pass over every shard without a hit, so affinity never starves
/// unrelated work.
#[derive(Debug, Default)]
pub struct CoalesceAffinity(Mutex<Option<(i64, String)>>);

impl CoalesceAffinity {
    pub fn get(&self) -> Option<(i64, String)> {
        self.0.lock().expect("coalesce affinity mutex poisoned").clone()
    }

    pub fn set(&self, value: Option<(i64, String)>) {
        *self.0.lock().expect("coalesce affinity mutex poisoned") = value;
    }

    pub fn clear(&self) {
        self.set(None);
    }
}

/// Everything a [`crate::job::Job`] or the dispatcher needs to act on one
/// shard: the driver, the shared clock, and that shard's health/affinity
/// state.
pub struct ShardContext<D: ShardDriver> {
    pub id: usize,
    pub driver: Arc<D>,
    pub clock: Arc<dyn Clock>,
    pub health: ShardHealth,
    pub coalesce: CoalesceAffinity,
    pub fault_injection: FaultInjection,
    /// Relative weight for the weighted random shard draw on insert.
    pub weight: u32,
}

impl<D: ShardDriver> ShardContext<D> {
    pub fn new(
        id: usize,
        driver: Arc<D>,
        clock: Arc<dyn Clock>,
        fault_injection: FaultInjection,
        weight: u32,
    ) -> Self {
        Self {
            id,
            driver,
            clock,
            health: ShardHealth::default(),
            coalesce: CoalesceAffinity::default(),
            fault_injection,
            weight,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }
}
