//! Client construction options.

use std::sync::Arc;

use crate::clock::{system_clock, Clock};

/// One configured shard: a driver instance plus its relative insertion
/// weight for the weighted random draw in `Client::insert`.
pub struct ShardConfig<D> {
    pub driver: Arc<D>,
    /// Relative weight for the weighted random shard draw on insert.
    /// Shards with a higher weight receive proportionally more inserts.
    pub weight: u32,
}

impl<D> ShardConfig<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self { driver, weight: 1 }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Test-only fault injection points, threaded through `ClientConfig`
/// instead of a process-global test switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultInjection {
    #[default]
    None,
    /// Force `replace_with` to roll back after its inserts have been
    /// issued but before the original job row is removed, to exercise the
    /// rollback half of the replace-with-atomicity invariant.
    ReplaceWithRollbackAfterInsert,
}

/// Options for constructing a [`crate::client::Client`].
pub struct ClientConfig {
    /// Optional prefix applied to funcnames on insert/grab, allowing
    /// several logical queues to share one physical shard set.
    pub prefix: Option<String>,
    /// Emit verbose (info-level, not just debug-level) tracing events.
    pub verbose: bool,
    /// Seconds to sleep between `work(delay)` iterations that found no
    /// eligible job, before jitter is applied.
    pub retry_seconds: i64,
    /// Number of candidate rows fetched per shard per grab batch.
    pub batch_size: i64,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) fault_injection: FaultInjection,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            verbose: false,
            retry_seconds: 5,
            batch_size: 50,
            clock: system_clock(),
            fault_injection: FaultInjection::None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn retry_seconds(mut self, seconds: i64) -> Self {
        self.retry_seconds = seconds;
        self
    }

    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Use a custom clock, e.g. `schwartz_testing::FakeClock`, in place of
    /// the system clock. Not part of the public builder surface exercised
    /// by production callers, but needed by `schwartz-testing`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn fault_injection(mut self, fault: FaultInjection) -> Self {
        self.fault_injection = fault;
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("prefix", &self.prefix)
            .field("verbose", &self.verbose)
            .field("retry_seconds", &self.retry_seconds)
            .field("batch_size", &self.batch_size)
            .field("fault_injection", &self.fault_injection)
            .finish()
    }
}
