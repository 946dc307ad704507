//! The Ability Registry: per-client mapping from funcname to worker
//! descriptor, and the [`WorkerDescriptor`] contract itself.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::driver::ShardDriver;
use crate::job::Job;

/// The behavior contract for one function name.
///
/// A descriptor is registered once at startup and dispatched by funcname:
/// variants of a worker become distinct descriptor instances, not
/// subclasses of some base worker type. Parameterized over the shard
/// driver `D` so `job.completed()`/`job.failed()` etc. are available
/// directly on the `Job<D>` passed to `work`.
#[async_trait]
pub trait WorkerDescriptor<D: ShardDriver>: Send + Sync {
    /// Funcnames this descriptor handles. Defaults to its own registered
    /// name; a descriptor may additionally claim aliases.
    fn handles(&self) -> Vec<String> {
        Vec::new()
    }

    /// Maximum number of retries for a job before it is permanently failed.
    /// Zero means "fail permanently on first failure."
    fn max_retries(&self, _job: &Job<D>) -> u32 {
        0
    }

    /// Seconds to wait before the next attempt, given the number of
    /// failures so far (1-indexed: `failures` includes the failure that
    /// just happened).
    fn retry_delay(&self, _failures: u32) -> i64 {
        0
    }

    /// Lease duration in seconds granted when a job for this descriptor is
    /// grabbed. Must be a positive upper bound on expected execution time.
    fn grab_for(&self) -> i64;

    /// Seconds to retain this descriptor's ExitStatus rows. Zero disables
    /// ExitStatus recording entirely.
    fn keep_exit_status_for(&self) -> i64 {
        0
    }

    /// Run the job. Implementations should call exactly one of
    /// `job.completed()`, `job.failed(msg)`, `job.permanent_failure(msg)`,
    /// or `job.replace_with(new_jobs)`. A normal return without any of
    /// those calls is treated as success by `work_safely`; a raised error
    /// is converted into `job.failed(error)`.
    async fn work(&self, job: &mut Job<D>) -> anyhow::Result<()>;
}

/// Per-client map from funcname to the descriptor that handles it.
pub struct AbilityRegistry<D: ShardDriver> {
    descriptors: Arc<DashMap<String, Arc<dyn WorkerDescriptor<D>>>>,
}

impl<D: ShardDriver> Clone for AbilityRegistry<D> {
    fn clone(&self) -> Self {
        Self {
            descriptors: self.descriptors.clone(),
        }
    }
}

impl<D: ShardDriver> Default for AbilityRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: ShardDriver> AbilityRegistry<D> {
    pub fn new() -> Self {
        Self {
            descriptors: Arc::new(DashMap::new()),
        }
    }

    /// Register `descriptor` under `funcname`, plus every name in its
    /// `handles()` list.
    pub fn can(&self, funcname: impl Into<String>, descriptor: Arc<dyn WorkerDescriptor<D>>) {
        let funcname = funcname.into();
        for alias in descriptor.handles() {
            self.descriptors.insert(alias, descriptor.clone());
        }
        self.descriptors.insert(funcname, descriptor);
    }

    /// Clear every registered descriptor.
    pub fn reset_abilities(&self) {
        self.descriptors.clear();
    }

    /// The descriptor registered for `funcname`, if any.
    pub fn get(&self, funcname: &str) -> Option<Arc<dyn WorkerDescriptor<D>>> {
        self.descriptors.get(funcname).map(|entry| entry.clone())
    }

    /// All funcnames currently registered, in no particular order.
    pub fn funcnames(&self) -> Vec<String> {
        self.descriptors.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl<D: ShardDriver> std::fmt::Debug for AbilityRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbilityRegistry")
            .field("funcnames", &self.funcnames())
            .finish()
    }
}
