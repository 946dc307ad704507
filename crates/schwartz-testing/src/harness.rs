//! Small conveniences for writing worker tests: wrap an async closure as a
//! [`WorkerDescriptor`] instead of hand-writing a struct per test.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use schwartz_core::{Job, ShardDriver, WorkerDescriptor};

type WorkFn<D> =
    Box<dyn Fn(&mut Job<D>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> + Send + Sync>;

/// A [`WorkerDescriptor`] built from a closure, for tests that don't want
/// to declare a whole struct per ability.
pub struct ClosureWorker<D: ShardDriver> {
    grab_for: i64,
    max_retries: u32,
    retry_delay: i64,
    keep_exit_status_for: i64,
    work: WorkFn<D>,
}

impl<D: ShardDriver> ClosureWorker<D> {
    pub fn new<F>(grab_for: i64, work: F) -> Self
    where
        F: for<'a> Fn(&'a mut Job<D>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            grab_for,
            max_retries: 0,
            retry_delay: 0,
            keep_exit_status_for: 0,
            work: Box::new(work),
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, retry_delay: i64) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn keep_exit_status_for(mut self, seconds: i64) -> Self {
        self.keep_exit_status_for = seconds;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl<D: ShardDriver> WorkerDescriptor<D> for ClosureWorker<D> {
    fn max_retries(&self, _job: &Job<D>) -> u32 {
        self.max_retries
    }

    fn retry_delay(&self, _failures: u32) -> i64 {
        self.retry_delay
    }

    fn grab_for(&self) -> i64 {
        self.grab_for
    }

    fn keep_exit_status_for(&self) -> i64 {
        self.keep_exit_status_for
    }

    async fn work(&self, job: &mut Job<D>) -> anyhow::Result<()> {
        (self.work)(job).await
    }
}
