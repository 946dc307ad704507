//! [`Job`]: the in-memory representation of a leased job, and its terminal
//! lifecycle methods.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::ability::WorkerDescriptor;
use crate::driver::{decode_arg, encode_arg, ErrorRow, ExitStatusRow, JobRow, ShardDriver};
use crate::error::{SchwartzError, SchwartzResult};
use crate::handle::JobHandle;
use crate::shard::ShardContext;

/// A new job to insert as part of [`Job::replace_with`]. Carries the same
/// fields as `Client::insert`'s options, scoped to the replacing job's
/// shard.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub funcname: String,
    pub arg: Value,
    pub uniqkey: Option<String>,
    pub run_after: Option<i64>,
    pub priority: i32,
    pub coalesce: Option<String>,
}

impl NewJob {
    pub fn new(funcname: impl Into<String>, arg: Value) -> Self {
        Self {
            funcname: funcname.into(),
            arg,
            uniqkey: None,
            run_after: None,
            priority: 0,
            coalesce: None,
        }
    }

    pub fn uniqkey(mut self, key: impl Into<String>) -> Self {
        self.uniqkey = Some(key.into());
        self
    }

    pub fn run_after(mut self, at: i64) -> Self {
        self.run_after = Some(at);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn coalesce(mut self, key: impl Into<String>) -> Self {
        self.coalesce = Some(key.into());
        self
    }
}

/// A leased job, handed to a [`WorkerDescriptor::work`] implementation.
///
/// Every terminal method (`completed`, `failed`, `permanent_failure`,
/// `replace_with`) first checks [`Job::did_something`]: once any of them
/// has run, the rest are no-ops that return `Ok(0)`. The guard is a plain
/// `bool`, not an atomic: a leased `Job` is never shared across workers,
/// the lease itself is what guarantees exclusivity.
pub struct Job<D: ShardDriver> {
    pub funcname: String,
    pub arg: Value,
    pub handle: JobHandle,
    funcid: i64,
    did_something: bool,
    /// The `grabbed_until` value this worker currently holds the lease
    /// under. Every `refresh_lease` call matches the update against this
    /// value and updates it on success, so a worker that outlives its own
    /// lease can never silently clobber whoever reclaimed the job next.
    grabbed_until: i64,
    descriptor: Arc<dyn WorkerDescriptor<D>>,
    shard: Arc<ShardContext<D>>,
}

impl<D: ShardDriver> Job<D> {
    pub(crate) fn from_row(
        row: &JobRow,
        leased_until: i64,
        funcname: String,
        descriptor: Arc<dyn WorkerDescriptor<D>>,
        shard: Arc<ShardContext<D>>,
    ) -> SchwartzResult<Self> {
        let arg = decode_arg(&row.arg)?;
        Ok(Self {
            funcname,
            arg,
            handle: JobHandle::new(shard.id, row.jobid),
            funcid: row.funcid,
            did_something: false,
            grabbed_until: leased_until,
            descriptor,
            shard,
        })
    }

    /// Whether a terminal method has already run for this `Job` instance.
    pub fn did_something(&self) -> bool {
        self.did_something
    }

    /// The descriptor that owns this job's funcname, used by the work loop
    /// to dispatch `work` without re-querying the ability registry.
    pub(crate) fn descriptor(&self) -> &Arc<dyn WorkerDescriptor<D>> {
        &self.descriptor
    }

    /// Re-issue the conditional lease update with a new `grabbed_until`,
    /// for long-running workers that need to outlive their original
    /// `grab_for`. The update is conditioned on the `grabbed_until` this
    /// `Job` currently holds, so a worker that runs past its own lease
    /// cannot clobber a different worker that has since reclaimed the row:
    /// if the row's `grabbed_until` no longer matches, this returns
    /// [`SchwartzError::LeaseLost`] instead of writing a new value.
    pub async fn refresh_lease(&mut self, extra_seconds: i64) -> SchwartzResult<()> {
        let new_grabbed_until = self.shard.now() + extra_seconds;
        self.shard
            .driver
            .refresh_lease(self.handle.jobid, self.grabbed_until, new_grabbed_until)
            .await?;
        self.grabbed_until = new_grabbed_until;
        Ok(())
    }

    /// Record success: write ExitStatus(status=0) if the descriptor keeps
    /// exit statuses, then remove the job row. No-op if a terminal method
    /// already ran.
    pub async fn completed(&mut self) -> SchwartzResult<u32> {
        if self.did_something {
            debug!(jobid = self.handle.jobid, "completed: already did something, ignoring");
            return Ok(0);
        }
        self.did_something = true;

        let keep_for = self.descriptor.keep_exit_status_for();
        if keep_for > 0 {
            let now = self.shard.now();
            self.shard
                .driver
                .insert_exit_status(&ExitStatusRow {
                    jobid: self.handle.jobid,
                    funcid: self.funcid,
                    status: 0,
                    completion_time: now,
                    delete_after: now + keep_for,
                })
                .await?;
        }
        self.shard.driver.remove_job(self.handle.jobid).await?;
        debug!(jobid = self.handle.jobid, "job completed");
        Ok(1)
    }

    /// Record a permanent failure: write an Error row, record
    /// ExitStatus(status=`exit_status`), and remove the job row. Never
    /// retries, regardless of the descriptor's `max_retries`.
    pub async fn permanent_failure(&mut self, message: impl Into<String>) -> SchwartzResult<u32> {
        self.permanent_failure_with_status(message, 1).await
    }

    pub async fn permanent_failure_with_status(
        &mut self,
        message: impl Into<String>,
        exit_status: i32,
    ) -> SchwartzResult<u32> {
        if self.did_something {
            debug!(jobid = self.handle.jobid, "permanent_failure: already did something, ignoring");
            return Ok(0);
        }
        self.did_something = true;

        let now = self.shard.now();
        self.shard
            .driver
            .insert_error(&ErrorRow {
                error_time: now,
                jobid: self.handle.jobid,
                funcid: self.funcid,
                message: message.into(),
            })
            .await?;

        let keep_for = self.descriptor.keep_exit_status_for();
        if keep_for > 0 {
            self.shard
                .driver
                .insert_exit_status(&ExitStatusRow {
                    jobid: self.handle.jobid,
                    funcid: self.funcid,
                    status: exit_status,
                    completion_time: now,
                    delete_after: now + keep_for,
                })
                .await?;
        }
        self.shard.driver.remove_job(self.handle.jobid).await?;
        debug!(jobid = self.handle.jobid, "job permanently failed");
        Ok(1)
    }

    /// Record a (possibly-retryable) failure.
    ///
    /// `failures` is counted as the number of Error rows already recorded
    /// for this job, plus one for the row about to be written. If
    /// `max_retries(job) >= failures` the job is returned to the free pool
    /// with `run_after = now + retry_delay(failures)`; otherwise it is
    /// retired exactly as `permanent_failure` would retire it.
    pub async fn failed(&mut self, message: impl Into<String>) -> SchwartzResult<u32> {
        self.failed_with_status(message, 1).await
    }

    pub async fn failed_with_status(
        &mut self,
        message: impl Into<String>,
        exit_status: i32,
    ) -> SchwartzResult<u32> {
        if self.did_something {
            debug!(jobid = self.handle.jobid, "failed: already did something, ignoring");
            return Ok(0);
        }
        self.did_something = true;

        let message = message.into();
        let prior_failures = self.shard.driver.count_errors(self.handle.jobid).await?;
        let failures = (prior_failures + 1) as u32;
        let retry = self.descriptor.max_retries(self) >= failures;

        let now = self.shard.now();
        self.shard
            .driver
            .insert_error(&ErrorRow {
                error_time: now,
                jobid: self.handle.jobid,
                funcid: self.funcid,
                message,
            })
            .await?;

        if retry {
            let run_after = now + self.descriptor.retry_delay(failures);
            self.shard
                .driver
                .release_for_retry(self.handle.jobid, run_after)
                .await?;
            debug!(
                jobid = self.handle.jobid,
                failures, run_after, "job failed, scheduled for retry"
            );
        } else {
            let keep_for = self.descriptor.keep_exit_status_for();
            if keep_for > 0 {
                self.shard
                    .driver
                    .insert_exit_status(&ExitStatusRow {
                        jobid: self.handle.jobid,
                        funcid: self.funcid,
                        status: exit_status,
                        completion_time: now,
                        delete_after: now + keep_for,
                    })
                    .await?;
            }
            self.shard.driver.remove_job(self.handle.jobid).await?;
            debug!(jobid = self.handle.jobid, failures, "job failed, retries exhausted");
        }
        Ok(1)
    }

    /// Atomically replace this job with zero or more new jobs on the same
    /// shard: `begin`; insert every `new_job`; remove this job (recording
    /// ExitStatus(status=0) if configured, exactly as `completed` would);
    /// `commit`. If any step fails, the transaction is rolled back and the
    /// error is propagated: the original row is left intact and none of
    /// the replacements exist.
    pub async fn replace_with(&mut self, new_jobs: Vec<NewJob>) -> SchwartzResult<u32> {
        if self.did_something {
            debug!(jobid = self.handle.jobid, "replace_with: already did something, ignoring");
            return Ok(0);
        }
        self.did_something = true;

        let mut txn = self.shard.driver.begin().await?;
        let result = self.replace_with_inner(&mut txn, new_jobs).await;
        match result {
            Ok(()) => {
                self.shard.driver.commit(txn).await?;
                debug!(jobid = self.handle.jobid, "replace_with committed");
                Ok(1)
            }
            Err(e) => {
                self.shard.driver.rollback(txn).await?;
                debug!(jobid = self.handle.jobid, error = %e, "replace_with rolled back");
                Err(e)
            }
        }
    }

    async fn replace_with_inner(
        &self,
        txn: &mut D::Transaction,
        new_jobs: Vec<NewJob>,
    ) -> SchwartzResult<()> {
        for new_job in new_jobs {
            let funcid = self.shard.driver.intern_funcname(&new_job.funcname).await?;
            let now = self.shard.now();
            let row = JobRow {
                jobid: 0,
                funcid,
                arg: encode_arg(&new_job.arg)?,
                uniqkey: new_job.uniqkey,
                insert_time: now,
                run_after: new_job.run_after.unwrap_or(now),
                grabbed_until: 0,
                priority: new_job.priority,
                coalesce: new_job.coalesce,
            };
            self.shard.driver.insert_job_txn(txn, &row).await?;
        }

        if self.shard.fault_injection == crate::config::FaultInjection::ReplaceWithRollbackAfterInsert {
            return Err(SchwartzError::WorkerRaised(
                "fault injection: forced rollback after replace_with inserts".into(),
            ));
        }

        let keep_for = self.descriptor.keep_exit_status_for();
        if keep_for > 0 {
            let now = self.shard.now();
            self.shard
                .driver
                .insert_exit_status_txn(
                    txn,
                    &ExitStatusRow {
                        jobid: self.handle.jobid,
                        funcid: self.funcid,
                        status: 0,
                        completion_time: now,
                        delete_after: now + keep_for,
                    },
                )
                .await?;
        }
        self.shard.driver.remove_job_txn(txn, self.handle.jobid).await?;
        Ok(())
    }
}

impl<D: ShardDriver> std::fmt::Debug for Job<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("funcname", &self.funcname)
            .field("handle", &self.handle)
            .field("did_something", &self.did_something)
            .finish()
    }
}
