//! The Client: owns the shard set and ability registry, performs
//! shard-balanced insert and the grab/lease protocol, and drives the work
//! loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::ability::{AbilityRegistry, WorkerDescriptor};
use crate::config::{ClientConfig, ShardConfig};
use crate::driver::{encode_arg, GrabUpdate, JobOrder, JobQuery, JobRow, ShardDriver};
use crate::error::{SchwartzError, SchwartzResult};
use crate::handle::JobHandle;
use crate::job::{Job, NewJob};
use crate::shard::ShardContext;

tokio::task_local! {
    static CURRENT_JOB: JobHandle;
}

/// Options recognized by [`Client::insert`].
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    pub uniqkey: Option<String>,
    pub run_after: Option<i64>,
    pub priority: i32,
    pub coalesce: Option<String>,
}

impl InsertOptions {
    pub fn new() -> Self {
        Self::default()
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

impl From<NewJob> for (String, Value, InsertOptions) {
    fn from(job: NewJob) -> Self {
        (
            job.funcname,
            job.arg,
            InsertOptions {
                uniqkey: job.uniqkey,
                run_after: job.run_after,
                priority: job.priority,
                coalesce: job.coalesce,
            },
        )
    }
}

/// A read-only snapshot of a job row, returned by `lookup_job`/`list_jobs`.
/// Distinct from [`Job`] itself, which additionally carries the descriptor
/// and shard context needed to lease and terminate a job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub handle: JobHandle,
    pub funcname: String,
    pub arg: Value,
    pub priority: i32,
    pub run_after: i64,
    pub insert_time: i64,
    pub grabbed_until: i64,
    pub coalesce: Option<String>,
}

impl JobSnapshot {
    fn from_row(handle: JobHandle, funcname: String, row: &JobRow) -> SchwartzResult<Self> {
        Ok(Self {
            handle,
            funcname,
            arg: crate::driver::decode_arg(&row.arg)?,
            priority: row.priority,
            run_after: row.run_after,
            insert_time: row.insert_time,
            grabbed_until: row.grabbed_until,
            coalesce: row.coalesce.clone(),
        })
    }
}

struct ClientInner<D: ShardDriver> {
    shards: Vec<Arc<ShardContext<D>>>,
    abilities: AbilityRegistry<D>,
    config: ClientConfig,
}

/// Owns the set of shards and the ability registry; the entry point for
/// producers (`insert`) and workers (`grab`/`work*`).
///
/// Cheap to clone: internally an `Arc`, so every worker task in a process
/// can share one `Client`.
pub struct Client<D: ShardDriver> {
    inner: Arc<ClientInner<D>>,
}

impl<D: ShardDriver> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: ShardDriver + 'static> Client<D> {
    /// Construct a client over the given shards.
    pub fn new(shard_configs: Vec<ShardConfig<D>>, config: ClientConfig) -> Self {
        let shards = shard_configs
            .into_iter()
            .enumerate()
            .map(|(id, sc)| {
                Arc::new(ShardContext::new(
                    id,
                    sc.driver,
                    config.clock.clone(),
                    config.fault_injection,
                    sc.weight.max(1),
                ))
            })
            .collect();
        Self {
            inner: Arc::new(ClientInner {
                shards,
                abilities: AbilityRegistry::new(),
                config,
            }),
        }
    }

    fn apply_prefix(&self, funcname: &str) -> String {
        match &self.inner.config.prefix {
            Some(prefix) => format!("{prefix}{funcname}"),
            None => funcname.to_string(),
        }
    }

    fn shard(&self, shard_id: usize) -> SchwartzResult<&Arc<ShardContext<D>>> {
        self.inner
            .shards
            .get(shard_id)
            .ok_or(SchwartzError::NoShardAvailable)
    }

    /// Register `descriptor` to handle `funcname` (and any aliases it
    /// declares via `WorkerDescriptor::handles`).
    ///
    /// The original client's single-argument `can(name)` form (resolving a
    /// descriptor class by naming convention) has no counterpart here: a
    /// descriptor is a registry value, not a class, so there is nothing to
    /// resolve by name alone. Every call site names its descriptor instance
    /// explicitly.
    pub fn can(&self, funcname: impl Into<String>, descriptor: Arc<dyn WorkerDescriptor<D>>) {
        self.inner.abilities.can(funcname, descriptor);
    }

    /// Clear every registered ability.
    pub fn reset_abilities(&self) {
        self.inner.abilities.reset_abilities();
    }

    // -- insert ------------------------------------------------------------

    /// Insert one job, returning a handle to it. A uniqkey collision is
    /// treated as success, returning a handle to the pre-existing row.
    pub async fn insert(
        &self,
        funcname: &str,
        arg: Value,
        opts: InsertOptions,
    ) -> SchwartzResult<JobHandle> {
        let funcname = self.apply_prefix(funcname);
        let order = self.weighted_shard_order();
        if order.is_empty() {
            return Err(SchwartzError::NoShardAvailable);
        }

        let mut last_err = None;
        for idx in order {
            let shard = self.inner.shards[idx].clone();
            match self.insert_on_shard(&shard, &funcname, &arg, &opts).await {
                Ok(handle) => {
                    shard.health.mark_healthy();
                    return Ok(handle);
                }
                Err(e) => {
                    if e.marks_shard_unhealthy() {
                        shard.health.mark_unhealthy(shard.now());
                    }
                    warn!(shard = shard.id, error = %e, "insert failed on shard, trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(SchwartzError::NoShardAvailable))
    }

    async fn insert_on_shard(
        &self,
        shard: &Arc<ShardContext<D>>,
        funcname: &str,
        arg: &Value,
        opts: &InsertOptions,
    ) -> SchwartzResult<JobHandle> {
        let funcid = shard.driver.intern_funcname(funcname).await?;
        let now = shard.now();
        let row = JobRow {
            jobid: 0,
            funcid,
            arg: encode_arg(arg)?,
            uniqkey: opts.uniqkey.clone(),
            insert_time: now,
            run_after: opts.run_after.unwrap_or(now),
            grabbed_until: 0,
            priority: opts.priority,
            coalesce: opts.coalesce.clone(),
        };
        match shard.driver.insert_job(&row).await {
            Ok(jobid) => Ok(JobHandle::new(shard.id, jobid)),
            Err(e) if e.is_constraint_violation() => {
                if let Some(key) = &opts.uniqkey {
                    if let Some(existing) = shard.driver.find_job_by_uniqkey(funcid, key).await? {
                        return Ok(JobHandle::new(shard.id, existing.jobid));
                    }
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Insert a batch of jobs, each independently shard-balanced.
    pub async fn insert_jobs(&self, jobs: Vec<NewJob>) -> SchwartzResult<Vec<JobHandle>> {
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let (funcname, arg, opts): (String, Value, InsertOptions) = job.into();
            handles.push(self.insert(&funcname, arg, opts).await?);
        }
        Ok(handles)
    }

    /// A weighted-random permutation of currently-healthy shard indices,
    /// using each shard's configured weight. Exponential-key sampling
    /// without replacement: `key = -ln(U)/weight`, sorted ascending.
    fn weighted_shard_order(&self) -> Vec<usize> {
        let mut rng = rand::thread_rng();
        let mut candidates: Vec<(usize, f64)> = self
            .inner
            .shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.health.is_healthy(s.now()))
            .map(|(i, s)| {
                let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
                let key = -u.ln() / f64::from(s.weight.max(1));
                (i, key)
            })
            .collect();
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.into_iter().map(|(i, _)| i).collect()
    }

    /// Currently-healthy shard indices in a fairness shuffle (uniform, not
    /// weighted) for one outer grab pass.
    fn shuffled_healthy_shards(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = self
            .inner
            .shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.health.is_healthy(s.now()))
            .map(|(i, _)| i)
            .collect();
        idx.shuffle(&mut rand::thread_rng());
        idx
    }

    // -- grab / lease --------------------------------------------------

    /// Attempt to grab one job whose funcname is in `allowed`, trying every
    /// healthy shard in a fresh fairness shuffle. Returns `None` if no
    /// shard currently has an eligible, unleased row.
    pub async fn grab(&self, allowed: &[String]) -> Option<Job<D>> {
        let allowed: Vec<String> = allowed.iter().map(|n| self.apply_prefix(n)).collect();
        let order = self.shuffled_healthy_shards();
        for idx in &order {
            let shard = self.inner.shards[*idx].clone();
            if let Some(job) = self.grab_on_shard(&shard, &allowed).await {
                return Some(job);
            }
        }
        // A full pass without a hit: affinity has served its purpose (or
        // never applied) and must not be allowed to starve other work.
        for shard in &self.inner.shards {
            shard.coalesce.clear();
        }
        None
    }

    async fn grab_on_shard(&self, shard: &Arc<ShardContext<D>>, allowed: &[String]) -> Option<Job<D>> {
        let mut funcid_to_name: HashMap<i64, String> = HashMap::new();
        for name in allowed {
            match shard.driver.resolve_funcid(name).await {
                Ok(Some(funcid)) => {
                    funcid_to_name.insert(funcid, name.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    self.note_shard_error(shard, &e);
                    return None;
                }
            }
        }
        if funcid_to_name.is_empty() {
            return None;
        }

        let now = shard.now();
        let query = JobQuery {
            funcids: funcid_to_name.keys().copied().collect(),
            run_after_le: now,
            grabbed_until_le: now,
            order: JobOrder::PriorityDescJobIdAsc,
            limit: self.inner.config.batch_size,
        };
        let mut rows = match shard.driver.search_jobs(&query).await {
            Ok(rows) => rows,
            Err(e) => {
                self.note_shard_error(shard, &e);
                return None;
            }
        };

        if let Some((affinity_funcid, affinity_key)) = shard.coalesce.get() {
            rows.sort_by_key(|row| {
                let matches = row.funcid == affinity_funcid && row.coalesce.as_deref() == Some(affinity_key.as_str());
                !matches // false (0) sorts before true (1): matches come first
            });
        }

        for row in rows {
            let Some(funcname) = funcid_to_name.get(&row.funcid).cloned() else {
                continue;
            };
            let Some(descriptor) = self.inner.abilities.get(&funcname) else {
                warn!(funcname, "grabbed row for funcname with no registered ability");
                continue;
            };

            let update = GrabUpdate {
                jobid: row.jobid,
                expected_grabbed_until: row.grabbed_until,
                new_grabbed_until: now + descriptor.grab_for(),
            };
            match shard.driver.grab_if_unchanged(&update).await {
                Ok(1) => {
                    shard.health.mark_healthy();
                    shard
                        .coalesce
                        .set(row.coalesce.clone().map(|c| (row.funcid, c)));
                    return match Job::from_row(
                        &row,
                        update.new_grabbed_until,
                        funcname,
                        descriptor,
                        shard.clone(),
                    ) {
                        Ok(job) => Some(job),
                        Err(e) => {
                            warn!(jobid = row.jobid, error = %e, "failed to materialize grabbed job");
                            None
                        }
                    };
                }
                Ok(_) => continue, // rows_affected = 0: lost the race, try next candidate
                Err(e) => {
                    self.note_shard_error(shard, &e);
                    return None;
                }
            }
        }
        None
    }

    fn note_shard_error(&self, shard: &Arc<ShardContext<D>>, err: &SchwartzError) {
        debug!(shard = shard.id, error = %err, "shard error during grab");
        if err.marks_shard_unhealthy() {
            shard.health.mark_unhealthy(shard.now());
        }
    }

    // -- work loop -------------------------------------------------------

    /// One grab attempt across every healthy shard. If a job is acquired,
    /// run its descriptor's `work` under the fault barrier. Returns
    /// whether any work was done.
    pub async fn work_once(&self) -> bool {
        let allowed = self.inner.abilities.funcnames();
        if allowed.is_empty() {
            return false;
        }
        match self.grab(&allowed).await {
            Some(job) => {
                self.work_safely(job).await;
                true
            }
            None => false,
        }
    }

    /// Call `work_once` until it reports no eligible job remained at the
    /// moment of the check. Used for drains and test harnesses.
    pub async fn work_until_done(&self) {
        while self.work_once().await {}
    }

    /// Run forever: on an empty grab, sleep `delay` (with jitter) before
    /// retrying.
    pub async fn work(&self, delay: Duration) -> ! {
        loop {
            if !self.work_once().await {
                let jitter = rand::thread_rng().gen_range(0.85..1.15);
                tokio::time::sleep(delay.mul_f64(jitter)).await;
            }
        }
    }

    /// Run forever using the configured `retry_seconds` as the empty-grab
    /// delay, for callers that don't need a custom interval per call site.
    pub async fn run(&self) -> ! {
        let delay = Duration::from_secs(self.inner.config.retry_seconds.max(0) as u64);
        self.work(delay).await
    }

    /// Wrap a descriptor's `work` with the fault barrier: a raised error
    /// becomes `job.failed(message)`; a normal return without any terminal
    /// call becomes `job.completed()`.
    async fn work_safely(&self, mut job: Job<D>) {
        let descriptor = job.descriptor().clone();
        let handle = job.handle;
        let result = CURRENT_JOB
            .scope(handle, async { descriptor.work(&mut job).await })
            .await;

        match result {
            Ok(()) => {
                if !job.did_something() {
                    if let Err(e) = job.completed().await {
                        warn!(jobid = handle.jobid, error = %e, "failed to record completion");
                    }
                }
            }
            Err(e) => {
                if !job.did_something() {
                    if let Err(e2) = job.failed(e.to_string()).await {
                        warn!(jobid = handle.jobid, error = %e2, "failed to record failure");
                    }
                }
            }
        }
    }

    /// The handle of the job currently executing on this task, if any.
    pub fn current_job() -> Option<JobHandle> {
        CURRENT_JOB.try_with(|h| *h).ok()
    }

    // -- lookup ------------------------------------------------------------

    /// Fetch a read-only snapshot of a job by handle, if it still exists.
    pub async fn lookup_job(&self, handle: JobHandle) -> SchwartzResult<Option<JobSnapshot>> {
        let shard = self.shard(handle.shard_id)?;
        match shard.driver.find_job(handle.jobid).await? {
            Some(row) => {
                let funcname = shard
                    .driver
                    .resolve_funcname(row.funcid)
                    .await?
                    .unwrap_or_default();
                Ok(Some(JobSnapshot::from_row(handle, funcname, &row)?))
            }
            None => Ok(None),
        }
    }

    /// List up to `limit` jobs for `funcname` across every shard.
    pub async fn list_jobs(&self, funcname: &str, limit: i64) -> SchwartzResult<Vec<JobSnapshot>> {
        let funcname = self.apply_prefix(funcname);
        let mut out = Vec::new();
        for shard in &self.inner.shards {
            if let Some(funcid) = shard.driver.resolve_funcid(&funcname).await? {
                for row in shard.driver.list_jobs(funcid, limit).await? {
                    out.push(JobSnapshot::from_row(
                        JobHandle::new(shard.id, row.jobid),
                        funcname.clone(),
                        &row,
                    )?);
                }
            }
        }
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    pub(crate) async fn handle_failures(&self, handle: &JobHandle) -> SchwartzResult<i64> {
        let shard = self.shard(handle.shard_id)?;
        shard.driver.count_errors(handle.jobid).await
    }

    pub(crate) async fn handle_failure_log(&self, handle: &JobHandle) -> SchwartzResult<Vec<String>> {
        let shard = self.shard(handle.shard_id)?;
        Ok(shard
            .driver
            .list_errors(handle.jobid)
            .await?
            .into_iter()
            .map(|e| e.message)
            .collect())
    }

    pub(crate) async fn handle_exit_status(&self, handle: &JobHandle) -> SchwartzResult<Option<i32>> {
        let shard = self.shard(handle.shard_id)?;
        Ok(shard
            .driver
            .find_exit_status(handle.jobid)
            .await?
            .map(|r| r.status))
    }

    // -- sweeper -----------------------------------------------------------

    /// Spawn a background task that periodically sweeps expired
    /// ExitStatus rows on every shard. Idempotent; safe to run from
    /// multiple processes concurrently.
    pub fn spawn_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for shard in &client.inner.shards {
                    let now = shard.now();
                    match shard.driver.sweep_exit_statuses(now).await {
                        Ok(0) => {}
                        Ok(n) => debug!(shard = shard.id, swept = n, "exit status sweep"),
                        Err(e) => warn!(shard = shard.id, error = %e, "exit status sweep failed"),
                    }
                }
            }
        })
    }
}
