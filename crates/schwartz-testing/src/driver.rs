//! An in-memory [`schwartz_core::ShardDriver`] backed by `DashMap`s, so
//! `schwartz-core`'s test suite (and downstream worker unit tests) can run
//! without a database while still exercising real concurrent-grab races.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use schwartz_core::{
    ErrorRow, ExitStatusRow, GrabUpdate, JobOrder, JobQuery, JobRow, SchwartzError,
    SchwartzResult, ShardDriver,
};

/// One pending mutation to undo if a transaction rolls back.
enum UndoOp {
    RemoveJob(i64),
    RemoveUniqIndex(i64, String),
    RestoreJob(JobRow),
    RemoveExitStatus(i64),
}

/// An in-memory transaction: mutations are applied eagerly to the shared
/// maps and recorded here so `rollback` can reverse them in order.
#[derive(Default)]
pub struct InMemoryTransaction {
    undo: Vec<UndoOp>,
}

/// An in-memory, single-process shard. Useful for unit tests and the
/// `schwartz-core` test suite; not durable and not suitable for production.
#[derive(Default)]
pub struct InMemoryShardDriver {
    jobs: DashMap<i64, JobRow>,
    next_jobid: AtomicI64,
    funcname_to_id: DashMap<String, i64>,
    funcid_to_name: DashMap<i64, String>,
    next_funcid: AtomicI64,
    errors: DashMap<i64, Vec<ErrorRow>>,
    exit_statuses: DashMap<i64, ExitStatusRow>,
    uniq_index: DashMap<(i64, String), i64>,
}

impl InMemoryShardDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of job rows currently present. Handy in tests asserting a
    /// row was (or wasn't) removed.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    fn allocate_jobid(&self) -> i64 {
        self.next_jobid.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn insert_job_locked(&self, row: &JobRow) -> SchwartzResult<(i64, Vec<UndoOp>)> {
        if let Some(key) = &row.uniqkey {
            if self.uniq_index.contains_key(&(row.funcid, key.clone())) {
                return Err(SchwartzError::ConstraintViolated(format!(
                    "duplicate uniqkey {key:?} for funcid {}",
                    row.funcid
                )));
            }
        }
        let jobid = self.allocate_jobid();
        let mut stored = row.clone();
        stored.jobid = jobid;
        self.jobs.insert(jobid, stored);
        let mut undo = vec![UndoOp::RemoveJob(jobid)];
        if let Some(key) = &row.uniqkey {
            self.uniq_index.insert((row.funcid, key.clone()), jobid);
            undo.push(UndoOp::RemoveUniqIndex(row.funcid, key.clone()));
        }
        Ok((jobid, undo))
    }
}

#[async_trait]
impl ShardDriver for InMemoryShardDriver {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> SchwartzResult<Self::Transaction> {
        Ok(InMemoryTransaction::default())
    }

    async fn commit(&self, _txn: Self::Transaction) -> SchwartzResult<()> {
        Ok(())
    }

    async fn rollback(&self, txn: Self::Transaction) -> SchwartzResult<()> {
        for op in txn.undo.into_iter().rev() {
            match op {
                UndoOp::RemoveJob(jobid) => {
                    self.jobs.remove(&jobid);
                }
                UndoOp::RemoveUniqIndex(funcid, key) => {
                    self.uniq_index.remove(&(funcid, key));
                }
                UndoOp::RestoreJob(row) => {
                    self.jobs.insert(row.jobid, row);
                }
                UndoOp::RemoveExitStatus(jobid) => {
                    self.exit_statuses.remove(&jobid);
                }
            }
        }
        Ok(())
    }

    async fn intern_funcname(&self, funcname: &str) -> SchwartzResult<i64> {
        if let Some(id) = self.funcname_to_id.get(funcname) {
            return Ok(*id);
        }
        let id = self.next_funcid.fetch_add(1, Ordering::SeqCst) + 1;
        self.funcname_to_id.insert(funcname.to_string(), id);
        self.funcid_to_name.insert(id, funcname.to_string());
        Ok(id)
    }

    async fn resolve_funcname(&self, funcid: i64) -> SchwartzResult<Option<String>> {
        Ok(self.funcid_to_name.get(&funcid).map(|e| e.clone()))
    }

    async fn resolve_funcid(&self, funcname: &str) -> SchwartzResult<Option<i64>> {
        Ok(self.funcname_to_id.get(funcname).map(|e| *e))
    }

    async fn insert_job(&self, row: &JobRow) -> SchwartzResult<i64> {
        let (jobid, _undo) = self.insert_job_locked(row)?;
        Ok(jobid)
    }

    async fn insert_job_txn(&self, txn: &mut Self::Transaction, row: &JobRow) -> SchwartzResult<i64> {
        let (jobid, undo) = self.insert_job_locked(row)?;
        txn.undo.extend(undo);
        Ok(jobid)
    }

    async fn find_job(&self, jobid: i64) -> SchwartzResult<Option<JobRow>> {
        Ok(self.jobs.get(&jobid).map(|r| r.clone()))
    }

    async fn find_job_by_uniqkey(&self, funcid: i64, uniqkey: &str) -> SchwartzResult<Option<JobRow>> {
        let Some(jobid) = self.uniq_index.get(&(funcid, uniqkey.to_string())).map(|e| *e) else {
            return Ok(None);
        };
        Ok(self.jobs.get(&jobid).map(|r| r.clone()))
    }

    async fn search_jobs(&self, query: &JobQuery) -> SchwartzResult<Vec<JobRow>> {
        let mut rows: Vec<JobRow> = self
            .jobs
            .iter()
            .filter(|entry| {
                let row = entry.value();
                query.funcids.contains(&row.funcid)
                    && row.run_after <= query.run_after_le
                    && row.grabbed_until <= query.grabbed_until_le
            })
            .map(|entry| entry.value().clone())
            .collect();

        match query.order {
            JobOrder::PriorityDescJobIdAsc => {
                rows.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.jobid.cmp(&b.jobid)));
            }
        }
        rows.truncate(query.limit.max(0) as usize);
        Ok(rows)
    }

    async fn grab_if_unchanged(&self, update: &GrabUpdate) -> SchwartzResult<u64> {
        let Some(mut row) = self.jobs.get_mut(&update.jobid) else {
            return Ok(0);
        };
        if row.grabbed_until != update.expected_grabbed_until {
            return Ok(0);
        }
        row.grabbed_until = update.new_grabbed_until;
        Ok(1)
    }

    async fn release_for_retry(&self, jobid: i64, run_after: i64) -> SchwartzResult<()> {
        if let Some(mut row) = self.jobs.get_mut(&jobid) {
            row.run_after = run_after;
            row.grabbed_until = 0;
        }
        Ok(())
    }

    async fn refresh_lease(
        &self,
        jobid: i64,
        expected_grabbed_until: i64,
        new_grabbed_until: i64,
    ) -> SchwartzResult<()> {
        match self.jobs.get_mut(&jobid) {
            Some(mut row) if row.grabbed_until == expected_grabbed_until => {
                row.grabbed_until = new_grabbed_until;
                Ok(())
            }
            _ => Err(SchwartzError::LeaseLost {
                shard_id: "in-memory".to_string(),
                jobid,
            }),
        }
    }

    async fn remove_job(&self, jobid: i64) -> SchwartzResult<()> {
        if let Some((_, row)) = self.jobs.remove(&jobid) {
            if let Some(key) = row.uniqkey {
                self.uniq_index.remove(&(row.funcid, key));
            }
        }
        Ok(())
    }

    async fn remove_job_txn(&self, txn: &mut Self::Transaction, jobid: i64) -> SchwartzResult<()> {
        if let Some((_, row)) = self.jobs.remove(&jobid) {
            if let Some(key) = &row.uniqkey {
                self.uniq_index.remove(&(row.funcid, key.clone()));
            }
            txn.undo.push(UndoOp::RestoreJob(row));
        }
        Ok(())
    }

    async fn insert_error(&self, row: &ErrorRow) -> SchwartzResult<()> {
        self.errors.entry(row.jobid).or_default().push(row.clone());
        Ok(())
    }

    async fn count_errors(&self, jobid: i64) -> SchwartzResult<i64> {
        Ok(self.errors.get(&jobid).map(|v| v.len() as i64).unwrap_or(0))
    }

    async fn list_errors(&self, jobid: i64) -> SchwartzResult<Vec<ErrorRow>> {
        Ok(self.errors.get(&jobid).map(|v| v.clone()).unwrap_or_default())
    }

    async fn insert_exit_status(&self, row: &ExitStatusRow) -> SchwartzResult<()> {
        self.exit_statuses.insert(row.jobid, row.clone());
        Ok(())
    }

    async fn insert_exit_status_txn(
        &self,
        txn: &mut Self::Transaction,
        row: &ExitStatusRow,
    ) -> SchwartzResult<()> {
        self.exit_statuses.insert(row.jobid, row.clone());
        txn.undo.push(UndoOp::RemoveExitStatus(row.jobid));
        Ok(())
    }

    async fn find_exit_status(&self, jobid: i64) -> SchwartzResult<Option<ExitStatusRow>> {
        Ok(self.exit_statuses.get(&jobid).map(|r| r.clone()))
    }

    async fn sweep_exit_statuses(&self, now: i64) -> SchwartzResult<u64> {
        let expired: Vec<i64> = self
            .exit_statuses
            .iter()
            .filter(|e| e.value().delete_after < now)
            .map(|e| *e.key())
            .collect();
        for jobid in &expired {
            self.exit_statuses.remove(jobid);
        }
        Ok(expired.len() as u64)
    }

    async fn list_jobs(&self, funcid: i64, limit: i64) -> SchwartzResult<Vec<JobRow>> {
        let mut rows: Vec<JobRow> = self
            .jobs
            .iter()
            .filter(|e| e.value().funcid == funcid)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| b.insert_time.cmp(&a.insert_time));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}
