//! The Shard Driver contract: per-database transactional CRUD plus the
//! conditional-update primitive the lease protocol is built on.
//!
//! A [`ShardDriver`] is the only thing [`crate::client::Client`] knows how to
//! talk to; it never touches SQL, a connection pool, or an in-memory map
//! directly. `schwartz-postgres` and `schwartz-testing` are the two
//! implementations in this workspace.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SchwartzResult;

/// A persisted job row, as stored by a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub jobid: i64,
    pub funcid: i64,
    pub arg: Vec<u8>,
    pub uniqkey: Option<String>,
    pub insert_time: i64,
    pub run_after: i64,
    pub grabbed_until: i64,
    pub priority: i32,
    pub coalesce: Option<String>,
}

/// An append-only audit row recording one failure of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRow {
    pub error_time: i64,
    pub jobid: i64,
    pub funcid: i64,
    pub message: String,
}

/// A time-bounded audit row recording a job's final disposition.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitStatusRow {
    pub jobid: i64,
    pub funcid: i64,
    pub status: i32,
    pub completion_time: i64,
    pub delete_after: i64,
}

/// Ordering for [`ShardDriver::search_jobs`]. The core only ever asks for
/// the grab order: priority descending, jobid ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrder {
    PriorityDescJobIdAsc,
}

/// A search predicate over the `job` table, expressed structurally so a
/// driver can translate it into whatever its backend needs (a `WHERE`
/// clause, or a linear scan over an in-memory map).
#[derive(Debug, Clone)]
pub struct JobQuery {
    pub funcids: Vec<i64>,
    pub run_after_le: i64,
    pub grabbed_until_le: i64,
    pub order: JobOrder,
    pub limit: i64,
}

/// The snapshot a conditional update must match before applying, and the
/// new value to write. This is the single building block the lease
/// protocol is built from: an UPDATE that matches the primary key AND the
/// named column's previous value.
#[derive(Debug, Clone)]
pub struct GrabUpdate {
    pub jobid: i64,
    pub expected_grabbed_until: i64,
    pub new_grabbed_until: i64,
}

/// Per-shard transactional access. Every method may suspend on I/O; none
/// may be called concurrently on the same `Transaction` handle from more
/// than one task.
#[async_trait]
pub trait ShardDriver: Send + Sync {
    /// An open transaction handle, used only by `replace_with`.
    type Transaction: Send;

    /// Begin a transaction on this shard.
    async fn begin(&self) -> SchwartzResult<Self::Transaction>;
    /// Commit a transaction previously returned by `begin`.
    async fn commit(&self, txn: Self::Transaction) -> SchwartzResult<()>;
    /// Roll back a transaction previously returned by `begin`.
    async fn rollback(&self, txn: Self::Transaction) -> SchwartzResult<()>;

    /// Resolve `funcname` to its per-shard `funcid`, interning it (creating
    /// the `funcmap` row) if this is the first time the shard has seen it.
    async fn intern_funcname(&self, funcname: &str) -> SchwartzResult<i64>;
    /// Resolve a `funcid` back to its funcname. `None` if unknown to this shard.
    async fn resolve_funcname(&self, funcid: i64) -> SchwartzResult<Option<String>>;
    /// Resolve `funcname` to its `funcid` without creating the mapping if
    /// absent. Used by read-only paths (grab, list_jobs) that must not
    /// write a `funcmap` row for a name this shard has never interned.
    async fn resolve_funcid(&self, funcname: &str) -> SchwartzResult<Option<i64>>;

    /// Insert a job row. Returns `ConstraintViolated` if `(funcid, uniqkey)`
    /// collides with an existing non-null-uniqkey row.
    async fn insert_job(&self, row: &JobRow) -> SchwartzResult<i64>;
    /// Insert a job row within an already-open transaction (used by
    /// `replace_with`, which batches multiple inserts with one commit).
    async fn insert_job_txn(&self, txn: &mut Self::Transaction, row: &JobRow) -> SchwartzResult<i64>;

    /// Look up a job row by shard-local primary key, if it still exists.
    async fn find_job(&self, jobid: i64) -> SchwartzResult<Option<JobRow>>;
    /// Find an existing row by its unique key, used to return the existing
    /// handle on a uniqkey collision.
    async fn find_job_by_uniqkey(&self, funcid: i64, uniqkey: &str) -> SchwartzResult<Option<JobRow>>;

    /// Candidate rows eligible for grab, per `query`.
    async fn search_jobs(&self, query: &JobQuery) -> SchwartzResult<Vec<JobRow>>;

    /// The lease protocol's sole write primitive: attempt to move
    /// `grabbed_until` from `expected_grabbed_until` to `new_grabbed_until`,
    /// succeeding only if the row is unchanged since it was read. Returns
    /// the number of rows affected (0 or 1).
    async fn grab_if_unchanged(&self, update: &GrabUpdate) -> SchwartzResult<u64>;

    /// Return a job to the free pool with a new `run_after`, for a failure
    /// that will retry.
    async fn release_for_retry(&self, jobid: i64, run_after: i64) -> SchwartzResult<()>;

    /// Refresh a held lease's `grabbed_until`, for long-running workers.
    /// Conditioned on `expected_grabbed_until` exactly like
    /// `grab_if_unchanged`: if the row's `grabbed_until` no longer matches
    /// (lease expired and reclaimed by another worker, or the row is gone),
    /// no row is updated and the caller gets `SchwartzError::LeaseLost`.
    async fn refresh_lease(
        &self,
        jobid: i64,
        expected_grabbed_until: i64,
        new_grabbed_until: i64,
    ) -> SchwartzResult<()>;

    /// Remove a job row outright (on completion or exhausted retries).
    async fn remove_job(&self, jobid: i64) -> SchwartzResult<()>;
    /// Remove a job row within an open transaction.
    async fn remove_job_txn(&self, txn: &mut Self::Transaction, jobid: i64) -> SchwartzResult<()>;

    /// Append an Error row.
    async fn insert_error(&self, row: &ErrorRow) -> SchwartzResult<()>;
    /// Count Error rows recorded for a jobid so far.
    async fn count_errors(&self, jobid: i64) -> SchwartzResult<i64>;
    /// All Error rows for a jobid, oldest first.
    async fn list_errors(&self, jobid: i64) -> SchwartzResult<Vec<ErrorRow>>;

    /// Record an ExitStatus row.
    async fn insert_exit_status(&self, row: &ExitStatusRow) -> SchwartzResult<()>;
    /// Record an ExitStatus row within an open transaction.
    async fn insert_exit_status_txn(
        &self,
        txn: &mut Self::Transaction,
        row: &ExitStatusRow,
    ) -> SchwartzResult<()>;
    /// Look up the most recent ExitStatus row for a jobid, if any remains.
    async fn find_exit_status(&self, jobid: i64) -> SchwartzResult<Option<ExitStatusRow>>;
    /// Delete ExitStatus rows whose `delete_after` has passed. Returns the
    /// number of rows removed. Idempotent and safe to run concurrently.
    async fn sweep_exit_statuses(&self, now: i64) -> SchwartzResult<u64>;

    /// List up to `limit` jobs for a funcname, most recently inserted first.
    async fn list_jobs(&self, funcid: i64, limit: i64) -> SchwartzResult<Vec<JobRow>>;
}

/// Encode an `arg` value into the self-describing blob stored in `job.arg`.
pub fn encode_arg(value: &Value) -> SchwartzResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| crate::error::SchwartzError::SerializationFailed(e.to_string()))
}

/// Decode a `job.arg` blob back into a value. The inverse of [`encode_arg`].
pub fn decode_arg(bytes: &[u8]) -> SchwartzResult<Value> {
    serde_json::from_slice(bytes)
        .map_err(|e| crate::error::SchwartzError::SerializationFailed(e.to_string()))
}
