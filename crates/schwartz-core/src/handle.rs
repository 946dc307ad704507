//! [`JobHandle`]: a persistent, cheap-to-serialize reference to a job row.

use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::driver::ShardDriver;
use crate::error::SchwartzResult;

/// A reference to a job row, valid across processes: just `(shard, jobid)`.
///
/// `JobHandle` deliberately carries no reference to the `Client` or shard
/// driver that produced it: that would make the object graph cyclic
/// (`Job` → `JobHandle` → `Client` → `Driver` → rows that describe `Job`s).
/// Instead every status query takes the owning `&Client` explicitly and
/// looks the shard up by `shard_id`, breaking the cycle at the type level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub shard_id: usize,
    pub jobid: i64,
}

impl JobHandle {
    pub fn new(shard_id: usize, jobid: i64) -> Self {
        Self { shard_id, jobid }
    }

    /// Number of Error rows recorded against this job so far.
    pub async fn failures<D: ShardDriver>(&self, client: &Client<D>) -> SchwartzResult<i64> {
        client.handle_failures(self).await
    }

    /// The full, time-ordered log of Error messages for this job.
    pub async fn failure_log<D: ShardDriver>(&self, client: &Client<D>) -> SchwartzResult<Vec<String>> {
        client.handle_failure_log(self).await
    }

    /// The job's terminal ExitStatus, if one has been recorded and not yet
    /// swept.
    pub async fn exit_status<D: ShardDriver>(
        &self,
        client: &Client<D>,
    ) -> SchwartzResult<Option<i32>> {
        client.handle_exit_status(self).await
    }
}
