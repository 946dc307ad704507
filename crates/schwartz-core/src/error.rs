//! Error taxonomy for the job queue.
//!
//! Every variant carries a stable discriminant (its variant name) and a
//! free-form message. [`ErrorCategory`] groups variants so callers can match
//! on a small, stable surface without enumerating every variant.

use std::fmt;

/// Errors raised by the core job queue engine.
#[derive(Debug, thiserror::Error)]
pub enum SchwartzError {
    /// All configured shards are unhealthy.
    #[error("no shard available")]
    NoShardAvailable,

    /// A unique-key collision on `(funcid, uniqkey)`, or any other
    /// constraint violation surfaced by a shard driver.
    #[error("constraint violated: {0}")]
    ConstraintViolated(String),

    /// The `arg` blob could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// A mid-work conditional update observed `rows_affected = 0`: the
    /// lease was lost to another worker or expired before this update ran.
    #[error("lease lost for job {jobid} on shard {shard_id}")]
    LeaseLost { shard_id: String, jobid: i64 },

    /// The user's `work` handler raised; `work_safely` converts this into a
    /// call to `Job::failed` and never propagates it further.
    #[error("worker raised: {0}")]
    WorkerRaised(String),

    /// Transient I/O failure talking to a shard. Triggers shard backoff.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A shard operation exceeded its deadline. Triggers shard backoff.
    #[error("timeout: {0}")]
    Timeout(String),

    /// No worker descriptor is registered for a funcname encountered during
    /// grab or lookup.
    #[error("no ability registered for function {0:?}")]
    UnknownFunction(String),
}

/// Stable category for [`SchwartzError`], independent of the exact variant.
///
/// Most callers only need to know whether to retry, surface to a user, or
/// treat a shard as unhealthy, not which exact variant fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caused by the caller (bad input, unknown function); retrying with
    /// the same arguments will not help.
    Caller,
    /// Transient infrastructure failure; safe to retry, and should count
    /// against shard health.
    Transient,
    /// The work loop already turned this into job state; nothing further
    /// to do.
    Absorbed,
}

impl SchwartzError {
    /// Categorize this error for shard-health and retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SchwartzError::ConnectionLost(_) | SchwartzError::Timeout(_) => {
                ErrorCategory::Transient
            }
            SchwartzError::WorkerRaised(_) | SchwartzError::LeaseLost { .. } => {
                ErrorCategory::Absorbed
            }
            SchwartzError::NoShardAvailable
            | SchwartzError::ConstraintViolated(_)
            | SchwartzError::SerializationFailed(_)
            | SchwartzError::UnknownFunction(_) => ErrorCategory::Caller,
        }
    }

    /// True when the driver's error represents a uniqkey-style constraint
    /// collision rather than a structural problem.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, SchwartzError::ConstraintViolated(_))
    }

    /// True when this error should mark the originating shard unhealthy.
    pub fn marks_shard_unhealthy(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Caller => "caller",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Absorbed => "absorbed",
        };
        f.write_str(s)
    }
}

pub type SchwartzResult<T> = Result<T, SchwartzError>;
