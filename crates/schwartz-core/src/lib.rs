//! # schwartz-core
//!
//! A reliable, database-backed job queue: producers insert work items
//! addressed by a symbolic function name; workers across one or more
//! processes atomically grab items due for execution, run them, and report
//! completion, transient failure (with bounded retry and backoff), or
//! permanent failure.
//!
//! Persistence is provided by one or more independent relational databases
//! ("shards") that the [`Client`] multiplexes over. This crate is
//! storage-agnostic: it depends only on the [`ShardDriver`] trait. See
//! `schwartz-postgres` for a production PostgreSQL implementation, and
//! `schwartz-testing` for an in-memory one suited to unit tests.
//!
//! ## Core concepts
//!
//! - A [`Job`] is leased from a shard by [`Client::grab`] and must end its
//!   life by calling exactly one of `completed`, `failed`,
//!   `permanent_failure`, or `replace_with`.
//! - A [`WorkerDescriptor`] is the behavior contract for one function name:
//!   retry policy, lease duration, and the `work` function itself.
//! - The [`AbilityRegistry`] maps funcnames to descriptors.
//! - [`JobHandle`] is a cheap, serializable `(shard_id, jobid)` pair used
//!   for out-of-band status queries (`failures`, `failure_log`,
//!   `exit_status`) without holding a reference back to the `Client`.
//!
//! ## What this crate is not
//!
//! It does not provide a SQL dialect, a command-line admin tool, or a
//! logging sink: those are external collaborators. Structured events are
//! emitted through `tracing`; bring your own subscriber.
//!
//! ## Example
//!
//! ```ignore
//! use schwartz_core::{Client, ClientConfig, InsertOptions, NewJob, ShardConfig};
//! use schwartz_testing::InMemoryShardDriver;
//! use std::sync::Arc;
//!
//! let driver = Arc::new(InMemoryShardDriver::new());
//! let client = Client::new(vec![ShardConfig::new(driver)], ClientConfig::new());
//!
//! client.can("add", Arc::new(AddWorker));
//! client.insert("add", serde_json::json!({"numbers": [1, 2]}), InsertOptions::new()).await?;
//! client.work_until_done().await;
//! ```

mod ability;
mod client;
mod clock;
mod config;
mod driver;
mod error;
mod handle;
mod job;
mod shard;

#[cfg(test)]
mod tests;

pub use ability::{AbilityRegistry, WorkerDescriptor};
pub use client::{Client, InsertOptions, JobSnapshot};
pub use clock::{system_clock, Clock, SystemClock};
pub use config::{ClientConfig, FaultInjection, ShardConfig};
pub use driver::{
    decode_arg, encode_arg, ErrorRow, ExitStatusRow, GrabUpdate, JobOrder, JobQuery, JobRow,
    ShardDriver,
};
pub use error::{ErrorCategory, SchwartzError, SchwartzResult};
pub use handle::JobHandle;
pub use job::{Job, NewJob};
