//! # Add/Div Worker
//!
//! Shows how to stand up a `schwartz-core` client against the in-memory
//! shard driver: no database, no adapters, just two abilities and a client.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use schwartz_core::{Client, ClientConfig, InsertOptions, Job, ShardConfig, WorkerDescriptor};
use schwartz_testing::InMemoryShardDriver;
use serde_json::json;

// ============================================================================
// Abilities
// ============================================================================

struct AddWorker;

#[async_trait]
impl WorkerDescriptor<InMemoryShardDriver> for AddWorker {
    fn grab_for(&self) -> i64 {
        30
    }

    async fn work(&self, job: &mut Job<InMemoryShardDriver>) -> Result<()> {
        let numbers: Vec<i64> = serde_json::from_value(job.arg["numbers"].clone())?;
        let sum: i64 = numbers.iter().sum();
        tracing::info!(sum, "add job finished");
        job.completed().await?;
        Ok(())
    }
}

struct DivWorker;

#[async_trait]
impl WorkerDescriptor<InMemoryShardDriver> for DivWorker {
    fn max_retries(&self, _job: &Job<InMemoryShardDriver>) -> u32 {
        2
    }

    fn retry_delay(&self, failures: u32) -> i64 {
        // doubling backoff: 5s, 10s, 20s, ...
        5 * (1i64 << failures.saturating_sub(1))
    }

    fn grab_for(&self) -> i64 {
        30
    }

    fn keep_exit_status_for(&self) -> i64 {
        3600
    }

    async fn work(&self, job: &mut Job<InMemoryShardDriver>) -> Result<()> {
        let numer = job.arg["numer"].as_i64().unwrap_or(0);
        let denom = job.arg["denom"].as_i64().unwrap_or(0);
        if denom == 0 {
            anyhow::bail!("division by zero: {numer}/{denom}");
        }
        tracing::info!(result = numer / denom, "div job finished");
        job.completed().await?;
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let driver = Arc::new(InMemoryShardDriver::new());
    let client: Client<InMemoryShardDriver> =
        Client::new(vec![ShardConfig::new(driver)], ClientConfig::new());

    client.can("add", Arc::new(AddWorker));
    client.can("div", Arc::new(DivWorker));

    client
        .insert("add", json!({"numbers": [2, 3, 4]}), InsertOptions::new())
        .await?;
    client
        .insert("div", json!({"numer": 10, "denom": 2}), InsertOptions::new())
        .await?;
    // This one will exhaust its two retries and end up with a recorded
    // ExitStatus, which we read back below.
    let doomed = client
        .insert("div", json!({"numer": 1, "denom": 0}), InsertOptions::new())
        .await?;

    client.work_until_done().await;

    // The doomed div-by-zero job retries with a real delay between
    // attempts (DivWorker::retry_delay), so draining it to its terminal
    // ExitStatus means waiting out each backoff window.
    while client.lookup_job(doomed).await?.is_some() {
        tokio::time::sleep(std::time::Duration::from_secs(11)).await;
        client.work_until_done().await;
    }

    if let Some(status) = doomed.exit_status(&client).await? {
        println!("doomed job's final exit status: {status}");
    }
    for message in doomed.failure_log(&client).await? {
        println!("doomed job failure: {message}");
    }

    Ok(())
}
