use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use schwartz_testing::{ClosureWorker, FakeClock, InMemoryShardDriver};

use crate::client::{Client, InsertOptions};
use crate::config::{ClientConfig, FaultInjection, ShardConfig};
use crate::job::NewJob;

fn test_client(driver: Arc<InMemoryShardDriver>, clock: Arc<FakeClock>) -> Client<InMemoryShardDriver> {
    Client::new(
        vec![ShardConfig::new(driver)],
        ClientConfig::new().clock(clock),
    )
}

#[tokio::test]
async fn insert_and_work_round_trip() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);
    let client = test_client(driver.clone(), clock);

    let seen = Arc::new(AtomicU32::new(0));
    let seen2 = seen.clone();
    client.can(
        "add",
        ClosureWorker::new(60, move |job| {
            let seen = seen2.clone();
            Box::pin(async move {
                let numbers: Vec<i64> = serde_json::from_value(job.arg["numbers"].clone())?;
                seen.store(numbers.iter().sum::<i64>() as u32, Ordering::SeqCst);
                job.completed().await?;
                Ok(())
            })
        })
        .into_arc(),
    );

    let handle = client
        .insert("add", json!({"numbers": [2, 3, 4]}), InsertOptions::new())
        .await
        .unwrap();

    client.work_until_done().await;

    assert_eq!(seen.load(Ordering::SeqCst), 9);
    assert_eq!(driver.job_count(), 0);
    assert!(client.lookup_job(handle).await.unwrap().is_none());
}

#[tokio::test]
async fn uniqkey_collision_returns_existing_handle() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);
    let client = test_client(driver, clock);

    let opts = InsertOptions::new().uniqkey("nightly-report");
    let first = client.insert("report", json!({}), opts.clone()).await.unwrap();
    let second = client.insert("report", json!({}), opts).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn failed_job_retries_then_exhausts_with_backoff() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);
    let client = test_client(driver.clone(), clock.clone());

    client.can(
        "div",
        ClosureWorker::new(60, |job| {
            Box::pin(async move {
                let denom = job.arg["denom"].as_i64().unwrap_or(0);
                if denom == 0 {
                    anyhow::bail!("division by zero");
                }
                job.completed().await?;
                Ok(())
            })
        })
        .max_retries(1)
        .retry_delay(30)
        .into_arc(),
    );

    let handle = client
        .insert("div", json!({"denom": 0}), InsertOptions::new())
        .await
        .unwrap();

    // First attempt: fails, one retry remains, run_after pushed 30s out.
    assert!(client.work_once().await);
    let snapshot = client.lookup_job(handle).await.unwrap().expect("job retained for retry");
    assert_eq!(snapshot.run_after, 1_030);
    assert_eq!(handle.failures(&client).await.unwrap(), 1);

    // Not due yet: no eligible row.
    assert!(!client.work_once().await);

    clock.advance(30);

    // Second attempt: retries exhausted (max_retries=1, failures=2), removed.
    assert!(client.work_once().await);
    assert!(client.lookup_job(handle).await.unwrap().is_none());
    assert_eq!(driver.job_count(), 0);
}

#[tokio::test]
async fn replace_with_is_atomic_and_rolls_back_under_fault_injection() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);

    let client = Client::new(
        vec![ShardConfig::new(driver.clone())],
        ClientConfig::new()
            .clock(clock.clone())
            .fault_injection(FaultInjection::ReplaceWithRollbackAfterInsert),
    );

    client.can(
        "split",
        ClosureWorker::new(60, |job| {
            Box::pin(async move {
                job.replace_with(vec![
                    NewJob::new("split", json!({"half": 1})),
                    NewJob::new("split", json!({"half": 2})),
                ])
                .await?;
                Ok(())
            })
        })
        .into_arc(),
    );

    let handle = client
        .insert("split", json!({"whole": true}), InsertOptions::new())
        .await
        .unwrap();

    // work_once surfaces the replace_with error via the fault barrier, which
    // records it as a failure rather than panicking the worker.
    assert!(client.work_once().await);

    // Rollback means: the original row is untouched and no new rows exist.
    assert!(client.lookup_job(handle).await.unwrap().is_some());
    assert_eq!(driver.job_count(), 1);
}

#[tokio::test]
async fn replace_with_commits_all_inserts_and_removes_original() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);
    let client = test_client(driver.clone(), clock);

    client.can(
        "split",
        ClosureWorker::new(60, |job| {
            Box::pin(async move {
                job.replace_with(vec![
                    NewJob::new("split_half", json!({"half": 1})),
                    NewJob::new("split_half", json!({"half": 2})),
                ])
                .await?;
                Ok(())
            })
        })
        .into_arc(),
    );

    let handle = client
        .insert("split", json!({"whole": true}), InsertOptions::new())
        .await
        .unwrap();

    assert!(client.work_once().await);

    assert!(client.lookup_job(handle).await.unwrap().is_none());
    assert_eq!(driver.job_count(), 2);
    assert_eq!(client.list_jobs("split_half", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn two_workers_racing_a_grab_only_one_wins() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);
    let client = test_client(driver, clock);

    client.can(
        "noop",
        ClosureWorker::new(60, |job| {
            Box::pin(async move {
                job.completed().await?;
                Ok(())
            })
        })
        .into_arc(),
    );

    client
        .insert("noop", json!({}), InsertOptions::new())
        .await
        .unwrap();

    let a = client.clone();
    let b = client.clone();
    let (won_a, won_b) = tokio::join!(a.work_once(), b.work_once());

    assert_eq!([won_a, won_b].iter().filter(|&&w| w).count(), 1);
}

#[tokio::test]
async fn refresh_lease_fails_once_another_worker_has_reclaimed_the_job() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);
    let client = test_client(driver, clock.clone());

    client.can(
        "refresh",
        ClosureWorker::new(10, |_job| Box::pin(async move { Ok(()) })).into_arc(),
    );

    client
        .insert("refresh", json!({}), InsertOptions::new())
        .await
        .unwrap();

    let allowed = vec!["refresh".to_string()];
    let mut stale_holder = client.grab(&allowed).await.expect("first grab succeeds");

    // The lease (10s) expires; a second worker reclaims the same row under
    // a fresh lease.
    clock.advance(11);
    let new_holder = client.grab(&allowed).await.expect("second grab reclaims the expired lease");

    // The original holder's refresh is conditioned on the grabbed_until it
    // was issued, which the reclaim has since overwritten: it must not
    // silently clobber the new holder's lease.
    let err = stale_holder
        .refresh_lease(30)
        .await
        .expect_err("refresh must fail once the lease changed hands");
    assert!(matches!(err, crate::error::SchwartzError::LeaseLost { .. }));

    // The new holder's own lease is unaffected and can complete normally.
    let mut new_holder = new_holder;
    new_holder.completed().await.unwrap();
}

#[tokio::test]
async fn permanent_failure_never_retries() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);
    let client = test_client(driver.clone(), clock);

    client.can(
        "validate",
        ClosureWorker::new(60, |job| {
            Box::pin(async move {
                job.permanent_failure("unrecoverable input").await?;
                Ok(())
            })
        })
        .max_retries(5)
        .into_arc(),
    );

    client
        .insert("validate", json!({}), InsertOptions::new())
        .await
        .unwrap();

    assert!(client.work_once().await);
    assert_eq!(driver.job_count(), 0);
}

#[tokio::test]
async fn exit_status_is_recorded_when_descriptor_keeps_it() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);
    let client = test_client(driver, clock);

    client.can(
        "noop",
        ClosureWorker::new(60, |job| {
            Box::pin(async move {
                job.completed().await?;
                Ok(())
            })
        })
        .keep_exit_status_for(3600)
        .into_arc(),
    );

    let handle = client
        .insert("noop", json!({}), InsertOptions::new())
        .await
        .unwrap();
    client.work_until_done().await;

    assert_eq!(handle.exit_status(&client).await.unwrap(), Some(0));
}

#[tokio::test]
async fn arg_round_trips_through_varied_json_shapes() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);
    let client = test_client(driver, clock);

    for arg in [
        json!(null),
        json!(42),
        json!("plain string"),
        json!([1, 2, 3]),
        json!({"nested": {"a": [true, false, null]}}),
    ] {
        let handle = client
            .insert("echo", arg.clone(), InsertOptions::new())
            .await
            .unwrap();
        let snapshot = client.lookup_job(handle).await.unwrap().unwrap();
        assert_eq!(snapshot.arg, arg);
    }
}

#[tokio::test]
async fn coalesce_affinity_prefers_matching_key_until_a_full_pass_misses() {
    let driver = Arc::new(InMemoryShardDriver::new());
    let clock = FakeClock::new(1_000);
    let client = test_client(driver, clock);

    client.can(
        "batch",
        ClosureWorker::new(60, |job| {
            Box::pin(async move {
                job.completed().await?;
                Ok(())
            })
        })
        .into_arc(),
    );

    client
        .insert(
            "batch",
            json!({"n": 1}),
            InsertOptions::new().coalesce("tenant-a"),
        )
        .await
        .unwrap();
    client
        .insert(
            "batch",
            json!({"n": 2}),
            InsertOptions::new().coalesce("tenant-b"),
        )
        .await
        .unwrap();
    client
        .insert(
            "batch",
            json!({"n": 3}),
            InsertOptions::new().coalesce("tenant-a"),
        )
        .await
        .unwrap();

    let first = client.grab(&["batch".to_string()]).await.unwrap();
    assert_eq!(first.arg["n"], json!(1));
    drop(first); // dropping without a terminal call leaves the row leased, not removed

    let second = client.grab(&["batch".to_string()]).await;
    // Coalesce affinity now favors tenant-a; the remaining tenant-a row
    // (n=3) should be preferred over tenant-b's (n=2) even though n=2 was
    // inserted first.
    assert!(second.is_some());
    assert_eq!(second.unwrap().arg["n"], json!(3));
}
