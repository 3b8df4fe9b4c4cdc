#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::Utc;
use claims::{assert_none, assert_some};
use insta::assert_compact_json_snapshot;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync_queue::{BackgroundJob, JobId, JobStatus, JobStore, MemoryStore, Runner};
use tokio::sync::Barrier;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Create a test runner with common configuration
    pub(super) fn create_test_runner<Context: Clone + Send + Sync + 'static>(
        store: MemoryStore,
        context: Context,
    ) -> Runner<Context, MemoryStore> {
        Runner::new(store, context)
            .configure_default_queue(|queue| queue.num_workers(2))
            .shutdown_when_queue_empty()
    }
}

async fn all_jobs(store: &MemoryStore, ids: &[JobId]) -> anyhow::Result<Vec<(String, Value)>> {
    let mut jobs = Vec::new();
    for id in ids {
        let job = store.get_job(*id).await?.expect("job should exist");
        jobs.push((job.job_type, job.options));
    }
    Ok(jobs)
}

#[tokio::test(flavor = "multi_thread")]
async fn jobs_are_claimed_exclusively_while_running() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<Value> {
            ctx.job_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok(Value::Null)
        }
    }

    let store = MemoryStore::new();

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let runner = test_utils::create_test_runner(store.clone(), test_context.clone())
        .register_job_type::<TestJob>();

    let job_id = assert_some!(TestJob.enqueue(&store).await?);

    let job = assert_some!(store.get_job(job_id).await?);
    assert_eq!(job.status, JobStatus::Pending);
    assert_none!(job.started_at);

    let runner = runner.start();
    test_context.job_started_barrier.wait().await;

    // while one worker holds the job, it is invisible to every other claim
    let job = assert_some!(store.get_job(job_id).await?);
    assert_eq!(job.status, JobStatus::Running);
    assert_some!(job.started_at);
    assert_none!(
        store
            .claim_next_job(Utc::now(), &["test".to_string()])
            .await?
    );

    test_context.assertions_finished_barrier.wait().await;
    runner.wait_for_shutdown().await;

    let job = assert_some!(store.get_job(job_id).await?);
    assert_eq!(job.status, JobStatus::Completed);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn jobs_are_completed_when_successfully_run() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<Value> {
            Ok(json!({ "ok": true }))
        }
    }

    let store = MemoryStore::new();

    let runner = test_utils::create_test_runner(store.clone(), ()).register_job_type::<TestJob>();

    let job_id = assert_some!(TestJob.enqueue(&store).await?);

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    let job = assert_some!(store.get_job(job_id).await?);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({ "ok": true })));
    assert_some!(job.completed_at);
    assert_eq!(job.retry_count, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_in_jobs_updates_retry_counter() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<Value> {
            panic!("this job always fails")
        }
    }

    let store = MemoryStore::new();

    let runner = test_utils::create_test_runner(store.clone(), ()).register_job_type::<TestJob>();

    let job_id = assert_some!(TestJob.enqueue(&store).await?);

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    // the default backoff pushes the retry past the shutdown, so the job
    // is left pending with one recorded attempt
    let job = assert_some!(store.get_job(job_id).await?);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert_none!(job.started_at);
    assert!(job.error_message.unwrap().contains("panicked"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn jobs_with_exhausted_retries_are_marked_failed() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        const MAX_RETRIES: i32 = 0;
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<Value> {
            Err(anyhow::anyhow!("upstream is gone"))
        }
    }

    let store = MemoryStore::new();

    let runner = test_utils::create_test_runner(store.clone(), ()).register_job_type::<TestJob>();

    let job_id = assert_some!(TestJob.enqueue(&store).await?);

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    let job = assert_some!(store.get_job(job_id).await?);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert_some!(job.completed_at);
    assert!(job.error_message.unwrap().contains("upstream is gone"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn jobs_can_be_deduplicated() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        runs: Arc<AtomicU8>,
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob {
        value: String,
    }

    impl TestJob {
        fn new(value: impl Into<String>) -> Self {
            let value = value.into();
            Self { value }
        }
    }

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        const DEDUPLICATED: bool = true;
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<Value> {
            let runs = ctx.runs.fetch_add(1, Ordering::SeqCst);
            if runs == 0 {
                ctx.job_started_barrier.wait().await;
                ctx.assertions_finished_barrier.wait().await;
            }
            Ok(Value::Null)
        }
    }

    let store = MemoryStore::new();

    let test_context = TestContext {
        runs: Arc::new(AtomicU8::new(0)),
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let runner = Runner::new(store.clone(), test_context.clone())
        .register_job_type::<TestJob>()
        .shutdown_when_queue_empty();

    let mut ids = Vec::new();

    // Enqueue first job
    ids.push(assert_some!(TestJob::new("foo").enqueue(&store).await?));
    assert_compact_json_snapshot!(all_jobs(&store, &ids).await?, @r#"[["test", {"value": "foo"}]]"#);

    // Try to enqueue the same job again, which should be deduplicated
    assert_none!(TestJob::new("foo").enqueue(&store).await?);
    assert_compact_json_snapshot!(all_jobs(&store, &ids).await?, @r#"[["test", {"value": "foo"}]]"#);

    // Start processing the first job
    let runner = runner.start();
    test_context.job_started_barrier.wait().await;

    // Enqueue the same job again, which should NOT be deduplicated,
    // since the first job is still running
    ids.push(assert_some!(TestJob::new("foo").enqueue(&store).await?));
    assert_compact_json_snapshot!(all_jobs(&store, &ids).await?, @r#"[["test", {"value": "foo"}], ["test", {"value": "foo"}]]"#);

    // Try to enqueue the same job again, which should be deduplicated again
    assert_none!(TestJob::new("foo").enqueue(&store).await?);
    assert_compact_json_snapshot!(all_jobs(&store, &ids).await?, @r#"[["test", {"value": "foo"}], ["test", {"value": "foo"}]]"#);

    // Enqueue the same job but with different data, which should
    // NOT be deduplicated
    ids.push(assert_some!(TestJob::new("bar").enqueue(&store).await?));
    assert_compact_json_snapshot!(all_jobs(&store, &ids).await?, @r#"[["test", {"value": "foo"}], ["test", {"value": "foo"}], ["test", {"value": "bar"}]]"#);

    // Resolve the final barrier to finish the test
    test_context.assertions_finished_barrier.wait().await;
    runner.wait_for_shutdown().await;

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_jobs_are_recovered_and_rerun() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<Value> {
            Ok(json!({ "recovered": true }))
        }
    }

    let store = MemoryStore::new().retry_backoff(Duration::ZERO);

    // a worker claimed this job ten minutes ago and never reported back
    let job_id = assert_some!(
        TestJob
            .enqueue_at(&store, Utc::now() - chrono::Duration::minutes(20))
            .await?
    );
    assert_some!(
        store
            .claim_next_job(
                Utc::now() - chrono::Duration::minutes(10),
                &["test".to_string()]
            )
            .await?
    );

    let runner = Runner::new(store.clone(), ())
        .configure_default_queue(|queue| queue.poll_interval(Duration::from_millis(10)))
        .register_job_type::<TestJob>()
        .recover_stale_jobs_after(Duration::from_secs(300))
        .stale_sweep_interval(Duration::from_millis(10));

    let handle = runner.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = assert_some!(store.get_job(job_id).await?);
        if job.status == JobStatus::Completed {
            assert_eq!(job.retry_count, 1);
            assert_eq!(job.result, Some(json!({ "recovered": true })));
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stale job was not recovered and rerun in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    drop(handle);
    Ok(())
}
