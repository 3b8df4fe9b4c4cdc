//! The store contract shared by all backends.
//!
//! All coordination between workers funnels through [`JobStore::claim_next_job`]:
//! the store is the only shared mutable state, and callers never see a
//! read-then-write window on it.

use crate::errors::QueueError;
use crate::schema::{Job, JobId, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

/// A durable store of jobs with an atomic claim operation.
///
/// Implementations must guarantee that under arbitrary concurrent
/// invocation, [`claim_next_job`](Self::claim_next_job) hands each pending
/// job to at most one caller. The Postgres backend relies on
/// `FOR UPDATE SKIP LOCKED`; the in-memory backend serializes claims
/// behind a single write lock.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job.
    ///
    /// Returns the id of the inserted job, or `None` if the job was
    /// deduplicated against an identical pending job.
    async fn enqueue(&self, job: NewJob) -> Result<Option<JobId>, QueueError>;

    /// Atomically claim the next eligible job.
    ///
    /// Considers jobs that are `pending`, have `scheduled_for <= now`, and
    /// whose type appears in `job_types`. The highest-priority job wins,
    /// ties broken by earliest creation. The claimed job is transitioned
    /// to `running` with `started_at = now` and returned.
    ///
    /// Returns `Ok(None)` when no job is eligible. Never blocks behind
    /// another caller's in-flight claim; errors only when the store itself
    /// is unavailable.
    async fn claim_next_job(
        &self,
        now: DateTime<Utc>,
        job_types: &[String],
    ) -> Result<Option<Job>, QueueError>;

    /// Record a successful outcome for a `running` job.
    ///
    /// Sets `status = completed`, stamps `completed_at` and stores
    /// `result`. Reporting on a job that is not `running` is a warning
    /// no-op, so duplicate reports cannot corrupt state.
    async fn report_success(&self, job_id: JobId, result: Value) -> Result<(), QueueError>;

    /// Record a failed attempt for a `running` job.
    ///
    /// Increments `retry_count`. While re-attempts remain the job returns
    /// to `pending` with `started_at` cleared and `scheduled_for` pushed
    /// out by the store's backoff policy; once retries are exhausted the
    /// job becomes terminally `failed`. The error message is recorded in
    /// both cases. Same idempotence rules as
    /// [`report_success`](Self::report_success).
    async fn report_failure(&self, job_id: JobId, error_message: &str)
        -> Result<(), QueueError>;

    /// Recover jobs stuck in `running` past `timeout`.
    ///
    /// Each job whose `started_at` is older than `now - timeout` is put
    /// through the same transition as
    /// [`report_failure`](Self::report_failure). Returns the number of
    /// jobs recovered.
    async fn recover_stale_jobs(&self, timeout: Duration) -> Result<u64, QueueError>;

    /// Fetch a job by id.
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;
}

/// Compute the instant at which a job requeued after its `retry_count`-th
/// failure becomes eligible again.
///
/// Exponential: `now + base * 2^retry_count`, so with the default one
/// minute base a job waits 2, 4, 8, … minutes between attempts.
pub(crate) fn backoff_until(
    now: DateTime<Utc>,
    base: Duration,
    retry_count: i32,
) -> DateTime<Utc> {
    let exp = u32::try_from(retry_count).unwrap_or(0).min(20);
    let delay = base.saturating_mul(2u32.saturating_pow(exp));
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Default backoff base applied between retries.
pub(crate) const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(60);
