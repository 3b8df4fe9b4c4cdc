//! Postgres-backed job store.
//!
//! Claiming relies on `FOR UPDATE SKIP LOCKED`: a candidate row already
//! locked by another in-flight claim is excluded from selection instead of
//! blocking the second claimant.

use crate::errors::QueueError;
use crate::schema::{Job, JobId, JobStatus, NewJob};
use crate::store::{backoff_until, JobStore, DEFAULT_RETRY_BACKOFF};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::warn;

/// Apply the database schema required by this crate.
///
/// Runs the bundled migrations. Safe to call on every startup.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// [`JobStore`] backed by a Postgres `sync_jobs` table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    retry_backoff: Duration,
}

impl PgStore {
    /// Create a store on top of an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Set the base delay for the exponential retry backoff.
    pub fn retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff = base;
        self
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Row state needed to decide between requeue and terminal failure.
#[derive(sqlx::FromRow)]
struct RetryState {
    status: JobStatus,
    retry_count: i32,
    max_retries: i32,
}

/// Lock a job row and return its retry state, or `None` if the id is unknown.
async fn lock_job_for_report(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
) -> Result<Option<RetryState>, sqlx::Error> {
    sqlx::query_as::<_, RetryState>(
        "SELECT status, retry_count, max_retries FROM sync_jobs WHERE id = $1 FOR UPDATE",
    )
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Apply the failure transition to a locked `running` job.
///
/// Requeues the job with backoff while re-attempts remain, otherwise marks
/// it terminally failed.
async fn fail_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
    state: &RetryState,
    error_message: &str,
    backoff_base: Duration,
) -> Result<(), sqlx::Error> {
    let retries = state.retry_count + 1;

    if retries > state.max_retries {
        sqlx::query(
            r"
            UPDATE sync_jobs
            SET status = 'failed',
                retry_count = $2,
                error_message = $3,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(retries)
        .bind(error_message)
        .execute(&mut **tx)
        .await?;
    } else {
        let eligible_at = backoff_until(Utc::now(), backoff_base, retries);
        sqlx::query(
            r"
            UPDATE sync_jobs
            SET status = 'pending',
                retry_count = $2,
                error_message = $3,
                started_at = NULL,
                scheduled_for = $4,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(retries)
        .bind(error_message)
        .bind(eligible_at)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl JobStore for PgStore {
    async fn enqueue(&self, job: NewJob) -> Result<Option<JobId>, QueueError> {
        let id = if job.deduplicate {
            // Insert only if no identical pending job exists (not locked)
            sqlx::query_scalar::<_, JobId>(
                r"
                INSERT INTO sync_jobs (job_type, options, priority, scheduled_for, max_retries)
                SELECT $1, $2, $3, COALESCE($4, NOW()), $5
                WHERE NOT EXISTS (
                    SELECT 1 FROM sync_jobs
                    WHERE job_type = $1 AND options = $2 AND priority = $3
                      AND status = 'pending'
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id
                ",
            )
            .bind(&job.job_type)
            .bind(&job.options)
            .bind(job.priority)
            .bind(job.scheduled_for)
            .bind(job.max_retries)
            .fetch_optional(&self.pool)
            .await?
        } else {
            let id = sqlx::query_scalar::<_, JobId>(
                r"
                INSERT INTO sync_jobs (job_type, options, priority, scheduled_for, max_retries)
                VALUES ($1, $2, $3, COALESCE($4, NOW()), $5)
                RETURNING id
                ",
            )
            .bind(&job.job_type)
            .bind(&job.options)
            .bind(job.priority)
            .bind(job.scheduled_for)
            .bind(job.max_retries)
            .fetch_one(&self.pool)
            .await?;
            Some(id)
        };

        Ok(id)
    }

    async fn claim_next_job(
        &self,
        now: DateTime<Utc>,
        job_types: &[String],
    ) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE sync_jobs
            SET status = 'running',
                started_at = $1,
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM sync_jobs
                WHERE status = 'pending'
                  AND scheduled_for <= $1
                  AND job_type = ANY($2)
                ORDER BY priority DESC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            ",
        )
        .bind(now)
        .bind(job_types)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn report_success(&self, job_id: JobId, result: Value) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;

        let state = lock_job_for_report(&mut tx, job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;

        if state.status != JobStatus::Running {
            warn!(job.id = %job_id, job.status = ?state.status, "Ignoring success report for job that is not running");
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            r"
            UPDATE sync_jobs
            SET status = 'completed',
                result = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(&result)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn report_failure(
        &self,
        job_id: JobId,
        error_message: &str,
    ) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;

        let state = lock_job_for_report(&mut tx, job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;

        if state.status != JobStatus::Running {
            warn!(job.id = %job_id, job.status = ?state.status, "Ignoring failure report for job that is not running");
            tx.rollback().await?;
            return Ok(());
        }

        fail_job(&mut tx, job_id, &state, error_message, self.retry_backoff).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn recover_stale_jobs(&self, timeout: Duration) -> Result<u64, QueueError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));

        let mut tx = self.pool.begin().await?;

        #[derive(sqlx::FromRow)]
        struct StaleJob {
            id: JobId,
            #[sqlx(flatten)]
            state: RetryState,
        }

        let stale = sqlx::query_as::<_, StaleJob>(
            r"
            SELECT id, status, retry_count, max_retries
            FROM sync_jobs
            WHERE status = 'running' AND started_at < $1
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let error_message = format!("worker timed out after {}s", timeout.as_secs());
        for job in &stale {
            fail_job(&mut tx, job.id, &job.state, &error_message, self.retry_backoff).await?;
        }

        tx.commit().await?;
        Ok(stale.len() as u64)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM sync_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }
}
