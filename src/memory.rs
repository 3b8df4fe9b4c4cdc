//! In-memory job store.
//!
//! The write lock on the job map serializes all claims, which makes the
//! single-claim guarantee trivial: no two callers can examine the same
//! candidate concurrently. Useful for tests and for embedding the runner
//! without a database.

use crate::errors::QueueError;
use crate::schema::{Job, JobId, JobStatus, NewJob};
use crate::store::{backoff_until, JobStore, DEFAULT_RETRY_BACKOFF};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    next_id: JobId,
}

/// [`JobStore`] backed by a shared in-memory map.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    retry_backoff: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Set the base delay for the exponential retry backoff.
    pub fn retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff = base;
        self
    }
}

/// Failure transition shared by explicit reports and stale recovery.
fn fail_job(job: &mut Job, error_message: &str, now: DateTime<Utc>, backoff_base: Duration) {
    job.retry_count += 1;
    job.error_message = Some(error_message.to_string());
    job.updated_at = now;

    if job.retry_count > job.max_retries {
        job.status = JobStatus::Failed;
        job.completed_at = Some(now);
    } else {
        job.status = JobStatus::Pending;
        job.started_at = None;
        job.scheduled_for = backoff_until(now, backoff_base, job.retry_count);
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<Option<JobId>, QueueError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        if job.deduplicate {
            let duplicate = inner.jobs.values().any(|existing| {
                existing.status == JobStatus::Pending
                    && existing.job_type == job.job_type
                    && existing.options == job.options
                    && existing.priority == job.priority
            });
            if duplicate {
                return Ok(None);
            }
        }

        inner.next_id += 1;
        let id = inner.next_id;

        inner.jobs.insert(
            id,
            Job {
                id,
                job_type: job.job_type,
                status: JobStatus::Pending,
                options: job.options,
                priority: job.priority,
                scheduled_for: job.scheduled_for.unwrap_or(now),
                started_at: None,
                completed_at: None,
                result: None,
                error_message: None,
                retry_count: 0,
                max_retries: job.max_retries,
                created_at: now,
                updated_at: now,
            },
        );

        Ok(Some(id))
    }

    async fn claim_next_job(
        &self,
        now: DateTime<Utc>,
        job_types: &[String],
    ) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner.write().await;

        let candidate = inner
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Pending
                    && job.scheduled_for <= now
                    && job_types.contains(&job.job_type)
            })
            .min_by_key(|job| (Reverse(job.priority), job.created_at, job.id))
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(QueueError::JobNotFound(id))?;
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;

        Ok(Some(job.clone()))
    }

    async fn report_success(&self, job_id: JobId, result: Value) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;

        if job.status != JobStatus::Running {
            warn!(job.id = %job_id, job.status = ?job.status, "Ignoring success report for job that is not running");
            return Ok(());
        }

        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.completed_at = Some(now);
        job.updated_at = now;

        Ok(())
    }

    async fn report_failure(
        &self,
        job_id: JobId,
        error_message: &str,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;

        if job.status != JobStatus::Running {
            warn!(job.id = %job_id, job.status = ?job.status, "Ignoring failure report for job that is not running");
            return Ok(());
        }

        fail_job(job, error_message, Utc::now(), self.retry_backoff);

        Ok(())
    }

    async fn recover_stale_jobs(&self, timeout: Duration) -> Result<u64, QueueError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let cutoff =
            now - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));

        let stale: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Running
                    && job.started_at.is_some_and(|started| started < cutoff)
            })
            .map(|job| job.id)
            .collect();

        let error_message = format!("worker timed out after {}s", timeout.as_secs());
        for id in &stale {
            if let Some(job) = inner.jobs.get_mut(id) {
                fail_job(job, &error_message, now, self.retry_backoff);
            }
        }

        Ok(stale.len() as u64)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(&job_id).cloned())
    }
}
