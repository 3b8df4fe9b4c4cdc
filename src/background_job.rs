use crate::errors::EnqueueError;
use crate::schema::{JobId, NewJob, DEFAULT_MAX_RETRIES};
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use tracing::instrument;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Trait for defining background jobs that can be enqueued and executed
/// asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Default priority of the task. Higher values are serviced first.
    const PRIORITY: i16 = 0;

    /// Whether the job should be deduplicated.
    ///
    /// If true, the job will not be enqueued if there is already a pending
    /// job with the same data.
    const DEDUPLICATED: bool = false;

    /// Number of re-attempts allowed after the first failure.
    const MAX_RETRIES: i32 = DEFAULT_MAX_RETRIES;

    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    ///
    /// The returned value is stored as the job's `result` on success.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<Value>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns the job ID if successfully enqueued, or `None` if
    /// deduplicated.
    #[instrument(name = "sync_queue.enqueue", skip(self, store), fields(message = Self::JOB_NAME))]
    fn enqueue<'a, S: JobStore>(
        &'a self,
        store: &'a S,
    ) -> BoxFuture<'a, Result<Option<JobId>, EnqueueError>> {
        enqueue_job(self, store, None)
    }

    /// Enqueue this job to run no earlier than the given instant.
    #[instrument(name = "sync_queue.enqueue_at", skip(self, store), fields(message = Self::JOB_NAME))]
    fn enqueue_at<'a, S: JobStore>(
        &'a self,
        store: &'a S,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<JobId>, EnqueueError>> {
        enqueue_job(self, store, Some(at))
    }
}

fn enqueue_job<'a, J: BackgroundJob, S: JobStore>(
    job: &'a J,
    store: &'a S,
    scheduled_for: Option<DateTime<Utc>>,
) -> BoxFuture<'a, Result<Option<JobId>, EnqueueError>> {
    let options = match serde_json::to_value(job) {
        Ok(options) => options,
        Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
    };

    let new_job = NewJob {
        job_type: J::JOB_NAME.to_string(),
        options,
        priority: J::PRIORITY,
        scheduled_for,
        max_retries: J::MAX_RETRIES,
        deduplicate: J::DEDUPLICATED,
    };

    async move { Ok(store.enqueue(new_job).await?) }.boxed()
}
