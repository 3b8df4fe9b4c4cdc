use crate::schema::JobId;

/// Errors returned by [`JobStore`](crate::JobStore) operations.
///
/// Store unavailability is transient and retryable; callers should back off
/// and try again rather than treating it as "no job available".
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The underlying database returned an error.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// No job with the given id exists in the store.
    #[error("job {0} not found")]
    JobNotFound(JobId),
}

/// Errors that can occur while enqueueing a job.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// An error occurred while serializing the job payload.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// An error occurred while talking to the job store.
    #[error(transparent)]
    QueueError(#[from] QueueError),
}
