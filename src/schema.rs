//! Database schema definitions for SQLx.
//!
//! This module contains the job record types shared by all store backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Unique identifier of a job.
pub type JobId = i64;

/// Default number of re-attempts for new jobs.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Lifecycle state of a job.
///
/// Jobs move `pending → running → {completed | failed}`; a failed attempt
/// with retries remaining moves the job back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed once `scheduled_for` has passed.
    Pending,
    /// Claimed by a worker and currently executing.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Exhausted its retries. Terminal.
    Failed,
}

impl JobStatus {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Represents a job record in the store.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job.
    pub id: JobId,
    /// Type identifier for the job (used for dispatch).
    pub job_type: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// JSON payload needed to execute the job.
    pub options: Value,
    /// Priority of the job (higher = more important).
    pub priority: i16,
    /// Earliest instant at which the job may be claimed.
    pub scheduled_for: DateTime<Utc>,
    /// When the current (or last) attempt was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// JSON outcome recorded on success.
    pub result: Option<Value>,
    /// Human-readable description of the last failure.
    pub error_message: Option<String>,
    /// Number of failed attempts so far.
    pub retry_count: i32,
    /// Number of re-attempts allowed after the first failure.
    pub max_retries: i32,
    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last mutation.
    pub updated_at: DateTime<Utc>,
}

/// Description of a job to be inserted into the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Type identifier for the job.
    pub job_type: String,
    /// JSON payload needed to execute the job.
    pub options: Value,
    /// Priority of the job (higher = more important).
    pub priority: i16,
    /// Earliest instant at which the job may be claimed. `None` means
    /// immediately.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Number of re-attempts allowed after the first failure.
    pub max_retries: i32,
    /// If set, the insert is skipped when an identical pending job
    /// (same type, options and priority) already exists.
    pub deduplicate: bool,
}

impl NewJob {
    /// Create a new job description with default priority, retries and
    /// immediate scheduling.
    pub fn new(job_type: impl Into<String>, options: Value) -> Self {
        Self {
            job_type: job_type.into(),
            options,
            priority: 0,
            scheduled_for: None,
            max_retries: DEFAULT_MAX_RETRIES,
            deduplicate: false,
        }
    }

    /// Set the job priority.
    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    /// Delay the job until the given instant.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Set the number of allowed re-attempts.
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Skip the insert if an identical pending job already exists.
    pub fn deduplicate(mut self) -> Self {
        self.deduplicate = true;
        self
    }
}
