#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod errors;
mod housekeeper;
mod job_registry;
mod memory;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod store;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{BackgroundJob, DEFAULT_QUEUE};
/// Error types for queue operations.
pub use self::errors::{EnqueueError, QueueError};
/// In-memory store backend.
pub use self::memory::MemoryStore;
/// The main runner that orchestrates job processing.
pub use self::runner::{Configured, Queue, RunHandle, Runner, Unconfigured};
/// Commonly used schema types.
pub use self::schema::{Job, JobId, JobStatus, NewJob, DEFAULT_MAX_RETRIES};
/// Postgres store backend and schema setup.
pub use self::storage::{setup_database, PgStore};
/// The store contract implemented by all backends.
pub use self::store::JobStore;
