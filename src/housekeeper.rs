//! Periodic recovery of jobs stuck in `running`.
//!
//! The claim operation provides no liveness detection on its own: a worker
//! that crashes after claiming leaves its job `running` forever. This task
//! is the backstop, putting such jobs through the normal retry logic.

use crate::store::JobStore;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{error, info, trace};

/// Spawn the stale-job sweep as a background task.
///
/// Every `sweep_interval`, jobs that have been `running` longer than
/// `timeout` are recovered through the store's failure transition.
pub(crate) fn spawn<S: JobStore + 'static>(
    store: S,
    timeout: Duration,
    sweep_interval: Duration,
) -> AbortHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            match store.recover_stale_jobs(timeout).await {
                Ok(0) => trace!("No stale jobs found"),
                Ok(count) => info!(count, "Recovered stale jobs"),
                Err(error) => error!("Failed to recover stale jobs: {error}"),
            }
        }
    });

    task.abort_handle()
}
