use crate::job_registry::JobRegistry;
use crate::schema::JobId;
use crate::store::JobStore;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info_span, trace, warn, Instrument};

pub(crate) struct Worker<Context, S> {
    pub(crate) store: S,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<Context, S> Worker<Context, S>
where
    Context: Clone + Send + Sync + 'static,
    S: JobStore,
{
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run background jobs forever, or until the queue is empty if `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending background worker jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!(
                        "No pending background worker jobs found. Polling again in {sleep_duration:?}…",
                    );
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Claim and run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if there was an error claiming the job or reporting its outcome
    async fn run_next_job(&self) -> anyhow::Result<Option<JobId>> {
        let context = self.context.clone();
        let job_registry = self.job_registry.clone();

        let job_types = job_registry.job_types();

        trace!("Looking for next background worker job…");

        let Some(job) = self.store.claim_next_job(Utc::now(), &job_types).await? else {
            return Ok(None);
        };

        let span = info_span!("job", job.id = %job.id, job.type = %job.job_type);

        let job_id = job.id;
        let job_type = job.job_type;
        let options = job.options;
        debug!("Running job…");

        let future = with_sentry_transaction(&job_type, || {
            let job_type = job_type.clone();
            async move {
                let run_task_fn = job_registry
                    .get(&job_type)
                    .ok_or_else(|| anyhow!("Unknown job type {job_type}"))?;

                AssertUnwindSafe(run_task_fn(context, options))
                    .catch_unwind()
                    .await
                    .map_err(|e| try_to_extract_panic_info(&*e))
                    // TODO: Replace with flatten() once that stabilizes
                    .and_then(std::convert::identity)
            }
        });

        let result = future
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        let _enter = span.enter();
        match result {
            Ok(result) => {
                debug!("Reporting successful job…");
                self.store.report_success(job_id, result).await?;
            }
            Err(error) => {
                warn!("Failed to run job: {error}");
                self.store
                    .report_failure(job_id, &format!("{error:#}"))
                    .await?;
            }
        }

        Ok(Some(job_id))
    }
}
