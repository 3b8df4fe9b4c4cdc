use crate::background_job::{BackgroundJob, DEFAULT_QUEUE};
use crate::housekeeper;
use crate::job_registry::JobRegistry;
use crate::store::JobStore;
use crate::worker::Worker;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, info_span, warn, Instrument};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for claiming and running jobs
pub struct Runner<Context: Clone + Send + Sync + 'static, S, State = Unconfigured> {
    store: S,
    queues: HashMap<String, Queue<Context>>,
    context: Context,
    shutdown_when_queue_empty: bool,
    stale_job_timeout: Option<Duration>,
    stale_sweep_interval: Duration,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, S, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, S, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("context", &self.context)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .field("stale_job_timeout", &self.stale_job_timeout)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static, S> Runner<Context, S> {
    /// Create a new runner with the given job store and context.
    pub fn new(store: S, context: Context) -> Self {
        Self {
            store,
            queues: HashMap::new(),
            context,
            shutdown_when_queue_empty: false,
            stale_job_timeout: None,
            stale_sweep_interval: DEFAULT_STALE_SWEEP_INTERVAL,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, S, State> Runner<Context, S, State> {
    /// Configure a queue
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context>,
    ) -> Self {
        let queue = self.queues.remove(queue_name).unwrap_or_default();
        self.queues.insert(queue_name.into(), config_fn(queue));
        self
    }

    /// Configure the default queue
    pub fn configure_default_queue(
        self,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context>,
    ) -> Self {
        self.configure_queue(DEFAULT_QUEUE, config_fn)
    }

    /// Register a job type with the queue named by its `QUEUE` constant.
    pub fn register_job_type<J: BackgroundJob<Context = Context>>(
        mut self,
    ) -> Runner<Context, S, Configured> {
        self.queues
            .entry(J::QUEUE.to_string())
            .or_default()
            .job_registry
            .register::<J>();

        Runner {
            store: self.store,
            queues: self.queues,
            context: self.context,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            stale_job_timeout: self.stale_job_timeout,
            stale_sweep_interval: self.stale_sweep_interval,
            _state: PhantomData,
        }
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Recover jobs stuck in `running` longer than `timeout`.
    ///
    /// Enables the periodic stale-job sweep. Recovered jobs go through the
    /// normal retry logic.
    pub fn recover_stale_jobs_after(mut self, timeout: Duration) -> Self {
        self.stale_job_timeout = Some(timeout);
        self
    }

    /// Set how often the stale-job sweep runs.
    pub fn stale_sweep_interval(mut self, interval: Duration) -> Self {
        self.stale_sweep_interval = interval;
        self
    }
}

impl<Context, S> Runner<Context, S, Configured>
where
    Context: Clone + Send + Sync + 'static,
    S: JobStore + Clone + 'static,
{
    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the workers to shutdown.
    pub fn start(&self) -> RunHandle {
        let mut handles = Vec::new();
        for (queue_name, queue) in &self.queues {
            for i in 1..=queue.num_workers {
                let name = format!("background-worker-{queue_name}-{i}");
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    store: self.store.clone(),
                    context: self.context.clone(),
                    job_registry: Arc::new(queue.job_registry.clone()),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: queue.poll_interval,
                    jitter: queue.jitter,
                };

                let span = info_span!("worker", worker.name = %name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                handles.push(handle);
            }
        }

        let housekeeper = self.stale_job_timeout.map(|timeout| {
            housekeeper::spawn(self.store.clone(), timeout, self.stale_sweep_interval)
        });

        RunHandle {
            handles,
            housekeeper,
        }
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    housekeeper: Option<AbortHandle>,
}

impl RunHandle {
    /// Wait for all background workers to shut down.
    ///
    /// The stale-job sweep, if enabled, is stopped once the workers are
    /// gone.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });

        if let Some(housekeeper) = self.housekeeper {
            housekeeper.abort();
        }
    }
}

/// Configuration and state for a job queue
#[derive(Debug)]
pub struct Queue<Context: Clone + Send + Sync + 'static> {
    pub(crate) job_registry: JobRegistry<Context>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Default for Queue<Context> {
    fn default() -> Self {
        Self {
            job_registry: JobRegistry::default(),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> Queue<Context> {
    /// Set the number of worker tasks for this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }
}
