use crate::background_job::BackgroundJob;
use anyhow::anyhow;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

type RunTaskFn<Context> =
    dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// Maps job type names to type-erased run functions.
pub(crate) struct JobRegistry<Context> {
    job_types: HashMap<String, Arc<RunTaskFn<Context>>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            job_types: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            job_types: self.job_types.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    /// Register a job type for dispatch.
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        self.job_types
            .insert(J::JOB_NAME.to_string(), Arc::new(run_job::<J>));
    }

    /// Look up the run function for a job type.
    pub(crate) fn get(&self, job_type: &str) -> Option<&Arc<RunTaskFn<Context>>> {
        self.job_types.get(job_type)
    }

    /// Names of all registered job types.
    pub(crate) fn job_types(&self) -> Vec<String> {
        self.job_types.keys().cloned().collect()
    }
}

fn run_job<J: BackgroundJob>(
    context: J::Context,
    options: Value,
) -> BoxFuture<'static, anyhow::Result<Value>> {
    Box::pin(async move {
        let job: J = serde_json::from_value(options)
            .map_err(|err| anyhow!("Failed to deserialize job payload: {err}"))?;
        job.run(context).await
    })
}
