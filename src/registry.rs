//! Registry mapping persisted `job_name`s back to their job definitions.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::errors::Error;
use crate::execution::Execution;
use crate::job::{Job, run_catching};
use crate::validation;

type RunTaskFn<Context> =
    dyn Fn(Context, Execution, Value) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync;

type CheckParamsFn = dyn Fn(&Value) -> Result<(), Error> + Send + Sync;

/// Type-erased dispatch entry for one job definition.
pub(crate) struct RegisteredJob<Context> {
    run: Arc<RunTaskFn<Context>>,
    check_params: Arc<CheckParamsFn>,
}

impl<Context> Clone for RegisteredJob<Context> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
            check_params: self.check_params.clone(),
        }
    }
}

impl<Context> RegisteredJob<Context> {
    /// Validate raw params, run the job body, and validate the result.
    /// Returned errors cover validation, execution, and caught panics.
    pub(crate) fn run(
        &self,
        context: Context,
        exec: Execution,
        params: Value,
    ) -> BoxFuture<'static, Result<Value, Error>> {
        (self.run)(context, exec, params)
    }
}

/// Maps job names to their registered definitions for worker-side dispatch.
pub struct JobRegistry<Context> {
    jobs: HashMap<&'static str, RegisteredJob<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job definition under its `JOB_NAME`. Chainable.
    ///
    /// Registering the same name twice replaces the earlier entry.
    pub fn register<J: Job<Context = Context>>(mut self) -> Self {
        let run: Arc<RunTaskFn<Context>> =
            Arc::new(|context: Context, exec: Execution, params: Value| {
                async move {
                    let job = validation::parse_params::<J>(params)?;
                    let output = run_catching(&job, context, &exec).await?;
                    validation::result_value::<J>(&output)
                }
                .boxed()
            });
        let check_params: Arc<CheckParamsFn> =
            Arc::new(|params: &Value| validation::check_params::<J>(params));

        let entry = RegisteredJob { run, check_params };
        if self.jobs.insert(J::JOB_NAME, entry).is_some() {
            warn!(job = J::JOB_NAME, "job registered twice; replacing earlier registration");
        }
        self
    }

    /// Names of all registered jobs.
    pub fn job_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.jobs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Validate raw params against the job registered under `job_name`,
    /// without running anything. Used by the cron scheduler before
    /// enqueueing stored default params.
    pub fn check_params(&self, job_name: &str, params: &Value) -> Result<(), Error> {
        let entry = self
            .jobs
            .get(job_name)
            .ok_or_else(|| Error::UnknownJobType(job_name.to_owned()))?;
        (entry.check_params)(params)
    }

    pub(crate) fn get(&self, job_name: &str) -> Option<&RegisteredJob<Context>> {
        self.jobs.get(job_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Double {
        value: i64,
    }

    impl Job for Double {
        const JOB_NAME: &'static str = "double";
        type Context = ();
        type Output = i64;

        async fn run(&self, _ctx: (), _exec: &Execution) -> anyhow::Result<i64> {
            Ok(self.value * 2)
        }
    }

    #[test]
    fn registration_is_chainable_and_named() {
        let registry = JobRegistry::<()>::new().register::<Double>();
        assert_eq!(registry.job_names(), vec!["double"]);
    }

    #[test]
    fn check_params_validates_against_the_registered_job() {
        let registry = JobRegistry::<()>::new().register::<Double>();
        assert_ok!(registry.check_params("double", &json!({"value": 4})));
        assert_err!(registry.check_params("double", &json!({"value": "four"})));
        assert_err!(registry.check_params("missing", &json!({})));
    }

    #[tokio::test]
    async fn dispatch_runs_the_typed_job() {
        let registry = JobRegistry::<()>::new().register::<Double>();
        let entry = registry.get("double").unwrap();
        let exec = Execution::detached("double");
        let result = entry.run((), exec, json!({"value": 21})).await.unwrap();
        assert_eq!(result, json!(42));
    }
}
