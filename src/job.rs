//! The unit-of-work abstraction and its execution entry points.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

use crate::errors::Error;
use crate::execution::Execution;
use crate::schema::{DEFAULT_MAX_ATTEMPTS, JobRecord, JobStatus};
use crate::storage::JobStore;
use crate::util::panic_message;
use crate::validation;

/// Default worker lock window for claimed executions.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(300);

/// Default chunk size for [`Job::batch`].
pub const DEFAULT_BATCH_CONCURRENCY: usize = 3;

/// Options for [`Job::now`].
#[derive(Debug, Clone, Copy)]
pub struct NowOptions {
    /// Whether to record the execution in the job store. When false the job
    /// runs with no database interaction at all and progress updates are
    /// no-ops.
    pub persist: bool,
}

impl Default for NowOptions {
    fn default() -> Self {
        Self { persist: true }
    }
}

/// Options for [`Job::later_with`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Earliest time the record becomes eligible for claiming.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Tracing/grouping key stored on the record.
    pub correlation_id: Option<String>,
    /// Override the job definition's attempt cap.
    pub max_attempts: Option<i32>,
}

/// Options for [`Job::batch`].
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Chunk size: jobs within a chunk run concurrently, chunks run
    /// sequentially. Must be positive.
    pub concurrency: usize,
    /// Abort on the first failure instead of collecting survivors.
    pub stop_on_error: bool,
    /// Passed through to each item's [`Job::now`] call.
    pub persist: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_BATCH_CONCURRENCY,
            stop_on_error: false,
            persist: true,
        }
    }
}

/// Execution metadata returned alongside a job's typed output.
#[derive(Debug, Clone)]
pub struct JobMetadata {
    /// Id of the persisted record, if the execution was persisted.
    pub job_id: Option<String>,
    /// Final status (always `Completed` on the success path; failures are
    /// returned as errors).
    pub status: JobStatus,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

/// A successful execution: the schema-validated output plus metadata.
#[derive(Debug)]
pub struct JobOutcome<T> {
    /// The job's typed output.
    pub data: T,
    /// Execution metadata.
    pub metadata: JobMetadata,
}

/// A background job definition.
///
/// The implementing struct is the params schema: it is serialized before
/// first persistence and re-validated after every load. `Output` is the
/// result schema, validated before persistence. The `run` body contains the
/// actual work and may report progress through the [`Execution`] context.
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the job.
    ///
    /// This MUST be unique for the whole application; persisted records are
    /// dispatched back to their definition by this name.
    const JOB_NAME: &'static str;

    /// Cap on worker claims via the poll path. Records whose attempts are
    /// exhausted are failed by the expired-lock sweep instead of re-pended.
    const MAX_ATTEMPTS: i32 = DEFAULT_MAX_ATTEMPTS;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// The job's result schema.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Execute the job. This method should define its logic.
    fn run(
        &self,
        ctx: Self::Context,
        exec: &Execution,
    ) -> impl Future<Output = anyhow::Result<Self::Output>> + Send;

    /// Execute immediately in the caller's task.
    ///
    /// With `persist: true` (the default) a record is inserted as `running`
    /// (attempt 1, worker lock held) *before* the job runs, and the terminal
    /// transition is written before this returns — including on failure, so
    /// the record is inspectable even though the caller also sees the error.
    #[instrument(name = "jobs.now", skip(self, store, context, options), fields(job = Self::JOB_NAME))]
    fn now<'a, S: JobStore>(
        &'a self,
        store: &'a S,
        context: Self::Context,
        options: NowOptions,
    ) -> BoxFuture<'a, Result<JobOutcome<Self::Output>, Error>> {
        async move {
            let started = Instant::now();
            let params = validation::params_value(self)?;

            if !options.persist {
                let exec = Execution::detached(Self::JOB_NAME);
                let data = run_catching(self, context, &exec).await?;
                return Ok(JobOutcome {
                    data,
                    metadata: JobMetadata {
                        job_id: None,
                        status: JobStatus::Completed,
                        duration: started.elapsed(),
                    },
                });
            }

            let mut record = JobRecord::running(Self::JOB_NAME, params, DEFAULT_WORKER_TIMEOUT);
            record.max_attempts = Self::MAX_ATTEMPTS;
            let record = store.insert(record).await?;
            settle(store, self, context, &record, started).await
        }
        .boxed()
    }

    /// Enqueue for later execution by a worker backend. Returns the new
    /// record's id; nothing is executed.
    fn later<'a, S: JobStore>(&'a self, store: &'a S) -> BoxFuture<'a, Result<String, Error>> {
        self.later_with(store, EnqueueOptions::default())
    }

    /// [`Job::later`] with scheduling, correlation, and attempt-cap options.
    #[instrument(name = "jobs.later", skip(self, store, options), fields(job = Self::JOB_NAME))]
    fn later_with<'a, S: JobStore>(
        &'a self,
        store: &'a S,
        options: EnqueueOptions,
    ) -> BoxFuture<'a, Result<String, Error>> {
        async move {
            let params = validation::params_value(self)?;
            let mut record = JobRecord::pending(Self::JOB_NAME, params);
            record.scheduled_for = options.scheduled_for;
            record.correlation_id = options.correlation_id;
            record.max_attempts = options.max_attempts.unwrap_or(Self::MAX_ATTEMPTS);
            let record = store.insert(record).await?;
            Ok(record.id)
        }
        .boxed()
    }

    /// Worker-side execution of an already-persisted record.
    ///
    /// Claims the record in a single statement (status to `running`, fresh
    /// worker lock, `attempt_count + 1`), re-validates the stored params
    /// against the current schema, runs the job, and writes the terminal
    /// transition before returning. Only `pending` records and expired
    /// `running` claims are claimable; completed and failed records stay
    /// terminal.
    #[instrument(name = "jobs.execute", skip(store, context, worker_timeout), fields(job = Self::JOB_NAME))]
    fn execute_from_database<'a, S: JobStore>(
        store: &'a S,
        context: Self::Context,
        job_id: &'a str,
        worker_timeout: Duration,
    ) -> BoxFuture<'a, Result<JobOutcome<Self::Output>, Error>>
    where
        Self: Sized,
    {
        async move {
            let started = Instant::now();
            let record = store.claim_for_execution(job_id, worker_timeout).await?;

            if record.job_name != Self::JOB_NAME {
                store.release_lock(job_id).await?;
                return Err(Error::JobNameMismatch {
                    id: record.id,
                    actual: record.job_name,
                    expected: Self::JOB_NAME.to_owned(),
                });
            }

            let job = match validation::parse_params::<Self>(record.params.clone()) {
                Ok(job) => job,
                Err(error) => {
                    // Stored params no longer parse under the current schema
                    // version. Fail the record so the drift is inspectable.
                    store.record_failure(&record.id, error.to_string()).await?;
                    return Err(error);
                }
            };

            settle(store, &job, context, &record, started).await
        }
        .boxed()
    }

    /// Fan a list of jobs out over [`Job::now`].
    ///
    /// Jobs are processed in chunks of `concurrency`; chunks run
    /// sequentially and items within a chunk run concurrently. With
    /// `stop_on_error` the first failure aborts the batch (remaining
    /// in-flight items in the chunk are dropped; writes they already made
    /// stand). Otherwise failures are counted and logged, and only
    /// successful outcomes are returned, in completion order per chunk.
    fn batch<'a, S: JobStore>(
        store: &'a S,
        context: Self::Context,
        jobs: Vec<Self>,
        options: BatchOptions,
    ) -> BoxFuture<'a, Result<Vec<JobOutcome<Self::Output>>, Error>>
    where
        Self: Sized,
    {
        async move {
            if options.concurrency == 0 {
                return Err(Error::Configuration(
                    "batch concurrency must be a positive integer".to_owned(),
                ));
            }

            let now_options = NowOptions {
                persist: options.persist,
            };
            let mut results = Vec::with_capacity(jobs.len());
            let mut failed = 0_usize;
            let mut queue = jobs.into_iter();

            loop {
                let chunk: Vec<Self> = queue.by_ref().take(options.concurrency).collect();
                if chunk.is_empty() {
                    break;
                }

                let mut in_flight: FuturesUnordered<_> = chunk
                    .into_iter()
                    .map(|job| {
                        let context = context.clone();
                        async move { job.now(store, context, now_options).await }
                    })
                    .collect();

                while let Some(result) = in_flight.next().await {
                    match result {
                        Ok(outcome) => results.push(outcome),
                        Err(error) if options.stop_on_error => return Err(error),
                        Err(error) => {
                            failed += 1;
                            warn!(%error, job = Self::JOB_NAME, "batch item failed");
                        }
                    }
                }
            }

            if failed > 0 {
                warn!(failed, job = Self::JOB_NAME, "batch finished with failed items");
            }
            Ok(results)
        }
        .boxed()
    }
}

/// Run the job body, converting both returned errors and panics into
/// [`Error::Execution`] with the original message.
pub(crate) async fn run_catching<J: Job>(
    job: &J,
    context: J::Context,
    exec: &Execution,
) -> Result<J::Output, Error> {
    match AssertUnwindSafe(job.run(context, exec)).catch_unwind().await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(Error::Execution(error.to_string())),
        Err(payload) => Err(Error::Execution(panic_message(&payload))),
    }
}

/// Run a claimed record's job body and write the terminal transition.
/// The failure write happens before the error is handed back to the caller.
async fn settle<J: Job, S: JobStore>(
    store: &S,
    job: &J,
    context: J::Context,
    record: &JobRecord,
    started: Instant,
) -> Result<JobOutcome<J::Output>, Error> {
    let exec = Execution::persisted(J::JOB_NAME, &record.id, Box::new(store.clone()));

    let settled = match run_catching(job, context, &exec).await {
        Ok(output) => validation::result_value::<J>(&output).map(|value| (output, value)),
        Err(error) => Err(error),
    };

    match settled {
        Ok((data, value)) => {
            store.record_success(&record.id, value).await?;
            Ok(JobOutcome {
                data,
                metadata: JobMetadata {
                    job_id: Some(record.id.clone()),
                    status: JobStatus::Completed,
                    duration: started.elapsed(),
                },
            })
        }
        Err(error) => {
            store.record_failure(&record.id, error.to_string()).await?;
            Err(error)
        }
    }
}
