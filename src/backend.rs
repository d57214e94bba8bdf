//! The pluggable worker backend contract and the shared execution cycle.

use futures_util::future::join_all;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::errors::Error;
use crate::execution::Execution;
use crate::job::DEFAULT_WORKER_TIMEOUT;
use crate::registry::JobRegistry;
use crate::schema::JobRecord;
use crate::storage::{ClaimOutcome, JobStore, SweepOutcome};

/// Default maximum number of records claimed per poll.
pub const DEFAULT_CLAIM_LIMIT: i64 = 5;

/// Tunables shared by worker backends.
#[derive(Debug, Clone, Copy)]
pub struct BackendConfig {
    /// Maximum records claimed per poll. Claimed jobs run concurrently, so
    /// this is also the per-invocation concurrency cap.
    pub claim_limit: i64,
    /// Worker lock window attached to each claim.
    pub worker_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            claim_limit: DEFAULT_CLAIM_LIMIT,
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
        }
    }
}

/// Result of executing one claimed record. Failures are captured here, never
/// raised: a worker must survive any individual job.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Id of the executed record.
    pub job_id: String,
    /// Name of the job definition it was dispatched to.
    pub job_name: String,
    /// Whether the run completed and its terminal write succeeded.
    pub success: bool,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Failure message, if any.
    pub error: Option<String>,
}

/// Liveness probe result.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the backend can reach its store.
    pub healthy: bool,
    /// Failure detail when unhealthy.
    pub message: Option<String>,
}

/// Aggregate counts from one sweep/claim/execute cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleSummary {
    /// Expired locks swept back to `pending`.
    pub reset_locks: u64,
    /// Expired locks failed for exhausted attempts.
    pub exhausted_locks: u64,
    /// Records claimed and executed this cycle.
    pub executed: usize,
    /// Eligible records left unclaimed (autoscaling signal).
    pub remaining: i64,
    /// Executions that completed.
    pub succeeded: usize,
    /// Executions that failed.
    pub failed: usize,
}

/// Poller/claimer/executor that turns persisted pending records into
/// executed jobs. Implementations coordinate exclusively through their
/// store's claim semantics; see the crate docs for the at-least-once
/// execution caveat.
pub trait WorkerBackend: Send + Sync {
    /// Idempotent setup check. Fails loudly if the store is unreachable.
    fn initialize(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Release resources. Safe on an uninitialized or already-shut-down
    /// backend.
    fn shutdown(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Claim up to `limit` (default: the backend's configured claim limit)
    /// eligible pending records, atomically flipping them to `running` with
    /// a fresh lock. At most one worker holds a given record's lock during
    /// its validity window.
    fn poll_and_claim(
        &self,
        limit: Option<i64>,
    ) -> impl Future<Output = Result<ClaimOutcome, Error>> + Send;

    /// Dispatch a claimed record to the job registered under its name and
    /// write the terminal transition. Never fails; unknown names, panics,
    /// and storage errors all become a captured failure outcome.
    fn execute(&self, record: JobRecord) -> impl Future<Output = ExecutionOutcome> + Send;

    /// Revert a claimed-but-not-executed record to `pending` without
    /// recording success or failure (e.g. when shutting down mid-claim).
    /// A record on its final attempt is failed instead of re-pended.
    fn release_lock(&self, job_id: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Reset `running` records whose lock has expired back to `pending`.
    /// This is the only recovery path for a crashed worker's claims.
    fn handle_expired_locks(&self) -> impl Future<Output = Result<SweepOutcome, Error>> + Send;

    /// Cheap liveness probe.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// One full worker cycle, in strict order: sweep expired locks, claim a
/// batch, execute everything claimed concurrently, aggregate counts.
pub async fn run_cycle<B: WorkerBackend>(backend: &B) -> Result<CycleSummary, Error> {
    let sweep = backend.handle_expired_locks().await?;
    if sweep.reset > 0 || sweep.exhausted > 0 {
        info!(
            reset = sweep.reset,
            exhausted = sweep.exhausted,
            "swept expired worker locks"
        );
    }

    let ClaimOutcome { claimed, remaining } = backend.poll_and_claim(None).await?;
    let outcomes = join_all(claimed.into_iter().map(|record| backend.execute(record))).await;

    let succeeded = outcomes.iter().filter(|outcome| outcome.success).count();
    let failed = outcomes.len() - succeeded;

    let summary = CycleSummary {
        reset_locks: sweep.reset,
        exhausted_locks: sweep.exhausted,
        executed: outcomes.len(),
        remaining,
        succeeded,
        failed,
    };
    info!(
        executed = summary.executed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        remaining = summary.remaining,
        "worker cycle finished"
    );
    Ok(summary)
}

/// Shared execute path: registry dispatch plus terminal bookkeeping.
pub(crate) async fn dispatch<S, Context>(
    store: &S,
    registry: &JobRegistry<Context>,
    context: Context,
    record: JobRecord,
) -> ExecutionOutcome
where
    S: JobStore,
    Context: Clone + Send + 'static,
{
    let started = Instant::now();
    let job_id = record.id.clone();
    let job_name = record.job_name.clone();

    let result: Result<Value, Error> = match registry.get(&job_name) {
        None => Err(Error::UnknownJobType(job_name.clone())),
        Some(entry) => {
            let exec = Execution::persisted(&job_name, &job_id, Box::new(store.clone()));
            entry.run(context, exec, record.params).await
        }
    };

    match result {
        Ok(value) => match store.record_success(&job_id, value).await {
            Ok(()) => ExecutionOutcome {
                job_id,
                job_name,
                success: true,
                duration: started.elapsed(),
                error: None,
            },
            Err(write_error) => {
                error!(%write_error, job.id = %job_id, "completion write failed after successful run");
                ExecutionOutcome {
                    job_id,
                    job_name,
                    success: false,
                    duration: started.elapsed(),
                    error: Some(format!("completion write failed: {write_error}")),
                }
            }
        },
        Err(run_error) => {
            let message = run_error.to_string();
            warn!(error = %message, job.id = %job_id, job = %job_name, "job execution failed");
            if let Err(write_error) = store.record_failure(&job_id, message.clone()).await {
                error!(%write_error, job.id = %job_id, "failure write failed");
            }
            ExecutionOutcome {
                job_id,
                job_name,
                success: false,
                duration: started.elapsed(),
                error: Some(message),
            }
        }
    }
}
