//! The Job Record Store: persistence contract plus the Postgres and
//! in-memory implementations.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

use crate::errors::Error;
use crate::execution::ProgressSink;
use crate::schema::{CronJobRecord, JobRecord};

pub mod memory;
pub mod pg;

/// Result of a poll-and-claim pass.
#[derive(Debug)]
pub struct ClaimOutcome {
    /// Records atomically flipped to `running` by this call, now owned by
    /// the caller.
    pub claimed: Vec<JobRecord>,
    /// How many eligible pending records remained unclaimed (an autoscaling
    /// signal, measured after the claim).
    pub remaining: i64,
}

/// Result of an expired-lock sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Records whose expired lock was cleared and which went back to
    /// `pending` for another worker to claim.
    pub reset: u64,
    /// Records that had no attempts remaining and were failed instead.
    pub exhausted: u64,
}

/// Storage operations the job core needs. Every state transition is an
/// independent unit of work; implementations must not hold a connection or
/// transaction open across a job's `run`.
pub trait JobStore: Clone + Send + Sync + 'static {
    /// Persist a new record, returning it as stored.
    fn insert(&self, record: JobRecord) -> impl Future<Output = Result<JobRecord, Error>> + Send;

    /// Fetch a record by id.
    fn find(&self, job_id: &str)
    -> impl Future<Output = Result<Option<JobRecord>, Error>> + Send;

    /// Claim a specific record for execution: flip it to `running`, take the
    /// worker lock, and increment `attempt_count`, all in one statement.
    /// Only `pending` records and `running` records whose lock has expired
    /// are claimable; terminal records and live locks fail with
    /// [`Error::NotClaimable`]. Fails with [`Error::NotFound`] if the id
    /// does not exist.
    fn claim_for_execution(
        &self,
        job_id: &str,
        worker_timeout: Duration,
    ) -> impl Future<Output = Result<JobRecord, Error>> + Send;

    /// Atomically claim up to `limit` eligible pending records (scheduled
    /// time arrived, attempts remaining). At most one caller may claim a
    /// given record per lock window.
    fn poll_and_claim(
        &self,
        limit: i64,
        worker_timeout: Duration,
    ) -> impl Future<Output = Result<ClaimOutcome, Error>> + Send;

    /// Best-effort progress write for a running record.
    fn update_progress(
        &self,
        job_id: &str,
        progress: i32,
        message: Option<String>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Terminal success: result, progress 100, `completed_at`.
    fn record_success(
        &self,
        job_id: &str,
        result: Value,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Terminal failure: error message and `completed_at`.
    fn record_failure(
        &self,
        job_id: &str,
        error: String,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Revert a claimed-but-not-executed record to `pending`, clearing the
    /// worker lock without recording success or failure. A record released
    /// on its final attempt is failed instead, since `pending` with no
    /// attempts remaining is unreachable by both the poll and the sweep.
    fn release_lock(&self, job_id: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Maintenance sweep: reset `running` records whose lock has expired
    /// back to `pending` (or fail them once attempts are exhausted).
    fn reset_expired_locks(&self) -> impl Future<Output = Result<SweepOutcome, Error>> + Send;

    /// Cheap liveness probe against the backing store.
    fn ping(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Enabled cron triggers whose `next_run_at` is unset or has arrived.
    fn due_cron_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<CronJobRecord>, Error>> + Send;

    /// Persist a new cron trigger definition.
    fn insert_cron_job(
        &self,
        record: CronJobRecord,
    ) -> impl Future<Output = Result<CronJobRecord, Error>> + Send;

    /// Turn a cron trigger off so it is no longer evaluated.
    fn disable_cron_job(&self, cron_id: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Advance a cron trigger's bookkeeping after evaluation.
    fn record_cron_trigger(
        &self,
        cron_id: &str,
        last_job_id: Option<String>,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Any store doubles as the progress side-channel for jobs it executes.
impl<S: JobStore> ProgressSink for S {
    fn record_progress(
        &self,
        job_id: &str,
        progress: i32,
        message: Option<String>,
    ) -> BoxFuture<'static, Result<(), Error>> {
        let store = self.clone();
        let job_id = job_id.to_owned();
        Box::pin(async move { store.update_progress(&job_id, progress, message).await })
    }
}
