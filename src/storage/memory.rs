//! In-memory job record store for tests and development.
//!
//! Backed by a process-local map behind a mutex. Claiming is serialized by
//! the lock rather than database-atomic; that is safe only because there is
//! no cross-process concurrency to defend against. Never use this store in
//! production.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ClaimOutcome, JobStore, SweepOutcome};
use crate::errors::Error;
use crate::schema::{CronJobRecord, JobRecord, JobStatus};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    cron_jobs: HashMap<String, CronJobRecord>,
}

/// [`JobStore`] over a process-local map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    /// Test helper: place a record directly into the store, bypassing the
    /// normal entry points.
    pub fn seed(&self, record: JobRecord) -> String {
        self.with(|inner| {
            let id = record.id.clone();
            inner.jobs.insert(id.clone(), record);
            id
        })
    }

    /// Test helper: inspect a record directly.
    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.with(|inner| inner.jobs.get(job_id).cloned())
    }

    /// Test helper: mutate a record in place. Returns false if absent.
    pub fn update(&self, job_id: &str, f: impl FnOnce(&mut JobRecord)) -> bool {
        self.with(|inner| match inner.jobs.get_mut(job_id) {
            Some(record) => {
                f(record);
                record.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    /// Test helper: all records, in creation order.
    pub fn all(&self) -> Vec<JobRecord> {
        self.with(|inner| {
            let mut records: Vec<_> = inner.jobs.values().cloned().collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));
            records
        })
    }

    /// Test helper: inspect a cron trigger directly.
    pub fn get_cron(&self, cron_id: &str) -> Option<CronJobRecord> {
        self.with(|inner| inner.cron_jobs.get(cron_id).cloned())
    }
}

impl JobStore for MemoryStore {
    async fn insert(&self, record: JobRecord) -> Result<JobRecord, Error> {
        self.with(|inner| {
            inner.jobs.insert(record.id.clone(), record.clone());
            Ok(record)
        })
    }

    async fn find(&self, job_id: &str) -> Result<Option<JobRecord>, Error> {
        Ok(self.get(job_id))
    }

    async fn claim_for_execution(
        &self,
        job_id: &str,
        worker_timeout: Duration,
    ) -> Result<JobRecord, Error> {
        let now = Utc::now();
        self.with(|inner| {
            let record = inner
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::NotFound(job_id.to_owned()))?;
            let claimable = record.status == JobStatus::Pending
                || (record.status == JobStatus::Running
                    && record.worker_expires_at.is_some_and(|at| at < now));
            if !claimable {
                return Err(Error::NotClaimable {
                    id: record.id.clone(),
                    status: record.status,
                });
            }
            record.status = JobStatus::Running;
            record.worker_started_at = Some(now);
            record.worker_expires_at = Some(now + worker_timeout);
            record.attempt_count += 1;
            record.updated_at = now;
            Ok(record.clone())
        })
    }

    async fn poll_and_claim(
        &self,
        limit: i64,
        worker_timeout: Duration,
    ) -> Result<ClaimOutcome, Error> {
        let now = Utc::now();
        self.with(|inner| {
            let mut eligible: Vec<String> = inner
                .jobs
                .values()
                .filter(|r| {
                    r.status == JobStatus::Pending
                        && r.scheduled_for.map_or(true, |at| at <= now)
                        && r.attempt_count < r.max_attempts
                })
                .map(|r| r.id.clone())
                .collect();
            eligible.sort();

            let take = usize::try_from(limit).unwrap_or(0).min(eligible.len());
            let remaining = (eligible.len() - take) as i64;

            let mut claimed = Vec::with_capacity(take);
            for id in eligible.into_iter().take(take) {
                if let Some(record) = inner.jobs.get_mut(&id) {
                    record.status = JobStatus::Running;
                    record.worker_started_at = Some(now);
                    record.worker_expires_at = Some(now + worker_timeout);
                    record.attempt_count += 1;
                    record.updated_at = now;
                    claimed.push(record.clone());
                }
            }

            Ok(ClaimOutcome { claimed, remaining })
        })
    }

    async fn update_progress(
        &self,
        job_id: &str,
        progress: i32,
        message: Option<String>,
    ) -> Result<(), Error> {
        self.with(|inner| {
            if let Some(record) = inner.jobs.get_mut(job_id) {
                if record.status == JobStatus::Running {
                    record.progress = progress;
                    if message.is_some() {
                        record.progress_message = message;
                    }
                    record.updated_at = Utc::now();
                }
            }
            Ok(())
        })
    }

    async fn record_success(&self, job_id: &str, result: Value) -> Result<(), Error> {
        let now = Utc::now();
        self.with(|inner| {
            if let Some(record) = inner.jobs.get_mut(job_id) {
                record.status = JobStatus::Completed;
                record.result = Some(result);
                record.progress = 100;
                record.completed_at = Some(now);
                record.updated_at = now;
            }
            Ok(())
        })
    }

    async fn record_failure(&self, job_id: &str, error: String) -> Result<(), Error> {
        let now = Utc::now();
        self.with(|inner| {
            if let Some(record) = inner.jobs.get_mut(job_id) {
                record.status = JobStatus::Failed;
                record.error = Some(error);
                record.completed_at = Some(now);
                record.updated_at = now;
            }
            Ok(())
        })
    }

    async fn release_lock(&self, job_id: &str) -> Result<(), Error> {
        let now = Utc::now();
        self.with(|inner| {
            if let Some(record) = inner.jobs.get_mut(job_id) {
                if record.status == JobStatus::Running {
                    record.worker_started_at = None;
                    record.worker_expires_at = None;
                    record.updated_at = now;
                    if record.attempt_count >= record.max_attempts {
                        // Back to `pending` it would be unreachable: not
                        // eligible to poll, not visible to the sweep.
                        record.status = JobStatus::Failed;
                        record.error = Some(
                            "worker lock released with no attempts remaining".to_owned(),
                        );
                        record.completed_at = Some(now);
                    } else {
                        record.status = JobStatus::Pending;
                    }
                }
            }
            Ok(())
        })
    }

    async fn reset_expired_locks(&self) -> Result<SweepOutcome, Error> {
        let now = Utc::now();
        self.with(|inner| {
            let mut outcome = SweepOutcome {
                reset: 0,
                exhausted: 0,
            };
            for record in inner.jobs.values_mut() {
                let expired = record.status == JobStatus::Running
                    && record.worker_expires_at.is_some_and(|at| at < now);
                if !expired {
                    continue;
                }
                record.worker_started_at = None;
                record.worker_expires_at = None;
                record.updated_at = now;
                if record.attempt_count >= record.max_attempts {
                    record.status = JobStatus::Failed;
                    record.error =
                        Some("worker lock expired with no attempts remaining".to_owned());
                    record.completed_at = Some(now);
                    outcome.exhausted += 1;
                } else {
                    record.status = JobStatus::Pending;
                    outcome.reset += 1;
                }
            }
            Ok(outcome)
        })
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn due_cron_jobs(&self, now: DateTime<Utc>) -> Result<Vec<CronJobRecord>, Error> {
        self.with(|inner| {
            let mut due: Vec<_> = inner
                .cron_jobs
                .values()
                .filter(|c| c.enabled && c.next_run_at.map_or(true, |at| at <= now))
                .cloned()
                .collect();
            due.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(due)
        })
    }

    async fn insert_cron_job(&self, record: CronJobRecord) -> Result<CronJobRecord, Error> {
        self.with(|inner| {
            inner.cron_jobs.insert(record.id.clone(), record.clone());
            Ok(record)
        })
    }

    async fn disable_cron_job(&self, cron_id: &str) -> Result<(), Error> {
        self.with(|inner| {
            if let Some(cron) = inner.cron_jobs.get_mut(cron_id) {
                cron.enabled = false;
                cron.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    async fn record_cron_trigger(
        &self,
        cron_id: &str,
        last_job_id: Option<String>,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        self.with(|inner| {
            if let Some(cron) = inner.cron_jobs.get_mut(cron_id) {
                if last_job_id.is_some() {
                    cron.last_job_id = last_job_id;
                }
                if last_run_at.is_some() {
                    cron.last_run_at = last_run_at;
                }
                cron.next_run_at = next_run_at;
                cron.updated_at = Utc::now();
            }
            Ok(())
        })
    }
}
