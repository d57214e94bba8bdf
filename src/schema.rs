//! Persisted record types for the job system.
//!
//! The `jobs` table is the single point of coordination between workers;
//! `cron_jobs` is a declarative trigger source for recurring jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::time::Duration;

/// Default cap on how many times a record may be claimed for execution.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Lifecycle state of a [`JobRecord`].
///
/// Transitions are monotonic except for the expired-lock reset path
/// (`Running` back to `Pending`). Nothing leaves `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed; a worker lock is held.
    Running,
    /// Terminal: finished with a result.
    Completed,
    /// Terminal: finished with an error.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    /// Time-sortable unique identifier (ULID), generated at creation.
    pub id: String,
    /// Name of the job definition that owns this record; used for dispatch.
    pub job_name: String,
    /// Job params, validated against the owning job's params type before
    /// every write and after every read.
    pub params: Value,
    /// Job result, present only once `status` is `Completed`.
    pub result: Option<Value>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Progress percentage, 0-100.
    pub progress: i32,
    /// Human-readable current-step description.
    pub progress_message: Option<String>,
    /// Error message, set only on `Failed`.
    pub error: Option<String>,
    /// When the current worker claimed the record.
    pub worker_started_at: Option<DateTime<Utc>>,
    /// When the current worker's lock expires and the record becomes
    /// reclaimable.
    pub worker_expires_at: Option<DateTime<Utc>>,
    /// How many times a worker has claimed this record. Only increases.
    pub attempt_count: i32,
    /// Cap on claims via the poll path; see the expired-lock sweep.
    pub max_attempts: i32,
    /// Earliest time the record is eligible for claiming, if any.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Optional tracing/grouping key.
    pub correlation_id: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Updated on every mutation.
    pub updated_at: DateTime<Utc>,
    /// Set once, on the terminal transition.
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A freshly enqueued record: `pending`, zero attempts, no worker lock.
    pub fn pending(job_name: &str, params: Value) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            job_name: job_name.to_owned(),
            params,
            result: None,
            status: JobStatus::Pending,
            progress: 0,
            progress_message: None,
            error: None,
            worker_started_at: None,
            worker_expires_at: None,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_for: None,
            correlation_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// A record for immediate persisted execution: `running` with the worker
    /// lock already held and the first attempt counted. There is no separate
    /// claim step on this path.
    pub fn running(job_name: &str, params: Value, worker_timeout: Duration) -> Self {
        let now = Utc::now();
        let mut record = Self::pending(job_name, params);
        record.status = JobStatus::Running;
        record.attempt_count = 1;
        record.worker_started_at = Some(now);
        record.worker_expires_at = Some(now + worker_timeout);
        record
    }

    /// Whether the record has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A declarative trigger definition for a recurring job.
///
/// Data only: evaluation lives in [`crate::cron::CronScheduler`].
#[derive(Debug, Clone, FromRow)]
pub struct CronJobRecord {
    /// Unique identifier (ULID).
    pub id: String,
    /// Job definition to enqueue when the schedule fires.
    pub job_name: String,
    /// Five-field cron expression, evaluated in UTC.
    pub cron_expression: String,
    /// Default params for the enqueued job record.
    pub params: Value,
    /// Disabled rows are never evaluated.
    pub enabled: bool,
    /// When the schedule last fired.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next occurrence; initialized on first evaluation.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Id of the most recently enqueued job record.
    pub last_job_id: Option<String>,
    /// When the trigger was created.
    pub created_at: DateTime<Utc>,
    /// Updated on every mutation.
    pub updated_at: DateTime<Utc>,
}

impl CronJobRecord {
    /// A new enabled trigger. `next_run_at` starts unset and is initialized
    /// by the scheduler on its first pass without firing.
    pub fn new(job_name: &str, cron_expression: &str, params: Value) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            job_name: job_name.to_owned(),
            cron_expression: cron_expression.to_owned(),
            params,
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            last_job_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_records_have_no_lock() {
        let record = JobRecord::pending("send_email", json!({"to": "a@example.com"}));
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.progress, 0);
        assert!(record.worker_started_at.is_none());
        assert!(record.worker_expires_at.is_none());
        assert!(!record.is_terminal());
    }

    #[test]
    fn running_records_hold_a_valid_lock() {
        let record = JobRecord::running("send_email", json!({}), Duration::from_secs(300));
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.attempt_count, 1);
        let started = record.worker_started_at.unwrap();
        let expires = record.worker_expires_at.unwrap();
        assert!(expires > started);
    }

    #[test]
    fn record_ids_are_time_sortable() {
        let a = JobRecord::pending("a", json!({}));
        std::thread::sleep(Duration::from_millis(2));
        let b = JobRecord::pending("b", json!({}));
        assert!(a.id < b.id);
    }
}
