//! Postgres-backed job record store.
//!
//! Claiming uses a single conditional `UPDATE ... RETURNING` statement (with
//! `FOR UPDATE SKIP LOCKED` candidate selection) so that two workers polling
//! the same table can never both claim a record. Every method acquires a
//! connection from the pool for the duration of one statement only; nothing
//! is held open while a job runs.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;

use super::{ClaimOutcome, JobStore, SweepOutcome};
use crate::errors::Error;
use crate::schema::{CronJobRecord, JobRecord};

const JOB_COLUMNS: &str = "id, job_name, params, result, status, progress, progress_message, \
     error, worker_started_at, worker_expires_at, attempt_count, max_attempts, scheduled_for, \
     correlation_id, created_at, updated_at, completed_at";

const CRON_COLUMNS: &str = "id, job_name, cron_expression, params, enabled, last_run_at, \
     next_run_at, last_job_id, created_at, updated_at";

/// Create the `jobs` and `cron_jobs` tables if they do not exist.
pub async fn setup_database(pool: &PgPool) -> Result<(), Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| Error::Database(err.into()))
}

/// [`JobStore`] over a Postgres connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl JobStore for PgStore {
    async fn insert(&self, record: JobRecord) -> Result<JobRecord, Error> {
        let query = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             RETURNING {JOB_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, JobRecord>(&query)
            .bind(&record.id)
            .bind(&record.job_name)
            .bind(&record.params)
            .bind(&record.result)
            .bind(record.status)
            .bind(record.progress)
            .bind(&record.progress_message)
            .bind(&record.error)
            .bind(record.worker_started_at)
            .bind(record.worker_expires_at)
            .bind(record.attempt_count)
            .bind(record.max_attempts)
            .bind(record.scheduled_for)
            .bind(&record.correlation_id)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.completed_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(inserted)
    }

    async fn find(&self, job_id: &str) -> Result<Option<JobRecord>, Error> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let record = sqlx::query_as::<_, JobRecord>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn claim_for_execution(
        &self,
        job_id: &str,
        worker_timeout: Duration,
    ) -> Result<JobRecord, Error> {
        let query = format!(
            "UPDATE jobs \
             SET status = 'running', \
                 worker_started_at = NOW(), \
                 worker_expires_at = NOW() + ($2::BIGINT * INTERVAL '1 millisecond'), \
                 attempt_count = attempt_count + 1, \
                 updated_at = NOW() \
             WHERE id = $1 \
               AND (status = 'pending' \
                    OR (status = 'running' AND worker_expires_at < NOW())) \
             RETURNING {JOB_COLUMNS}"
        );
        let claimed = sqlx::query_as::<_, JobRecord>(&query)
            .bind(job_id)
            .bind(worker_timeout.as_millis() as i64)
            .fetch_optional(&self.pool)
            .await?;
        match claimed {
            Some(record) => Ok(record),
            None => match self.find(job_id).await? {
                Some(record) => Err(Error::NotClaimable {
                    id: record.id,
                    status: record.status,
                }),
                None => Err(Error::NotFound(job_id.to_owned())),
            },
        }
    }

    async fn poll_and_claim(
        &self,
        limit: i64,
        worker_timeout: Duration,
    ) -> Result<ClaimOutcome, Error> {
        // The candidate SELECT and the status flip are one statement, so a
        // record can only ever be returned to a single caller.
        let query = format!(
            "WITH eligible AS ( \
                 SELECT id FROM jobs \
                 WHERE status = 'pending' \
                   AND (scheduled_for IS NULL OR scheduled_for <= NOW()) \
                   AND attempt_count < max_attempts \
                 ORDER BY created_at \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE jobs \
             SET status = 'running', \
                 worker_started_at = NOW(), \
                 worker_expires_at = NOW() + ($2::BIGINT * INTERVAL '1 millisecond'), \
                 attempt_count = attempt_count + 1, \
                 updated_at = NOW() \
             WHERE id IN (SELECT id FROM eligible) \
             RETURNING {JOB_COLUMNS}"
        );
        let claimed = sqlx::query_as::<_, JobRecord>(&query)
            .bind(limit)
            .bind(worker_timeout.as_millis() as i64)
            .fetch_all(&self.pool)
            .await?;

        let remaining = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs \
             WHERE status = 'pending' \
               AND (scheduled_for IS NULL OR scheduled_for <= NOW()) \
               AND attempt_count < max_attempts",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ClaimOutcome { claimed, remaining })
    }

    async fn update_progress(
        &self,
        job_id: &str,
        progress: i32,
        message: Option<String>,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE jobs \
             SET progress = $2, \
                 progress_message = COALESCE($3, progress_message), \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(job_id)
        .bind(progress)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_success(&self, job_id: &str, result: Value) -> Result<(), Error> {
        sqlx::query(
            "UPDATE jobs \
             SET status = 'completed', \
                 result = $2, \
                 progress = 100, \
                 completed_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, job_id: &str, error: String) -> Result<(), Error> {
        sqlx::query(
            "UPDATE jobs \
             SET status = 'failed', \
                 error = $2, \
                 completed_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_lock(&self, job_id: &str) -> Result<(), Error> {
        // A record released on its final attempt would otherwise sit
        // `pending` forever: ineligible to poll, invisible to the sweep.
        let exhausted = sqlx::query(
            "UPDATE jobs \
             SET status = 'failed', \
                 error = 'worker lock released with no attempts remaining', \
                 worker_started_at = NULL, \
                 worker_expires_at = NULL, \
                 completed_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'running' AND attempt_count >= max_attempts",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if exhausted > 0 {
            return Ok(());
        }

        sqlx::query(
            "UPDATE jobs \
             SET status = 'pending', \
                 worker_started_at = NULL, \
                 worker_expires_at = NULL, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_expired_locks(&self) -> Result<SweepOutcome, Error> {
        // Exhausted records go terminal first so the reset below cannot hand
        // them back out for yet another attempt.
        let exhausted = sqlx::query(
            "UPDATE jobs \
             SET status = 'failed', \
                 error = 'worker lock expired with no attempts remaining', \
                 worker_started_at = NULL, \
                 worker_expires_at = NULL, \
                 completed_at = NOW(), \
                 updated_at = NOW() \
             WHERE status = 'running' \
               AND worker_expires_at < NOW() \
               AND attempt_count >= max_attempts",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        let reset = sqlx::query(
            "UPDATE jobs \
             SET status = 'pending', \
                 worker_started_at = NULL, \
                 worker_expires_at = NULL, \
                 updated_at = NOW() \
             WHERE status = 'running' \
               AND worker_expires_at < NOW()",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(SweepOutcome { reset, exhausted })
    }

    async fn ping(&self) -> Result<(), Error> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn due_cron_jobs(&self, now: DateTime<Utc>) -> Result<Vec<CronJobRecord>, Error> {
        let query = format!(
            "SELECT {CRON_COLUMNS} FROM cron_jobs \
             WHERE enabled = TRUE AND (next_run_at IS NULL OR next_run_at <= $1) \
             ORDER BY created_at"
        );
        let due = sqlx::query_as::<_, CronJobRecord>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(due)
    }

    async fn insert_cron_job(&self, record: CronJobRecord) -> Result<CronJobRecord, Error> {
        let query = format!(
            "INSERT INTO cron_jobs ({CRON_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {CRON_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, CronJobRecord>(&query)
            .bind(&record.id)
            .bind(&record.job_name)
            .bind(&record.cron_expression)
            .bind(&record.params)
            .bind(record.enabled)
            .bind(record.last_run_at)
            .bind(record.next_run_at)
            .bind(&record.last_job_id)
            .bind(record.created_at)
            .bind(record.updated_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(inserted)
    }

    async fn disable_cron_job(&self, cron_id: &str) -> Result<(), Error> {
        sqlx::query("UPDATE cron_jobs SET enabled = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(cron_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_cron_trigger(
        &self,
        cron_id: &str,
        last_job_id: Option<String>,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE cron_jobs \
             SET last_job_id = COALESCE($2, last_job_id), \
                 last_run_at = COALESCE($3, last_run_at), \
                 next_run_at = $4, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(cron_id)
        .bind(last_job_id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
