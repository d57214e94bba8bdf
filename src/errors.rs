/// Errors surfaced by job execution, enqueueing, and worker backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Params or result data failed schema validation.
    #[error("validation failed for job `{job_name}`: {message}")]
    Validation {
        /// Name of the job whose schema rejected the data.
        job_name: String,
        /// The underlying parse failure, including field path/position.
        message: String,
    },

    /// The target job record does not exist.
    #[error("job record `{0}` not found")]
    NotFound(String),

    /// The target record cannot be claimed in its current state (terminal,
    /// or `running` under a live worker lock).
    #[error("job record `{id}` is not claimable in status `{status}`")]
    NotClaimable {
        /// Record id that was targeted.
        id: String,
        /// The record's current status.
        status: crate::schema::JobStatus,
    },

    /// The job's own logic failed. Displays the bare message so the
    /// persisted `error` column matches what the job raised.
    #[error("{0}")]
    Execution(String),

    /// Invalid configuration (e.g. a non-positive batch concurrency).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No job is registered under the record's `job_name`.
    #[error("unknown job type `{0}`")]
    UnknownJobType(String),

    /// A job record was dispatched to a job definition with a different name.
    #[error("job record `{id}` belongs to `{actual}`, not `{expected}`")]
    JobNameMismatch {
        /// Record id that was claimed.
        id: String,
        /// `job_name` stored on the record.
        actual: String,
        /// `JOB_NAME` of the definition that tried to execute it.
        expected: String,
    },

    /// The underlying database failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub(crate) fn validation(job_name: &str, message: impl ToString) -> Self {
        Error::Validation {
            job_name: job_name.to_owned(),
            message: message.to_string(),
        }
    }
}
