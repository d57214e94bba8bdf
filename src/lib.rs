#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod backend;
mod cron;
mod cron_backend;
mod errors;
mod execution;
mod job;
mod memory_backend;
mod registry;
/// Persisted record types.
pub mod schema;
mod storage;
mod util;
mod validation;

/// The main trait for defining background jobs.
pub use self::job::Job;
pub use self::job::{
    BatchOptions, DEFAULT_BATCH_CONCURRENCY, DEFAULT_WORKER_TIMEOUT, EnqueueOptions, JobMetadata,
    JobOutcome, NowOptions,
};

/// Error type shared across the crate.
pub use self::errors::Error;

pub use self::execution::{Execution, ProgressSink};
pub use self::registry::JobRegistry;
pub use self::schema::{CronJobRecord, DEFAULT_MAX_ATTEMPTS, JobRecord, JobStatus};

pub use self::storage::memory::MemoryStore;
pub use self::storage::pg::{PgStore, setup_database};
pub use self::storage::{ClaimOutcome, JobStore, SweepOutcome};

pub use self::backend::{
    BackendConfig, CycleSummary, DEFAULT_CLAIM_LIMIT, ExecutionOutcome, HealthStatus,
    WorkerBackend, run_cycle,
};
pub use self::cron::{CronSchedule, CronScheduler};
pub use self::cron_backend::{CronCycleSummary, CronWorkerBackend};
pub use self::memory_backend::InMemoryBackend;
