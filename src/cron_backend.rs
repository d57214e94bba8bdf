//! Postgres-backed worker backend with cron trigger evaluation.

use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, instrument};

use crate::backend::{
    BackendConfig, CycleSummary, ExecutionOutcome, HealthStatus, WorkerBackend, dispatch,
    run_cycle,
};
use crate::cron::CronScheduler;
use crate::errors::Error;
use crate::registry::JobRegistry;
use crate::schema::JobRecord;
use crate::storage::pg::PgStore;
use crate::storage::{ClaimOutcome, JobStore, SweepOutcome};

/// One cron-aware worker invocation: triggers evaluated, then a full
/// sweep/claim/execute cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronCycleSummary {
    /// Job records enqueued by due cron triggers this pass.
    pub triggered: usize,
    /// The worker cycle that followed.
    pub cycle: CycleSummary,
}

/// [`WorkerBackend`] over Postgres, designed to be invoked on a schedule
/// (one external tick = one cycle) rather than to run a polling loop of its
/// own. Multiple instances can safely share one database; the store's claim
/// semantics keep them from stepping on each other.
pub struct CronWorkerBackend<Context> {
    store: PgStore,
    context: Context,
    registry: Arc<JobRegistry<Context>>,
    config: BackendConfig,
    evaluate_cron_triggers: bool,
    initialized: AtomicBool,
}

impl<Context> CronWorkerBackend<Context>
where
    Context: Clone + Send + Sync + 'static,
{
    /// Build a backend over an existing pool with default tunables.
    pub fn new(pool: PgPool, context: Context, registry: Arc<JobRegistry<Context>>) -> Self {
        Self::with_config(pool, context, registry, BackendConfig::default())
    }

    /// [`CronWorkerBackend::new`] with explicit tunables.
    pub fn with_config(
        pool: PgPool,
        context: Context,
        registry: Arc<JobRegistry<Context>>,
        config: BackendConfig,
    ) -> Self {
        Self {
            store: PgStore::new(pool),
            context,
            registry,
            config,
            evaluate_cron_triggers: true,
            initialized: AtomicBool::new(false),
        }
    }

    /// Disable cron trigger evaluation; [`CronWorkerBackend::handle_cron`]
    /// then only runs the worker cycle.
    pub fn without_cron_triggers(mut self) -> Self {
        self.evaluate_cron_triggers = false;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &PgStore {
        &self.store
    }

    /// One scheduled invocation: evaluate due cron triggers (unless
    /// disabled), then sweep, claim, and execute a batch.
    #[instrument(name = "jobs.handle_cron", skip(self))]
    pub async fn handle_cron(&self) -> Result<CronCycleSummary, Error> {
        let triggered = if self.evaluate_cron_triggers {
            let scheduler = CronScheduler::new(self.store.clone(), self.registry.clone());
            scheduler.run_due(Utc::now()).await?
        } else {
            0
        };
        if triggered > 0 {
            info!(triggered, "cron triggers enqueued jobs");
        }

        let cycle = run_cycle(self).await?;
        Ok(CronCycleSummary { triggered, cycle })
    }
}

impl<Context> WorkerBackend for CronWorkerBackend<Context>
where
    Context: Clone + Send + Sync + 'static,
{
    async fn initialize(&self) -> Result<(), Error> {
        self.store.ping().await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Error> {
        // The pool is owned by the caller; nothing to tear down beyond the
        // readiness flag.
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    async fn poll_and_claim(&self, limit: Option<i64>) -> Result<ClaimOutcome, Error> {
        let limit = limit.unwrap_or(self.config.claim_limit);
        self.store
            .poll_and_claim(limit, self.config.worker_timeout)
            .await
    }

    async fn execute(&self, record: JobRecord) -> ExecutionOutcome {
        dispatch(&self.store, &self.registry, self.context.clone(), record).await
    }

    async fn release_lock(&self, job_id: &str) -> Result<(), Error> {
        self.store.release_lock(job_id).await
    }

    async fn handle_expired_locks(&self) -> Result<SweepOutcome, Error> {
        self.store.reset_expired_locks().await
    }

    async fn health_check(&self) -> HealthStatus {
        match self.store.ping().await {
            Ok(()) => HealthStatus {
                healthy: true,
                message: None,
            },
            Err(error) => HealthStatus {
                healthy: false,
                message: Some(error.to_string()),
            },
        }
    }
}
