//! In-process worker backend over the in-memory store.
//!
//! Useful in tests and in development setups without Postgres. The full
//! execution pipeline (claiming, dispatch, progress, terminal transitions)
//! behaves like the Postgres backend; only the store underneath differs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::{
    BackendConfig, ExecutionOutcome, HealthStatus, WorkerBackend, dispatch,
};
use crate::errors::Error;
use crate::registry::JobRegistry;
use crate::schema::JobRecord;
use crate::storage::memory::MemoryStore;
use crate::storage::{ClaimOutcome, JobStore, SweepOutcome};

/// [`WorkerBackend`] over a [`MemoryStore`].
pub struct InMemoryBackend<Context> {
    store: MemoryStore,
    context: Context,
    registry: Arc<JobRegistry<Context>>,
    config: BackendConfig,
    initialized: AtomicBool,
}

impl<Context> InMemoryBackend<Context>
where
    Context: Clone + Send + Sync + 'static,
{
    /// Build a backend over a fresh empty store with default tunables.
    pub fn new(context: Context, registry: Arc<JobRegistry<Context>>) -> Self {
        Self::with_config(MemoryStore::new(), context, registry, BackendConfig::default())
    }

    /// Build a backend over an existing store with explicit tunables.
    pub fn with_config(
        store: MemoryStore,
        context: Context,
        registry: Arc<JobRegistry<Context>>,
        config: BackendConfig,
    ) -> Self {
        Self {
            store,
            context,
            registry,
            config,
            initialized: AtomicBool::new(false),
        }
    }

    /// The underlying store, for seeding and inspection.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl<Context> WorkerBackend for InMemoryBackend<Context>
where
    Context: Clone + Send + Sync + 'static,
{
    async fn initialize(&self) -> Result<(), Error> {
        self.store.ping().await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Error> {
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
