//! Integration tests against a real Postgres database.
//!
//! These run only when `DATABASE_URL` points at a disposable database; they
//! are skipped otherwise so the suite stays runnable without infrastructure.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

use workhorse::{
    CronWorkerBackend, EnqueueOptions, Execution, Job, JobRegistry, JobStatus, JobStore, PgStore,
    WorkerBackend, setup_database,
};

const TIMEOUT: Duration = Duration::from_secs(60);

/// Enqueue far in the future so concurrently running worker-cycle tests
/// cannot claim the record out from under us.
fn unclaimable() -> EnqueueOptions {
    EnqueueOptions {
        scheduled_for: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
        ..EnqueueOptions::default()
    }
}

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to DATABASE_URL");
    setup_database(&pool).await.expect("failed to run migrations");
    Some(pool)
}

macro_rules! require_database {
    () => {
        match test_pool().await {
            Some(pool) => pool,
            None => {
                eprintln!("skipping: DATABASE_URL is not set");
                return;
            }
        }
    };
}

#[derive(Serialize, Deserialize)]
struct Echo {
    value: i64,
}

impl Job for Echo {
    const JOB_NAME: &'static str = "pg_echo";
    type Context = ();
    type Output = i64;

    async fn run(&self, _ctx: (), _exec: &Execution) -> anyhow::Result<i64> {
        Ok(self.value)
    }
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let pool = require_database!();
    setup_database(&pool).await.expect("second run must be a no-op");
}

#[tokio::test]
async fn records_round_trip_through_postgres() {
    let pool = require_database!();
    let store = PgStore::new(pool);

    let id = Echo { value: 11 }
        .later_with(&store, unclaimable())
        .await
        .unwrap();
    let record = store.find(&id).await.unwrap().expect("record must exist");
    assert_eq!(record.job_name, "pg_echo");
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.params, json!({"value": 11}));
    assert_eq!(record.attempt_count, 0);
}

#[tokio::test]
async fn execute_from_database_completes_a_claimed_record() {
    let pool = require_database!();
    let store = PgStore::new(pool);

    let id = Echo { value: 11 }
        .later_with(&store, unclaimable())
        .await
        .unwrap();
    let outcome = Echo::execute_from_database(&store, (), &id, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(outcome.data, 11);

    let record = store.find(&id).await.unwrap().expect("record must exist");
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.result, Some(json!(11)));
    assert_eq!(record.progress, 100);
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test]
async fn release_lock_reverts_a_claim() {
    let pool = require_database!();
    let store = PgStore::new(pool);

    let id = Echo { value: 1 }
        .later_with(&store, unclaimable())
        .await
        .unwrap();
    let claimed = store.claim_for_execution(&id, TIMEOUT).await.unwrap();
    assert_eq!(claimed.status, JobStatus::Running);
    assert!(claimed.worker_expires_at.is_some());

    store.release_lock(&id).await.unwrap();
    let record = store.find(&id).await.unwrap().expect("record must exist");
    assert_eq!(record.status, JobStatus::Pending);
    assert!(record.worker_expires_at.is_none());
}

#[tokio::test]
async fn progress_writes_apply_only_to_running_records() {
    let pool = require_database!();
    let store = PgStore::new(pool);

    let id = Echo { value: 1 }
        .later_with(&store, unclaimable())
        .await
        .unwrap();
    store.update_progress(&id, 40, Some("ignored".to_owned())).await.unwrap();
    let record = store.find(&id).await.unwrap().expect("record must exist");
    assert_eq!(record.progress, 0);

    store.claim_for_execution(&id, TIMEOUT).await.unwrap();
    store.update_progress(&id, 40, Some("working".to_owned())).await.unwrap();
    let record = store.find(&id).await.unwrap().expect("record must exist");
    assert_eq!(record.progress, 40);
    assert_eq!(record.progress_message.as_deref(), Some("working"));
}

#[tokio::test]
async fn handle_cron_executes_enqueued_records() {
    let pool = require_database!();
    let store = PgStore::new(pool.clone());
    let registry = Arc::new(JobRegistry::new().register::<Echo>());

    let id = Echo { value: 21 }.later(&store).await.unwrap();

    let backend = CronWorkerBackend::new(pool, (), registry);
    backend.initialize().await.unwrap();
    assert!(backend.health_check().await.healthy);

    // The cycle may also pick up records left by other tests; we only
    // assert on ours.
    loop {
        let summary = backend.handle_cron().await.unwrap();
        let record = store.find(&id).await.unwrap().expect("record must exist");
        if record.status == JobStatus::Completed {
            assert_eq!(record.result, Some(json!(21)));
            break;
        }
        assert!(summary.cycle.remaining > 0, "record was never claimed");
    }
}
