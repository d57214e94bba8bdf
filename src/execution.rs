//! Per-run execution context and the progress side-channel.

use futures_util::future::BoxFuture;
use tracing::warn;

use crate::errors::Error;

/// Narrow side-channel that a running job uses to push progress updates into
/// its persisted record.
///
/// Updates are best-effort: a sink failure is logged and swallowed, never
/// surfaced to the job. They are observability, not correctness.
pub trait ProgressSink: Send + Sync {
    /// Record a progress update for the given job record.
    fn record_progress(
        &self,
        job_id: &str,
        progress: i32,
        message: Option<String>,
    ) -> BoxFuture<'static, Result<(), Error>>;
}

/// Short-lived context for a single job run.
///
/// Distinct from the job *definition*: it holds only what the current run
/// needs for progress reporting. A detached execution (`now` with
/// `persist: false`) has no record to report into and updates become no-ops.
pub struct Execution {
    job_name: String,
    job_id: Option<String>,
    sink: Option<Box<dyn ProgressSink>>,
}

impl Execution {
    pub(crate) fn detached(job_name: &str) -> Self {
        Self {
            job_name: job_name.to_owned(),
            job_id: None,
            sink: None,
        }
    }

    pub(crate) fn persisted(job_name: &str, job_id: &str, sink: Box<dyn ProgressSink>) -> Self {
        Self {
            job_name: job_name.to_owned(),
            job_id: Some(job_id.to_owned()),
            sink: Some(sink),
        }
    }

    /// Id of the persisted record backing this run, if any.
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Push a progress update (percent 0-100 plus an optional message).
    ///
    /// Percentages outside 0-100 are rejected. When the run is not backed by
    /// a persisted record this is a no-op. Sink failures are logged at warn
    /// and do not fail the job.
    pub async fn update_progress(&self, progress: i32, message: Option<&str>) -> Result<(), Error> {
        if !(0..=100).contains(&progress) {
            return Err(Error::validation(
                &self.job_name,
                format!("progress {progress} is outside 0..=100"),
            ));
        }

        let (Some(job_id), Some(sink)) = (&self.job_id, &self.sink) else {
            return Ok(());
        };

        if let Err(error) = sink
            .record_progress(job_id, progress, message.map(str::to_owned))
            .await
        {
            warn!(%error, job.id = %job_id, "failed to record progress update");
        }
        Ok(())
    }
}
