//! How a running job's progress reaches the engine.
//!
//! The scheduler attaches one [`ProgressReporter`] run to every admitted
//! job and hands it a [`ProgressSink`]. The sink's terminal callbacks take
//! it by value, so a reporter can fire at most one of them; if the sink is
//! dropped without one (the reporter returned early or panicked) the job is
//! failed with [`ERR_REPORTER_EXITED`].

pub mod polling;
pub mod streaming;

use std::sync::Arc;

use async_trait::async_trait;
use atelier_core::generation::GenerationRequest;
use atelier_core::job::{GenerationError, ERR_REPORTER_EXITED};
use atelier_core::types::JobId;
use tokio_util::sync::CancellationToken;

use crate::backend::ProgressUpdate;

pub use polling::PollingReporter;
pub use streaming::StreamingReporter;

/// Everything a reporter needs to drive one job.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub job_id: JobId,
    pub request: GenerationRequest,
    /// Triggered when the job is cancelled or the engine shuts down. The
    /// reporter should stop promptly; its callbacks are ignored from then on.
    pub cancel: CancellationToken,
}

/// Channel through which external progress becomes visible to the engine.
#[async_trait]
pub trait ProgressReporter: Send + Sync + 'static {
    /// Drive `ctx.job_id` to a terminal callback on `sink`, or return once
    /// `ctx.cancel` fires.
    async fn report(&self, ctx: ReportContext, sink: ProgressSink);
}

/// Final outcome delivered by a reporter.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(serde_json::Value),
    Failed(GenerationError),
}

/// Receiver of reporter callbacks, implemented by the scheduler.
pub(crate) trait ReportTarget: Send + Sync {
    fn progress(&self, job_id: JobId, percent: u8);
    fn finish(&self, job_id: JobId, outcome: Outcome);
}

/// Callback handle for a single job.
pub struct ProgressSink {
    job_id: JobId,
    target: Arc<dyn ReportTarget>,
    finished: bool,
}

impl ProgressSink {
    pub(crate) fn new(job_id: JobId, target: Arc<dyn ReportTarget>) -> Self {
        Self {
            job_id,
            target,
            finished: false,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Report a completion percentage. Lower values than already recorded
    /// are ignored.
    pub fn on_progress(&self, percent: u8) {
        self.target.progress(self.job_id, percent);
    }

    pub fn on_complete(mut self, result: serde_json::Value) {
        self.finish(Outcome::Completed(result));
    }

    pub fn on_error(mut self, error: GenerationError) {
        self.finish(Outcome::Failed(error));
    }

    /// Forward a backend observation. Returns the sink back while the job
    /// is still running, `None` once a terminal callback has fired.
    pub fn apply(self, update: ProgressUpdate) -> Option<Self> {
        match update {
            ProgressUpdate::Progress(percent) => {
                self.on_progress(percent);
                Some(self)
            }
            ProgressUpdate::Completed(result) => {
                self.on_complete(result);
                None
            }
            ProgressUpdate::Failed(error) => {
                self.on_error(error);
                None
            }
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        self.finished = true;
        self.target.finish(self.job_id, outcome);
    }
}

impl Drop for ProgressSink {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Outcome::Failed(GenerationError::new(
                ERR_REPORTER_EXITED,
                "Progress reporter stopped without a result",
            )));
        }
    }
}
