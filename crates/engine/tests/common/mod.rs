//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atelier_core::generation::{GenerationRequest, NewGenerationRequest};
use atelier_core::types::JobId;
use atelier_engine::backend::{
    BackendError, PollingBackend, ProgressUpdate, RemoteTicket, StreamingBackend, UpdateStream,
};
use atelier_engine::reporter::{ProgressReporter, ProgressSink, ReportContext};
use atelier_engine::{EngineConfig, JobManager};
use atelier_events::JobEvent;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

/// One admitted job, handed to the test so it can drive the callbacks.
pub struct Run {
    pub ctx: ReportContext,
    pub sink: ProgressSink,
}

/// Reporter that forwards every admitted job to the test instead of
/// talking to a backend.
pub struct ScriptedReporter {
    runs: mpsc::UnboundedSender<Run>,
}

impl ScriptedReporter {
    pub fn new(runs: mpsc::UnboundedSender<Run>) -> Self {
        Self { runs }
    }
}

#[async_trait]
impl ProgressReporter for ScriptedReporter {
    async fn report(&self, ctx: ReportContext, sink: ProgressSink) {
        // A closed receiver drops the run, which fails the job.
        let _ = self.runs.send(Run { ctx, sink });
    }
}

pub async fn scripted_manager(
    config: EngineConfig,
) -> (Arc<JobManager>, mpsc::UnboundedReceiver<Run>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = Arc::new(ScriptedReporter::new(tx));
    let manager = JobManager::start(config, reporter)
        .await
        .expect("valid config");
    (manager, rx)
}

pub async fn manager_with_slots(
    max_concurrent: usize,
) -> (Arc<JobManager>, mpsc::UnboundedReceiver<Run>) {
    scripted_manager(EngineConfig::default().with_max_concurrent(max_concurrent)).await
}

/// Wait for the next admitted job.
pub async fn next_run(runs: &mut mpsc::UnboundedReceiver<Run>) -> Run {
    tokio::time::timeout(Duration::from_secs(5), runs.recv())
        .await
        .expect("timed out waiting for an admitted job")
        .expect("reporter channel closed")
}

/// Collect every job event through a callback subscription.
pub fn record_events(manager: &JobManager) -> mpsc::UnboundedReceiver<JobEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.subscribe(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<JobEvent>) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a job event")
        .expect("event channel closed")
}

pub fn chat(prompt: &str) -> NewGenerationRequest {
    NewGenerationRequest::new("chat", json!({ "prompt": prompt }))
}

pub fn video(prompt: &str) -> NewGenerationRequest {
    NewGenerationRequest::new("video", json!({ "prompt": prompt, "duration_secs": 5 }))
}

/// Where [`FaultyBackend`] breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `start` / `open` is refused.
    Submission,
    /// Every status poll errors.
    Poll,
    /// The update stream yields one progress value, then closes.
    StreamEnd,
}

/// Backend double that fails in a chosen way.
pub struct FaultyBackend {
    fault: Fault,
}

impl FaultyBackend {
    pub fn new(fault: Fault) -> Self {
        Self { fault }
    }
}

#[async_trait]
impl PollingBackend for FaultyBackend {
    async fn start(
        &self,
        job_id: JobId,
        _request: &GenerationRequest,
    ) -> Result<RemoteTicket, BackendError> {
        match self.fault {
            Fault::Submission => Err(BackendError::Api {
                status: 503,
                body: "overloaded".into(),
            }),
            _ => Ok(RemoteTicket(format!("faulty-{job_id}"))),
        }
    }

    async fn poll(&self, _ticket: &RemoteTicket) -> Result<ProgressUpdate, BackendError> {
        match self.fault {
            Fault::Poll => Err(BackendError::Protocol("malformed status body".into())),
            _ => Ok(ProgressUpdate::Progress(10)),
        }
    }

    async fn cancel(&self, _ticket: &RemoteTicket) -> Result<(), BackendError> {
        Ok(())
    }
}

#[async_trait]
impl StreamingBackend for FaultyBackend {
    async fn open(
        &self,
        _job_id: JobId,
        _request: &GenerationRequest,
    ) -> Result<UpdateStream, BackendError> {
        match self.fault {
            Fault::Submission => Err(BackendError::Rejected("quota exceeded".into())),
            _ => Ok(futures::stream::iter(vec![Ok(ProgressUpdate::Progress(25))]).boxed()),
        }
    }
}
