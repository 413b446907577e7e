//! Stand-in generation capability with the console's fixed timings.
//!
//! Video, music and slide decks advance 10% per tick and finish on the
//! tenth; chat replies after one tick and images after two, without
//! intermediate progress. Results are the placeholder payloads the console
//! rendered. Useful for demos and for exercising the engine end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use atelier_core::generation::{GenerationKind, GenerationRequest};
use atelier_core::job::{GenerationError, ERR_BACKEND, MAX_PROGRESS};
use atelier_core::types::JobId;
use futures::StreamExt;
use serde_json::json;

use super::{BackendError, PollingBackend, ProgressUpdate, RemoteTicket, StreamingBackend, UpdateStream};

/// Default tick for streamed updates, matching the console's one-second timer.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Default progress increment per tick for incremental kinds.
pub const DEFAULT_STEP: u8 = 10;

pub struct SimulatedBackend {
    tick: Duration,
    step: u8,
    fail_at: Option<u8>,
    runs: Mutex<HashMap<RemoteTicket, SimulatedRun>>,
    next_ticket: AtomicU64,
    cancelled: Mutex<Vec<RemoteTicket>>,
}

struct SimulatedRun {
    plan: Vec<ProgressUpdate>,
    cursor: usize,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            tick: DEFAULT_TICK,
            step: DEFAULT_STEP,
            fail_at: None,
            runs: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Delay between streamed updates. Polling uses the reporter interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_step(mut self, step: u8) -> Self {
        self.step = step.clamp(1, MAX_PROGRESS);
        self
    }

    /// Report a failure instead of any progress at or beyond `percent`.
    pub fn failing_at(mut self, percent: u8) -> Self {
        self.fail_at = Some(percent);
        self
    }

    /// Tickets that received a cancel request, in order.
    pub fn cancelled_tickets(&self) -> Vec<RemoteTicket> {
        lock(&self.cancelled).clone()
    }

    /// Number of generations started and not yet finished or cancelled.
    pub fn active_runs(&self) -> usize {
        lock(&self.runs).len()
    }

    /// The sequence of updates a request of `kind` goes through.
    pub fn plan(&self, job_id: JobId, kind: GenerationKind) -> Vec<ProgressUpdate> {
        let mut plan = match kind {
            GenerationKind::Chat => Vec::new(),
            GenerationKind::Image => vec![ProgressUpdate::Progress(0)],
            GenerationKind::Video | GenerationKind::Music | GenerationKind::Slides => (1..)
                .map(|i: u32| i * u32::from(self.step))
                .take_while(|p| *p < u32::from(MAX_PROGRESS))
                .map(|p| ProgressUpdate::Progress(p as u8))
                .collect(),
        };
        plan.push(ProgressUpdate::Completed(placeholder_result(job_id, kind)));

        if let Some(fail_at) = self.fail_at {
            if let Some(pos) = plan.iter().position(|u| match u {
                ProgressUpdate::Progress(p) => *p >= fail_at,
                _ => true,
            }) {
                plan.truncate(pos);
                plan.push(ProgressUpdate::Failed(GenerationError::new(
                    ERR_BACKEND,
                    format!("Simulated failure at {fail_at}%"),
                )));
            }
        }
        plan
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PollingBackend for SimulatedBackend {
    async fn start(
        &self,
        job_id: JobId,
        request: &GenerationRequest,
    ) -> Result<RemoteTicket, BackendError> {
        let n = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let ticket = RemoteTicket(format!("sim-{n}"));
        let run = SimulatedRun {
            plan: self.plan(job_id, request.kind()),
            cursor: 0,
        };
        lock(&self.runs).insert(ticket.clone(), run);
        tracing::debug!(job_id = %job_id, ticket = %ticket, "Simulated generation started");
        Ok(ticket)
    }

    async fn poll(&self, ticket: &RemoteTicket) -> Result<ProgressUpdate, BackendError> {
        let mut runs = lock(&self.runs);
        let run = runs
            .get_mut(ticket)
            .ok_or_else(|| BackendError::Rejected(format!("Unknown ticket {ticket}")))?;
        let update = run
            .plan
            .get(run.cursor)
            .cloned()
            .ok_or_else(|| BackendError::Protocol(format!("Ticket {ticket} already finished")))?;
        run.cursor += 1;
        if update.is_terminal() {
            runs.remove(ticket);
        }
        Ok(update)
    }

    async fn cancel(&self, ticket: &RemoteTicket) -> Result<(), BackendError> {
        lock(&self.runs).remove(ticket);
        lock(&self.cancelled).push(ticket.clone());
        Ok(())
    }
}

#[async_trait]
impl StreamingBackend for SimulatedBackend {
    async fn open(
        &self,
        job_id: JobId,
        request: &GenerationRequest,
    ) -> Result<UpdateStream, BackendError> {
        let tick = self.tick;
        let plan = self.plan(job_id, request.kind());
        let stream = futures::stream::iter(plan).then(move |update| async move {
            tokio::time::sleep(tick).await;
            Ok(update)
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), BackendError> {
        lock(&self.cancelled).push(RemoteTicket(format!("stream-{job_id}")));
        Ok(())
    }
}

/// The payload the console showed for a finished generation of `kind`.
pub fn placeholder_result(job_id: JobId, kind: GenerationKind) -> serde_json::Value {
    match kind {
        GenerationKind::Chat => json!({
            "role": "assistant",
            "content": "This is a simulated reply. A connected model returns its response here.",
            "tokens": 150,
        }),
        GenerationKind::Image => json!({
            "url": format!("https://picsum.photos/{}", 400 + job_id.get() % 10),
        }),
        GenerationKind::Video => json!({
            "url": "https://example.com/video.mp4",
            "thumbnail_url": "https://via.placeholder.com/640x360",
        }),
        GenerationKind::Music => json!({
            "url": "https://example.com/music.mp3",
        }),
        GenerationKind::Slides => json!({
            "preview_url": "/preview.jpg",
        }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
