//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the async publish/subscribe hub for [`JobEvent`]s. It is
//! designed to be shared via `Arc<EventBus>` across the application.

use std::fmt;

use atelier_core::job::{Job, JobState};
use atelier_core::job_events::{
    MSG_TYPE_JOB_CANCELLED, MSG_TYPE_JOB_COMPLETED, MSG_TYPE_JOB_FAILED, MSG_TYPE_JOB_PROGRESS,
    MSG_TYPE_JOB_REMOVED, MSG_TYPE_JOB_STARTED, MSG_TYPE_JOB_SUBMITTED,
};
use atelier_core::types::{JobId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEventKind {
    #[serde(rename = "job_submitted")]
    Submitted,
    #[serde(rename = "job_started")]
    Started,
    #[serde(rename = "job_progress")]
    Progress,
    #[serde(rename = "job_completed")]
    Completed,
    #[serde(rename = "job_failed")]
    Failed,
    #[serde(rename = "job_cancelled")]
    Cancelled,
    #[serde(rename = "job_removed")]
    Removed,
}

impl JobEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => MSG_TYPE_JOB_SUBMITTED,
            Self::Started => MSG_TYPE_JOB_STARTED,
            Self::Progress => MSG_TYPE_JOB_PROGRESS,
            Self::Completed => MSG_TYPE_JOB_COMPLETED,
            Self::Failed => MSG_TYPE_JOB_FAILED,
            Self::Cancelled => MSG_TYPE_JOB_CANCELLED,
            Self::Removed => MSG_TYPE_JOB_REMOVED,
        }
    }

    /// The event announcing that a job entered `state`.
    pub fn entering(state: JobState) -> Self {
        match state {
            JobState::Queued => Self::Submitted,
            JobState::Running => Self::Started,
            JobState::Completed => Self::Completed,
            JobState::Failed => Self::Failed,
            JobState::Cancelled => Self::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job transition, carrying a consistent snapshot of the job taken
/// right after the transition was applied.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub event_type: JobEventKind,

    /// State before the transition; `None` for submissions.
    pub previous_state: Option<JobState>,

    pub job: Job,

    /// When the event was created (UTC).
    pub timestamp: Timestamp,
}

impl JobEvent {
    pub fn new(event_type: JobEventKind, previous_state: Option<JobState>, job: Job) -> Self {
        Self {
            event_type,
            previous_state,
            job,
            timestamp: Utc::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of receivers can
/// independently observe every published [`JobEvent`].
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current receivers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn publish(&self, event: JobEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use atelier_core::generation::{GenerationKind, GenerationRequest};
    use serde_json::json;

    use super::*;

    fn job(id: u64) -> Job {
        let request = GenerationRequest::new(GenerationKind::Image, json!({"prompt": "fox"})).unwrap();
        Job::new(JobId(id), request, Utc::now())
    }

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(JobEvent::new(JobEventKind::Submitted, None, job(42)));

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.event_type, JobEventKind::Submitted);
        assert_eq!(received.job_id(), JobId(42));
        assert!(received.previous_state.is_none());
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(JobEvent::new(JobEventKind::Submitted, None, job(1)));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");

        assert_eq!(e1.job_id(), e2.job_id());
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(JobEvent::new(JobEventKind::Removed, None, job(7)));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn event_serializes_with_wire_names() {
        let event = JobEvent::new(JobEventKind::Submitted, None, job(3));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], MSG_TYPE_JOB_SUBMITTED);
        assert_eq!(value["job"]["state"], "queued");
        assert_eq!(value["job"]["request"]["kind"], "image");
    }

    #[test]
    fn entering_maps_states_to_events() {
        assert_eq!(JobEventKind::entering(JobState::Running), JobEventKind::Started);
        assert_eq!(JobEventKind::entering(JobState::Failed), JobEventKind::Failed);
        assert!(JobEventKind::entering(JobState::Cancelled).is_terminal());
        assert!(!JobEventKind::Progress.is_terminal());
    }
}
