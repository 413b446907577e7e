//! Generation jobs and their lifecycle state machine.
//!
//! A [`Job`] can only be mutated through its transition methods, each of
//! which checks the move against [`state_machine`] first and leaves the job
//! untouched when the move is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::generation::{GenerationKind, GenerationRequest};
use crate::types::{JobId, Timestamp};

/// Upper bound of [`Job::progress`].
pub const MAX_PROGRESS: u8 = 100;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, Failed and Cancelled accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod state_machine {
    use super::JobState;

    /// Returns the set of states reachable from `from`.
    ///
    /// Terminal states return an empty slice.
    pub fn valid_transitions(from: JobState) -> &'static [JobState] {
        match from {
            JobState::Queued => &[JobState::Running, JobState::Cancelled],
            JobState::Running => &[
                JobState::Running,
                JobState::Completed,
                JobState::Failed,
                JobState::Cancelled,
            ],
            JobState::Completed | JobState::Failed | JobState::Cancelled => &[],
        }
    }

    pub fn can_transition(from: JobState, to: JobState) -> bool {
        valid_transitions(from).contains(&to)
    }
}

/// A state-machine move that was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Job is already terminal ({0})")]
    AlreadyTerminal(JobState),

    #[error("Invalid transition: {from} -> {to}")]
    NotAllowed { from: JobState, to: JobState },

    #[error("Progress may not decrease ({current}% -> {attempted}%)")]
    ProgressRegression { current: u8, attempted: u8 },
}

// ---------------------------------------------------------------------------
// Generation errors
// ---------------------------------------------------------------------------

/// The external capability reported an error.
pub const ERR_BACKEND: &str = "backend_error";
/// The request could not be handed to the external capability.
pub const ERR_SUBMISSION_FAILED: &str = "submission_failed";
/// A push-based progress stream closed without a terminal event.
pub const ERR_STREAM_ENDED: &str = "stream_ended";
/// The progress reporter stopped without a terminal callback.
pub const ERR_REPORTER_EXITED: &str = "reporter_exited";

/// Structured failure detail recorded on a [`JobState::Failed`] job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GenerationError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A tracked unit of generation work.
///
/// Serialize-only; a job is built by [`Job::new`] and changed only by its
/// transition methods.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    id: JobId,
    request: GenerationRequest,
    state: JobState,
    progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<GenerationError>,
    created_at: Timestamp,
    updated_at: Timestamp,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
}

impl Job {
    /// A freshly submitted job: Queued, progress 0.
    pub fn new(id: JobId, request: GenerationRequest, now: Timestamp) -> Self {
        Self {
            id,
            request,
            state: JobState::Queued,
            progress: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> GenerationKind {
        self.request.kind()
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&GenerationError> {
        self.error.as_ref()
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<Timestamp> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Queued -> Running.
    pub fn start(&mut self, now: Timestamp) -> Result<(), TransitionError> {
        self.check(JobState::Running)?;
        if self.state != JobState::Queued {
            return Err(TransitionError::NotAllowed {
                from: self.state,
                to: JobState::Running,
            });
        }
        self.state = JobState::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Running -> Running with a new progress value.
    ///
    /// Values above [`MAX_PROGRESS`] are clamped. Returns `Ok(false)` when
    /// the value equals the current progress, in which case nothing changes.
    pub fn record_progress(&mut self, percent: u8, now: Timestamp) -> Result<bool, TransitionError> {
        if self.state != JobState::Running {
            self.check(JobState::Running)?;
            return Err(TransitionError::NotAllowed {
                from: self.state,
                to: JobState::Running,
            });
        }
        let percent = percent.min(MAX_PROGRESS);
        if percent < self.progress {
            return Err(TransitionError::ProgressRegression {
                current: self.progress,
                attempted: percent,
            });
        }
        if percent == self.progress {
            return Ok(false);
        }
        self.progress = percent;
        self.updated_at = now;
        Ok(true)
    }

    /// Running -> Completed. Progress is forced to 100.
    pub fn complete(&mut self, result: serde_json::Value, now: Timestamp) -> Result<(), TransitionError> {
        self.check(JobState::Completed)?;
        self.state = JobState::Completed;
        self.progress = MAX_PROGRESS;
        self.result = Some(result);
        self.finish(now);
        Ok(())
    }

    /// Running -> Failed.
    pub fn fail(&mut self, error: GenerationError, now: Timestamp) -> Result<(), TransitionError> {
        self.check(JobState::Failed)?;
        self.state = JobState::Failed;
        self.error = Some(error);
        self.finish(now);
        Ok(())
    }

    /// Queued or Running -> Cancelled. No result or error is stored.
    pub fn cancel(&mut self, now: Timestamp) -> Result<(), TransitionError> {
        self.check(JobState::Cancelled)?;
        self.state = JobState::Cancelled;
        self.finish(now);
        Ok(())
    }

    fn finish(&mut self, now: Timestamp) {
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    fn check(&self, to: JobState) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.state));
        }
        if !state_machine::can_transition(self.state, to) {
            return Err(TransitionError::NotAllowed {
                from: self.state,
                to,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

/// Predicate over `{kind, state}` used when listing jobs.
///
/// An empty filter matches every job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub kind: Option<GenerationKind>,
    #[serde(default)]
    pub state: Option<JobState>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(kind: GenerationKind) -> Self {
        Self {
            kind: Some(kind),
            state: None,
        }
    }

    pub fn state(state: JobState) -> Self {
        Self {
            kind: None,
            state: Some(state),
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.kind.map_or(true, |k| job.kind() == k) && self.state.map_or(true, |s| job.state() == s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
