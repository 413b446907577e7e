//! Admission control for generation jobs.
//!
//! Jobs wait in a pending set ordered by `(created_at, id)` and are admitted
//! while fewer than `max_concurrent` are Running. Each admitted job gets a
//! child cancellation token and a reporter task. Every transition is applied
//! to the [`JobStore`] and published while the scheduler lock is held, so
//! events for one job are emitted in the order the transitions happened.
//!
//! Cancelling a Queued job only flips its state; its pending entry is
//! skipped when it reaches the front.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use atelier_core::error::CoreError;
use atelier_core::generation::GenerationRequest;
use atelier_core::job::{Job, JobFilter, JobState, TransitionError};
use atelier_core::types::{JobId, Timestamp};
use atelier_events::{JobEvent, JobEventHub, JobEventKind};
use chrono::Utc;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::reporter::{Outcome, ProgressReporter, ProgressSink, ReportContext, ReportTarget};
use crate::store::{JobStore, UpdateError};

/// Result of a cancel request on an existing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "state", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job moved to Cancelled.
    Cancelled,
    /// Nothing changed; the job had already reached this terminal state.
    AlreadyTerminal(JobState),
}

pub struct JobScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    me: Weak<Shared>,
    store: Arc<JobStore>,
    events: Arc<JobEventHub>,
    reporter: Arc<dyn ProgressReporter>,
    runtime: Handle,
    max_concurrent: usize,
    next_id: AtomicU64,
    state: Mutex<SchedulerState>,
    /// Master token; every reporter token is a child of it.
    shutdown: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    pending: BinaryHeap<Reverse<(Timestamp, JobId)>>,
    running: HashMap<JobId, RunningJob>,
    closed: bool,
}

struct RunningJob {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<JobStore>,
        events: Arc<JobEventHub>,
        reporter: Arc<dyn ProgressReporter>,
        max_concurrent: usize,
        runtime: Handle,
    ) -> Self {
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            store,
            events,
            reporter,
            runtime,
            max_concurrent: max_concurrent.max(1),
            next_id: AtomicU64::new(1),
            state: Mutex::new(SchedulerState::default()),
            shutdown: CancellationToken::new(),
        });
        Self { shared }
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }

    /// Create a Queued job for `request` and admit whatever fits.
    ///
    /// Returns the job as it was created, before any admission.
    pub fn submit(&self, request: GenerationRequest) -> Result<Job, CoreError> {
        let shared = &self.shared;
        let mut state = shared.lock();
        if state.closed {
            return Err(CoreError::Internal("Scheduler is shut down".into()));
        }

        let id = JobId(shared.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Job::new(id, request, Utc::now());
        shared.store.put(job.clone());
        state.pending.push(Reverse((job.created_at(), id)));

        tracing::info!(job_id = %id, kind = %job.kind(), "Job queued");
        shared.publish(JobEventKind::Submitted, None, job.clone());
        shared.admit_ready(&mut state);
        Ok(job)
    }

    /// Cancel a Queued or Running job.
    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome, CoreError> {
        let mut state = self.shared.lock();
        let (outcome, _) = self.shared.cancel_locked(&mut state, id, true)?;
        Ok(outcome)
    }

    /// Cancel the job if still active, then drop its record.
    pub fn remove(&self, id: JobId) -> Result<Job, CoreError> {
        let mut state = self.shared.lock();
        self.shared.cancel_locked(&mut state, id, true)?;
        let job = self.shared.store.remove(id)?;
        self.shared
            .publish(JobEventKind::Removed, Some(job.state()), job.clone());
        Ok(job)
    }

    /// Cancel every active job and drop all records. Returns how many
    /// records were dropped.
    pub fn clear(&self) -> usize {
        let shared = &self.shared;
        let mut state = shared.lock();
        state.pending.clear();
        for job in shared.store.list(&JobFilter::all()) {
            if !job.is_terminal() {
                // The job is known to exist; a concurrent terminal transition
                // simply leaves nothing to cancel.
                let _ = shared.cancel_locked(&mut state, job.id(), false);
            }
        }

        let removed = shared.store.clear();
        for job in &removed {
            shared.publish(JobEventKind::Removed, Some(job.state()), job.clone());
        }
        tracing::info!(count = removed.len(), "Job history cleared");
        removed.len()
    }

    pub fn running_count(&self) -> usize {
        self.shared.lock().running.len()
    }

    /// Stop admitting work, cancel every active job, and wait up to
    /// `timeout` per reporter task for a clean exit.
    pub async fn shutdown(&self, timeout: Duration) {
        let tasks = {
            let shared = &self.shared;
            let mut state = shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.clear();

            let mut tasks = Vec::new();
            for job in shared.store.list(&JobFilter::all()) {
                if job.is_terminal() {
                    continue;
                }
                if let Ok((_, Some(running))) = shared.cancel_locked(&mut state, job.id(), false) {
                    tasks.push((job.id(), running.task));
                }
            }
            shared.shutdown.cancel();
            tasks
        };

        tracing::info!(count = tasks.len(), "Waiting for reporter tasks to stop");
        for (id, task) in tasks {
            if tokio::time::timeout(timeout, task).await.is_err() {
                tracing::warn!(job_id = %id, "Reporter task did not stop in time");
            }
        }
        tracing::info!("Job scheduler shut down");
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, kind: JobEventKind, previous: Option<JobState>, job: Job) {
        self.events.publish(JobEvent::new(kind, previous, job));
    }

    /// Admit pending jobs while there is capacity.
    fn admit_ready(&self, state: &mut SchedulerState) {
        if state.closed {
            return;
        }
        while state.running.len() < self.max_concurrent {
            let Some(Reverse((_, id))) = state.pending.pop() else {
                break;
            };
            let now = Utc::now();
            match self.store.update(id, |job| job.start(now)) {
                Ok(((), job)) => self.launch(state, job),
                // Cancelled or removed while waiting.
                Err(e) => tracing::trace!(job_id = %id, error = %e, "Skipping stale pending entry"),
            }
        }
    }

    fn launch(&self, state: &mut SchedulerState, job: Job) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let id = job.id();
        let cancel = self.shutdown.child_token();
        let ctx = ReportContext {
            job_id: id,
            request: job.request().clone(),
            cancel: cancel.clone(),
        };
        let reporter = Arc::clone(&self.reporter);
        let target: Arc<dyn ReportTarget> = me;

        let task = self.runtime.spawn(async move {
            // Built inside the task so that a task dropped before its first
            // poll never reports on the job.
            let sink = ProgressSink::new(id, target);
            reporter.report(ctx, sink).await;
        });
        state.running.insert(id, RunningJob { cancel, task });

        tracing::info!(
            job_id = %id,
            kind = %job.kind(),
            running = state.running.len(),
            "Job admitted",
        );
        self.publish(JobEventKind::Started, Some(JobState::Queued), job);
    }

    /// Cancel `id` under the held lock.
    ///
    /// Returns the outcome and, for a job that was Running, its detached
    /// bookkeeping (already signalled). When `admit` is set, freed capacity
    /// is handed to the next pending job.
    fn cancel_locked(
        &self,
        state: &mut SchedulerState,
        id: JobId,
        admit: bool,
    ) -> Result<(CancelOutcome, Option<RunningJob>), CoreError> {
        let now = Utc::now();
        let cancelled = self.store.update(id, |job| {
            let previous = job.state();
            job.cancel(now).map(|()| previous)
        });

        match cancelled {
            Ok((previous, job)) => {
                let running = state.running.remove(&id);
                if let Some(running) = &running {
                    running.cancel.cancel();
                }
                tracing::info!(job_id = %id, from = %previous, "Job cancelled");
                self.publish(JobEventKind::Cancelled, Some(previous), job);
                if admit && running.is_some() {
                    self.admit_ready(state);
                }
                Ok((CancelOutcome::Cancelled, running))
            }
            Err(UpdateError::Rejected(TransitionError::AlreadyTerminal(terminal))) => {
                tracing::debug!(job_id = %id, state = %terminal, "Cancel ignored, job already terminal");
                Ok((CancelOutcome::AlreadyTerminal(terminal), None))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl ReportTarget for Shared {
    fn progress(&self, job_id: JobId, percent: u8) {
        let state = self.lock();
        if !state.running.contains_key(&job_id) {
            tracing::trace!(job_id = %job_id, percent, "Progress for inactive job suppressed");
            return;
        }
        let now = Utc::now();
        match self.store.update(job_id, |job| job.record_progress(percent, now)) {
            Ok((true, job)) => {
                tracing::debug!(job_id = %job_id, percent = job.progress(), "Job progress");
                self.publish(JobEventKind::Progress, Some(JobState::Running), job);
            }
            Ok((false, _)) => {}
            Err(e) => {
                tracing::debug!(job_id = %job_id, percent, error = %e, "Progress update ignored");
            }
        }
    }

    fn finish(&self, job_id: JobId, outcome: Outcome) {
        let mut state = self.lock();
        if state.running.remove(&job_id).is_none() {
            tracing::trace!(job_id = %job_id, "Outcome for inactive job suppressed");
            return;
        }

        let now = Utc::now();
        let finished = match outcome {
            Outcome::Completed(result) => self.store.update(job_id, |job| job.complete(result, now)),
            Outcome::Failed(error) => self.store.update(job_id, |job| job.fail(error, now)),
        };

        match finished {
            Ok(((), job)) => {
                match job.error() {
                    None => tracing::info!(job_id = %job_id, kind = %job.kind(), "Job completed"),
                    Some(error) => tracing::warn!(
                        job_id = %job_id,
                        kind = %job.kind(),
                        code = %error.code,
                        error = %error.message,
                        "Job failed",
                    ),
                }
                self.publish(JobEventKind::entering(job.state()), Some(JobState::Running), job);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
            }
        }

        self.admit_ready(&mut state);
    }
}
