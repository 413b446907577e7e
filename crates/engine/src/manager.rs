//! Public façade over the job engine.
//!
//! [`JobManager`] owns the store, the event hub and the scheduler. It is
//! created once via [`JobManager::start`]; the returned `Arc` can be cloned
//! freely into whatever presentation layer drives it.

use std::sync::Arc;

use atelier_core::error::CoreError;
use atelier_core::generation::{GenerationRequest, NewGenerationRequest};
use atelier_core::job::{Job, JobFilter};
use atelier_core::types::JobId;
use atelier_events::{JobEvent, JobEventHub, SubscriptionId};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use validator::Validate;

use crate::config::{ConfigError, EngineConfig};
use crate::reporter::ProgressReporter;
use crate::scheduler::{CancelOutcome, JobScheduler};
use crate::store::{JobStats, JobStore};

pub struct JobManager {
    config: EngineConfig,
    store: Arc<JobStore>,
    events: Arc<JobEventHub>,
    scheduler: JobScheduler,
}

impl JobManager {
    /// Validate `config` and build an engine whose reporter and subscriber
    /// tasks run on the current Tokio runtime.
    pub async fn start(
        config: EngineConfig,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let runtime = Handle::current();
        let store = Arc::new(JobStore::new());
        let events = Arc::new(JobEventHub::new(
            config.event_channel_capacity,
            config.subscriber_buffer,
            config.subscriber_stall_timeout(),
            runtime.clone(),
        ));
        let scheduler = JobScheduler::new(
            Arc::clone(&store),
            Arc::clone(&events),
            reporter,
            config.max_concurrent,
            runtime,
        );

        tracing::info!(
            max_concurrent = config.max_concurrent,
            strict_parameters = config.strict_parameters,
            "Job manager started",
        );
        Ok(Arc::new(Self {
            config,
            store,
            events,
            scheduler,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and enqueue a request. The returned snapshot is Queued with
    /// progress 0, even if the job was admitted immediately.
    ///
    /// Nothing is stored when validation fails.
    pub fn submit(&self, request: NewGenerationRequest) -> Result<Job, CoreError> {
        let request = GenerationRequest::from_new(request, self.config.parameter_rules())
            .inspect_err(|e| tracing::debug!(error = %e, "Rejected generation request"))?;
        self.submit_request(request)
    }

    /// Enqueue an already validated request.
    pub fn submit_request(&self, request: GenerationRequest) -> Result<Job, CoreError> {
        self.scheduler.submit(request)
    }

    /// Cancel a Queued or Running job. A terminal job is left untouched and
    /// reported as [`CancelOutcome::AlreadyTerminal`].
    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome, CoreError> {
        self.scheduler.cancel(id)
    }

    pub fn get(&self, id: JobId) -> Result<Job, CoreError> {
        self.store.get(id)
    }

    /// Snapshots of matching jobs ordered by `(created_at, id)`.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.store.list(filter)
    }

    pub fn stats(&self) -> JobStats {
        self.store.stats()
    }

    /// Cancel the job if still active and forget it.
    pub fn remove(&self, id: JobId) -> Result<Job, CoreError> {
        self.scheduler.remove(id)
    }

    /// Cancel all active jobs and forget every job. Returns the number
    /// removed.
    pub fn clear(&self) -> usize {
        self.scheduler.clear()
    }

    /// Register a callback for every job event. Callbacks run on a
    /// dedicated task per subscriber; one whose callback stalls while events
    /// pile up is detached.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Returns `false` if the handle was unknown or already detached.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Receiver over the broadcast bus.
    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.receiver()
    }

    pub fn running_count(&self) -> usize {
        self.scheduler.running_count()
    }

    /// Wait until `id` reaches a terminal state and return that snapshot.
    pub async fn wait_until_terminal(&self, id: JobId) -> Result<Job, CoreError> {
        let mut rx = self.events.receiver();
        loop {
            let job = self.store.get(id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            // Re-read the store on any event for this job or on lag.
            loop {
                match rx.recv().await {
                    Ok(event) if event.job_id() == id => break,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(job_id = %id, skipped, "Event receiver lagged");
                        break;
                    }
                    Err(RecvError::Closed) => {
                        return Err(CoreError::Internal("Event bus closed".into()));
                    }
                }
            }
        }
    }

    /// Stop admitting jobs, cancel everything still active and detach all
    /// subscribers.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job manager");
        self.scheduler
            .shutdown(self.config.shutdown_timeout())
            .await;
        self.events.close();
    }
}
