//! Canonical in-memory state of all submitted jobs.
//!
//! Every mutation runs against a draft copy of the job and is committed in
//! one assignment under the write lock, so readers only ever see whole
//! transitions. No I/O happens while the lock is held.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use atelier_core::error::CoreError;
use atelier_core::job::{Job, JobFilter, JobState, TransitionError};
use atelier_core::types::JobId;
use serde::Serialize;

/// Why [`JobStore::update`] did not commit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Rejected(#[from] TransitionError),
}

impl From<UpdateError> for CoreError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::NotFound(id) => CoreError::NotFound(id),
            UpdateError::Rejected(e) => CoreError::Internal(e.to_string()),
        }
    }
}

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.completed + self.failed + self.cancelled
    }

    fn count(&mut self, state: JobState) {
        match state {
            JobState::Queued => self.queued += 1,
            JobState::Running => self.running += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job.
    pub fn put(&self, job: Job) {
        self.write().insert(job.id(), job);
    }

    pub fn get(&self, id: JobId) -> Result<Job, CoreError> {
        self.read().get(&id).cloned().ok_or(CoreError::NotFound(id))
    }

    /// Snapshot of the matching jobs, ordered by `(created_at, id)`.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .read()
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at(), job.id()));
        jobs
    }

    /// Apply `f` to a draft of the job and commit it only if `f` succeeds.
    ///
    /// Returns `f`'s output together with a snapshot of the committed job.
    pub fn update<T, F>(&self, id: JobId, f: F) -> Result<(T, Job), UpdateError>
    where
        F: FnOnce(&mut Job) -> Result<T, TransitionError>,
    {
        let mut jobs = self.write();
        let job = jobs.get_mut(&id).ok_or(UpdateError::NotFound(id))?;
        let mut draft = job.clone();
        let output = f(&mut draft)?;
        *job = draft.clone();
        Ok((output, draft))
    }

    pub fn remove(&self, id: JobId) -> Result<Job, CoreError> {
        self.write().remove(&id).ok_or(CoreError::NotFound(id))
    }

    /// Drop every job, returning the removed records in list order.
    pub fn clear(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.write().drain().map(|(_, job)| job).collect();
        jobs.sort_by_key(|job| (job.created_at(), job.id()));
        jobs
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for job in self.read().values() {
            stats.count(job.state());
        }
        stats
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use atelier_core::generation::{GenerationKind, GenerationRequest};
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::*;

    fn job(id: u64, kind: GenerationKind, offset_ms: i64) -> Job {
        let request = GenerationRequest::new(kind, json!({})).unwrap();
        Job::new(JobId(id), request, Utc::now() + Duration::milliseconds(offset_ms))
    }

    #[test]
    fn get_unknown_is_not_found() {
        let store = JobStore::new();
        assert_matches!(store.get(JobId(1)), Err(CoreError::NotFound(JobId(1))));
    }

    #[test]
    fn list_is_ordered_by_creation_then_id() {
        let store = JobStore::new();
        let base = Utc::now();
        let request = GenerationRequest::new(GenerationKind::Chat, json!({})).unwrap();
        store.put(Job::new(JobId(3), request.clone(), base));
        store.put(Job::new(JobId(2), request.clone(), base));
        store.put(Job::new(JobId(1), request, base + Duration::seconds(1)));

        let ids: Vec<u64> = store.list(&JobFilter::all()).iter().map(|j| j.id().get()).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn list_applies_filter() {
        let store = JobStore::new();
        store.put(job(1, GenerationKind::Image, 0));
        store.put(job(2, GenerationKind::Music, 1));
        store.put(job(3, GenerationKind::Image, 2));

        assert_eq!(store.list(&JobFilter::kind(GenerationKind::Image)).len(), 2);
        assert_eq!(store.list(&JobFilter::state(JobState::Running)).len(), 0);
    }

    #[test]
    fn rejected_update_leaves_job_untouched() {
        let store = JobStore::new();
        store.put(job(1, GenerationKind::Video, 0));
        let before = store.get(JobId(1)).unwrap();

        let result = store.update(JobId(1), |j| j.complete(json!({}), Utc::now()));
        assert_matches!(result, Err(UpdateError::Rejected(TransitionError::NotAllowed { .. })));
        assert_eq!(store.get(JobId(1)).unwrap(), before);
    }

    #[test]
    fn committed_update_returns_snapshot() {
        let store = JobStore::new();
        store.put(job(1, GenerationKind::Video, 0));

        let ((), snapshot) = store.update(JobId(1), |j| j.start(Utc::now())).unwrap();
        assert_eq!(snapshot.state(), JobState::Running);
        assert_eq!(store.get(JobId(1)).unwrap(), snapshot);
    }

    #[test]
    fn remove_clear_and_stats() {
        let store = JobStore::new();
        for id in 1..=4 {
            store.put(job(id, GenerationKind::Slides, id as i64));
        }
        store.update(JobId(2), |j| j.start(Utc::now())).unwrap();

        let stats = store.stats();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.total(), 4);

        assert_eq!(store.remove(JobId(1)).unwrap().id(), JobId(1));
        assert_matches!(store.remove(JobId(1)), Err(CoreError::NotFound(_)));
        assert_eq!(store.clear().len(), 3);
        assert!(store.is_empty());
    }
}
