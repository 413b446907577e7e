//! Event type names for job lifecycle notifications.
//!
//! Used by the event layer when publishing transitions and by any
//! presentation bridge that forwards them (e.g. over a WebSocket).

/// Job accepted and placed in the queue.
pub const MSG_TYPE_JOB_SUBMITTED: &str = "job_submitted";

/// Job admitted by the scheduler and a reporter attached.
pub const MSG_TYPE_JOB_STARTED: &str = "job_started";

/// Progress update during job execution (percentage).
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";

/// Job completed successfully.
pub const MSG_TYPE_JOB_COMPLETED: &str = "job_completed";

/// Job failed with an error.
pub const MSG_TYPE_JOB_FAILED: &str = "job_failed";

/// Job was cancelled (by user or shutdown).
pub const MSG_TYPE_JOB_CANCELLED: &str = "job_cancelled";

/// Job record dropped from the store.
pub const MSG_TYPE_JOB_REMOVED: &str = "job_removed";
