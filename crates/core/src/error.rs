use crate::types::JobId;

/// Errors surfaced synchronously to callers of the job manager.
///
/// Asynchronous generation failures are never reported through this type;
/// they are recorded on the job as a [`GenerationError`](crate::job::GenerationError).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Internal error: {0}")]
    Internal(String),
}
