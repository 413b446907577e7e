//! Seams to the external generation capability.
//!
//! The engine never runs inference itself. A backend is reached either by
//! polling ([`PollingBackend`]) or by consuming pushed updates
//! ([`StreamingBackend`]); the matching reporters in
//! [`crate::reporter`] translate both into the same callbacks.

pub mod http;
pub mod simulated;

use std::fmt;

use async_trait::async_trait;
use atelier_core::generation::GenerationRequest;
use atelier_core::job::GenerationError;
use atelier_core::types::JobId;
use futures::stream::BoxStream;

pub use http::HttpBackend;
pub use simulated::SimulatedBackend;

/// One observation of a remote generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// Still running, with completion percentage (0-100).
    Progress(u8),
    /// Finished; opaque kind-specific payload (URL, text, handle).
    Completed(serde_json::Value),
    /// The capability reported an error.
    Failed(GenerationError),
}

impl ProgressUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

/// Backend-assigned handle for a submitted generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTicket(pub String);

impl fmt::Display for RemoteTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pushed updates for one generation.
pub type UpdateStream = BoxStream<'static, Result<ProgressUpdate, BackendError>>;

/// Poll-based generation capability.
#[async_trait]
pub trait PollingBackend: Send + Sync + 'static {
    /// Hand the request to the capability.
    async fn start(
        &self,
        job_id: JobId,
        request: &GenerationRequest,
    ) -> Result<RemoteTicket, BackendError>;

    /// Ask for the current status of a submitted generation.
    async fn poll(&self, ticket: &RemoteTicket) -> Result<ProgressUpdate, BackendError>;

    /// Best-effort request to stop a generation.
    async fn cancel(&self, ticket: &RemoteTicket) -> Result<(), BackendError>;
}

/// Push-based generation capability.
#[async_trait]
pub trait StreamingBackend: Send + Sync + 'static {
    /// Submit the request and return its stream of updates.
    async fn open(
        &self,
        job_id: JobId,
        request: &GenerationRequest,
    ) -> Result<UpdateStream, BackendError>;

    /// Best-effort request to stop a generation. Dropping the stream is
    /// the only signal by default.
    async fn cancel(&self, _job_id: JobId) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Errors talking to a generation capability.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Generation API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The capability refused the operation.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The capability answered with something we cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Record this error on a job under `code`.
    pub fn into_generation_error(self, code: &str) -> GenerationError {
        let details = match &self {
            Self::Api { status, .. } => Some(serde_json::json!({ "status": status })),
            _ => None,
        };
        let error = GenerationError::new(code, self.to_string());
        match details {
            Some(details) => error.with_details(details),
            None => error,
        }
    }
}
