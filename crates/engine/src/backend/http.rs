//! REST client for a remote generation service, used by the polling
//! reporter.
//!
//! | Operation | Request                                   |
//! |-----------|-------------------------------------------|
//! | start     | `POST {base}/v1/generations`              |
//! | poll      | `GET {base}/v1/generations/{id}`          |
//! | cancel    | `POST {base}/v1/generations/{id}/cancel`  |

use async_trait::async_trait;
use atelier_core::generation::{GenerationKind, GenerationRequest};
use atelier_core::job::{GenerationError, ERR_BACKEND, MAX_PROGRESS};
use atelier_core::types::JobId;
use serde::{Deserialize, Serialize};

use super::{BackendError, PollingBackend, ProgressUpdate, RemoteTicket};

/// HTTP client for one generation service.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct CreateGeneration<'a> {
    job_id: JobId,
    kind: GenerationKind,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CreatedGeneration {
    id: String,
}

/// Remote lifecycle states as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// Body of `GET /v1/generations/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteStatus {
    pub status: RemoteState,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

impl RemoteStatus {
    /// Map the service's view of a generation onto a [`ProgressUpdate`].
    pub fn into_update(self) -> Result<ProgressUpdate, BackendError> {
        match self.status {
            RemoteState::Queued => Ok(ProgressUpdate::Progress(0)),
            RemoteState::Running => {
                let percent = self
                    .progress
                    .unwrap_or(0.0)
                    .clamp(0.0, f64::from(MAX_PROGRESS));
                Ok(ProgressUpdate::Progress(percent as u8))
            }
            RemoteState::Completed => self
                .result
                .map(ProgressUpdate::Completed)
                .ok_or_else(|| BackendError::Protocol("Completed generation has no result".into())),
            RemoteState::Failed => {
                let error = match self.error {
                    Some(e) => GenerationError::new(
                        e.code.unwrap_or_else(|| ERR_BACKEND.to_string()),
                        e.message,
                    ),
                    None => GenerationError::new(ERR_BACKEND, "Generation failed"),
                };
                Ok(ProgressUpdate::Failed(error))
            }
            RemoteState::Cancelled => Ok(ProgressUpdate::Failed(GenerationError::new(
                ERR_BACKEND,
                "Generation was cancelled by the service",
            ))),
        }
    }
}

impl HttpBackend {
    /// * `base_url` - service root, e.g. `http://host:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn generation_url(&self, ticket: &RemoteTicket) -> String {
        format!("{}/v1/generations/{}", self.base_url, ticket)
    }

    /// Return the response unchanged on success, or an
    /// [`BackendError::Api`] with the status and body text.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl PollingBackend for HttpBackend {
    async fn start(
        &self,
        job_id: JobId,
        request: &GenerationRequest,
    ) -> Result<RemoteTicket, BackendError> {
        let body = CreateGeneration {
            job_id,
            kind: request.kind(),
            parameters: request.parameters(),
        };
        let response = self
            .client
            .post(format!("{}/v1/generations", self.base_url))
            .json(&body)
            .send()
            .await?;
        let created: CreatedGeneration = Self::parse_response(response).await?;

        tracing::info!(
            job_id = %job_id,
            remote_id = %created.id,
            "Generation submitted to remote service",
        );
        Ok(RemoteTicket(created.id))
    }

    async fn poll(&self, ticket: &RemoteTicket) -> Result<ProgressUpdate, BackendError> {
        let response = self.client.get(self.generation_url(ticket)).send().await?;
        let status: RemoteStatus = Self::parse_response(response).await?;
        status.into_update()
    }

    async fn cancel(&self, ticket: &RemoteTicket) -> Result<(), BackendError> {
        let response = self
            .client
            .post(format!("{}/cancel", self.generation_url(ticket)))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }
}
