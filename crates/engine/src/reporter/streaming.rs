//! Push-based reporter: consumes the update stream of a
//! [`StreamingBackend`].

use std::sync::Arc;

use async_trait::async_trait;
use atelier_core::job::{GenerationError, ERR_BACKEND, ERR_STREAM_ENDED, ERR_SUBMISSION_FAILED};
use futures::StreamExt;

use super::{ProgressReporter, ProgressSink, ReportContext};
use crate::backend::StreamingBackend;

pub struct StreamingReporter<B> {
    backend: Arc<B>,
}

impl<B: StreamingBackend> StreamingReporter<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    async fn cancel_remote(&self, ctx: &ReportContext) {
        if let Err(e) = self.backend.cancel(ctx.job_id).await {
            tracing::warn!(
                job_id = %ctx.job_id,
                error = %e,
                "Remote cancel failed, generation may continue",
            );
        }
    }
}

#[async_trait]
impl<B: StreamingBackend> ProgressReporter for StreamingReporter<B> {
    async fn report(&self, ctx: ReportContext, sink: ProgressSink) {
        let opened = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = self.backend.open(ctx.job_id, &ctx.request) => result,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(job_id = %ctx.job_id, error = %e, "Failed to open generation stream");
                sink.on_error(e.into_generation_error(ERR_SUBMISSION_FAILED));
                return;
            }
        };

        let mut sink = sink;
        loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    drop(stream);
                    self.cancel_remote(&ctx).await;
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(update)) => match sink.apply(update) {
                    Some(still_running) => sink = still_running,
                    None => return,
                },
                Some(Err(e)) => {
                    tracing::error!(job_id = %ctx.job_id, error = %e, "Generation stream error");
                    sink.on_error(e.into_generation_error(ERR_BACKEND));
                    return;
                }
                None => {
                    tracing::warn!(job_id = %ctx.job_id, "Generation stream closed without a result");
                    sink.on_error(GenerationError::new(
                        ERR_STREAM_ENDED,
                        "Update stream closed before the generation finished",
                    ));
                    return;
                }
            }
        }
    }
}
