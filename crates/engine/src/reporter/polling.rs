//! Poll-based reporter: periodic status checks against a
//! [`PollingBackend`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atelier_core::job::{ERR_BACKEND, ERR_SUBMISSION_FAILED};
use tokio::time::MissedTickBehavior;

use super::{ProgressReporter, ProgressSink, ReportContext};
use crate::backend::{PollingBackend, RemoteTicket};

pub struct PollingReporter<B> {
    backend: Arc<B>,
    interval: Duration,
}

impl<B: PollingBackend> PollingReporter<B> {
    pub fn new(backend: Arc<B>, interval: Duration) -> Self {
        Self { backend, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Best-effort: the remote generation may keep running.
    async fn cancel_remote(&self, ctx: &ReportContext, ticket: &RemoteTicket) {
        match self.backend.cancel(ticket).await {
            Ok(()) => {
                tracing::info!(job_id = %ctx.job_id, ticket = %ticket, "Remote generation cancel requested");
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %ctx.job_id,
                    ticket = %ticket,
                    error = %e,
                    "Remote cancel failed, generation may continue",
                );
            }
        }
    }
}

#[async_trait]
impl<B: PollingBackend> ProgressReporter for PollingReporter<B> {
    async fn report(&self, ctx: ReportContext, sink: ProgressSink) {
        let started = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = self.backend.start(ctx.job_id, &ctx.request) => result,
        };
        let ticket = match started {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::error!(job_id = %ctx.job_id, error = %e, "Failed to submit generation");
                sink.on_error(e.into_generation_error(ERR_SUBMISSION_FAILED));
                return;
            }
        };

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the first poll waits one interval.
        ticker.tick().await;

        let mut sink = sink;
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    self.cancel_remote(&ctx, &ticket).await;
                    return;
                }
                _ = ticker.tick() => {}
            }

            let polled = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    self.cancel_remote(&ctx, &ticket).await;
                    return;
                }
                result = self.backend.poll(&ticket) => result,
            };

            match polled {
                Ok(update) => {
                    tracing::trace!(job_id = %ctx.job_id, ?update, "Polled generation status");
                    match sink.apply(update) {
                        Some(still_running) => sink = still_running,
                        None => return,
                    }
                }
                Err(e) => {
                    tracing::error!(job_id = %ctx.job_id, ticket = %ticket, error = %e, "Status poll failed");
                    sink.on_error(e.into_generation_error(ERR_BACKEND));
                    return;
                }
            }
        }
    }
}
