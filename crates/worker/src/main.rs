//! `atelier-worker` -- runs the generation job engine against a backend and
//! pushes one request of every kind through it.
//!
//! # Environment variables
//!
//! | Variable               | Required | Default             | Description                                  |
//! |------------------------|----------|---------------------|----------------------------------------------|
//! | `GENERATION_BACKEND`   | no       | `simulated-polling` | `simulated-polling`, `simulated-streaming` or `http` |
//! | `GENERATION_API_URL`   | for http | --                  | Root URL of the remote generation service    |
//! | `LOG_FORMAT`           | no       | `pretty`            | `json` for one JSON object per line          |
//!
//! Engine settings (`MAX_CONCURRENT_JOBS`, `POLL_INTERVAL_MS`, ...) are read
//! by [`EngineConfig::from_env`].

use std::sync::Arc;

use atelier_core::generation::NewGenerationRequest;
use atelier_core::job::{Job, JobFilter};
use atelier_engine::backend::{HttpBackend, SimulatedBackend};
use atelier_engine::reporter::{PollingReporter, ProgressReporter, StreamingReporter};
use atelier_engine::{EngineConfig, JobManager};
use atelier_events::JobEvent;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = EngineConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid engine configuration");
        std::process::exit(1);
    });

    let backend = std::env::var("GENERATION_BACKEND").unwrap_or_else(|_| "simulated-polling".into());
    let reporter = build_reporter(&backend, &config).unwrap_or_else(|message| {
        tracing::error!(backend = %backend, "{message}");
        std::process::exit(1);
    });

    tracing::info!(
        backend = %backend,
        max_concurrent = config.max_concurrent,
        poll_interval_ms = config.poll_interval_ms,
        "Starting atelier-worker",
    );

    let manager = JobManager::start(config, reporter)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to start job manager");
            std::process::exit(1);
        });
    let subscription = manager.subscribe(log_event);

    let mut submitted = Vec::new();
    for request in demo_requests() {
        match manager.submit(request) {
            Ok(job) => submitted.push(job.id()),
            Err(e) => tracing::warn!(error = %e, "Request rejected"),
        }
    }

    let waits = futures::future::join_all(
        submitted
            .iter()
            .map(|id| manager.wait_until_terminal(*id)),
    );
    tokio::select! {
        finished = waits => {
            for job in finished.into_iter().flatten() {
                log_summary(&job);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, cancelling outstanding jobs");
        }
    }

    let stats = manager.stats();
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        remaining = manager.list(&JobFilter::all()).iter().filter(|j| !j.is_terminal()).count(),
        "Run finished",
    );

    manager.unsubscribe(subscription);
    manager.shutdown().await;
}

/// Initialize the global subscriber. `LOG_FORMAT=json` switches to JSON
/// lines; the filter comes from `RUST_LOG`.
fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier_worker=debug,atelier_engine=debug".into()),
        )
        .with(fmt_layer)
        .init();
}

fn build_reporter(
    backend: &str,
    config: &EngineConfig,
) -> Result<Arc<dyn ProgressReporter>, String> {
    match backend {
        "simulated-polling" => Ok(Arc::new(PollingReporter::new(
            Arc::new(SimulatedBackend::new()),
            config.poll_interval(),
        ))),
        "simulated-streaming" => Ok(Arc::new(StreamingReporter::new(Arc::new(
            SimulatedBackend::new(),
        )))),
        "http" => {
            let url = std::env::var("GENERATION_API_URL")
                .map_err(|_| "GENERATION_API_URL environment variable is required".to_string())?;
            Ok(Arc::new(PollingReporter::new(
                Arc::new(HttpBackend::new(url)),
                config.poll_interval(),
            )))
        }
        other => Err(format!("Unknown GENERATION_BACKEND '{other}'")),
    }
}

fn demo_requests() -> Vec<NewGenerationRequest> {
    vec![
        NewGenerationRequest::new("chat", json!({"prompt": "Summarize the plot of Hamlet"})),
        NewGenerationRequest::new(
            "image",
            json!({"prompt": "A lighthouse at dusk", "style": "watercolor", "size": "1024x1024"}),
        ),
        NewGenerationRequest::new(
            "video",
            json!({"prompt": "Waves rolling onto a beach", "duration_secs": 5, "resolution": "720p"}),
        ),
        NewGenerationRequest::new(
            "music",
            json!({"title": "Harbor Lights", "genre": "ambient", "mood": "calm", "duration_secs": 60}),
        ),
        NewGenerationRequest::new(
            "ppt",
            json!({"title": "Quarterly review", "template": "minimal", "slides": 8}),
        ),
    ]
}

fn log_event(event: &JobEvent) {
    tracing::debug!(
        job_id = %event.job_id(),
        event_type = %event.event_type,
        state = %event.job.state(),
        progress = event.job.progress(),
        "Job event",
    );
}

fn log_summary(job: &Job) {
    match (job.result(), job.error()) {
        (Some(result), _) => tracing::info!(
            job_id = %job.id(),
            kind = %job.kind(),
            result = %result,
            "Generation finished",
        ),
        (None, Some(error)) => tracing::warn!(
            job_id = %job.id(),
            kind = %job.kind(),
            code = %error.code,
            error = %error.message,
            "Generation failed",
        ),
        (None, None) => tracing::info!(job_id = %job.id(), state = %job.state(), "Generation ended"),
    }
}
