//! Generation job engine.
//!
//! [`JobManager`](manager::JobManager) is the single entry point for a
//! presentation layer: it validates requests, keeps every job in the
//! [`JobStore`](store::JobStore), admits work through the
//! [`JobScheduler`](scheduler::JobScheduler) under a concurrency limit, and
//! attaches a [`ProgressReporter`](reporter::ProgressReporter) to each
//! admitted job. Reporters talk to the external generation capability
//! through the traits in [`backend`].

pub mod backend;
pub mod config;
pub mod manager;
pub mod reporter;
pub mod scheduler;
pub mod store;

pub use config::EngineConfig;
pub use manager::JobManager;
pub use scheduler::CancelOutcome;
