//! Domain types for the generation job manager.
//!
//! This crate has zero internal dependencies so it can be shared by the
//! event layer, the engine, and any presentation-side tooling.

pub mod error;
pub mod generation;
pub mod job;
pub mod job_events;
pub mod types;
