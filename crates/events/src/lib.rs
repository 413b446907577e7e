//! Job lifecycle event fan-out.
//!
//! - [`EventBus`] - in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`, for async consumers.
//! - [`JobEvent`] - the envelope published on every job transition.
//! - [`SubscriptionRegistry`] - callback subscribers, each fed through its
//!   own bounded queue so a slow callback never stalls job processing.
//! - [`JobEventHub`] - publishes every event to both of the above.

pub mod bus;
pub mod hub;
pub mod subscriptions;

pub use bus::{EventBus, JobEvent, JobEventKind};
pub use hub::JobEventHub;
pub use subscriptions::{SubscriptionId, SubscriptionRegistry};
