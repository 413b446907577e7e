//! Single publishing point for job events.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::bus::{EventBus, JobEvent};
use crate::subscriptions::{SubscriptionId, SubscriptionRegistry};

/// Publishes each [`JobEvent`] to callback subscribers and to the
/// broadcast bus.
pub struct JobEventHub {
    bus: EventBus,
    registry: SubscriptionRegistry,
}

impl JobEventHub {
    /// * `bus_capacity`      - broadcast buffer before receivers lag.
    /// * `subscriber_buffer` - callback backlog before a stalled callback is
    ///   detached.
    /// * `stall_timeout`     - how long one callback may run before its
    ///   subscriber counts as stalled.
    pub fn new(
        bus_capacity: usize,
        subscriber_buffer: usize,
        stall_timeout: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            bus: EventBus::new(bus_capacity),
            registry: SubscriptionRegistry::new(subscriber_buffer, runtime)
                .with_stall_timeout(stall_timeout),
        }
    }

    pub fn publish(&self, event: JobEvent) {
        tracing::trace!(
            job_id = %event.job_id(),
            event_type = %event.event_type,
            "Publishing job event",
        );
        if !self.registry.is_empty() {
            self.registry.dispatch(event.clone());
        }
        self.bus.publish(event);
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn receiver(&self) -> broadcast::Receiver<JobEvent> {
        self.bus.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Detach all callback subscribers.
    pub fn close(&self) {
        self.registry.clear();
    }
}
