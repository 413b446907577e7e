//! Callback subscriptions with per-subscriber delivery queues.
//!
//! Every subscriber owns a queue drained by its own Tokio task, which
//! invokes the callback. [`SubscriptionRegistry::dispatch`] never waits.
//! A subscriber is detached (with a warning) only when it is actually stuck:
//! at least `buffer` events are waiting *and* the callback currently running
//! has been busy for longer than the stall timeout. A burst of events that
//! arrives before the delivery task got scheduled is not a stall. A detached
//! subscriber still receives what was queued before it was detached; its
//! task exits once that backlog is drained. A subscriber whose task has died
//! (the callback panicked) is detached as well.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::JobEvent;

/// Default number of undelivered events a subscriber may lag behind before
/// it becomes eligible for detaching.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Default time a single callback invocation may run before its subscriber
/// counts as stalled.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle returned by [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(uuid::Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery progress shared between the registry and a subscriber's task.
#[derive(Default)]
struct Delivery {
    /// Events sent but not yet taken off the queue.
    backlog: AtomicUsize,
    /// Start of the callback invocation in progress, if any.
    busy_since: Mutex<Option<Instant>>,
}

impl Delivery {
    fn busy_since(&self) -> MutexGuard<'_, Option<Instant>> {
        self.busy_since.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stalled_for(&self) -> Option<Duration> {
        self.busy_since().map(|since| since.elapsed())
    }
}

struct Subscriber {
    sender: mpsc::UnboundedSender<Arc<JobEvent>>,
    delivery: Arc<Delivery>,
    task: JoinHandle<()>,
}

/// Registry of callback subscribers.
pub struct SubscriptionRegistry {
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    buffer: usize,
    stall_timeout: Duration,
    runtime: Handle,
}

impl SubscriptionRegistry {
    /// Create a registry whose delivery tasks run on `runtime`.
    pub fn new(buffer: usize, runtime: Handle) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            runtime,
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Register a callback invoked for every dispatched event, in dispatch
    /// order.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(uuid::Uuid::new_v4());
        let (sender, mut rx) = mpsc::unbounded_channel::<Arc<JobEvent>>();
        let delivery = Arc::new(Delivery::default());

        let task = self.runtime.spawn({
            let delivery = Arc::clone(&delivery);
            async move {
                while let Some(event) = rx.recv().await {
                    delivery.backlog.fetch_sub(1, Ordering::AcqRel);
                    *delivery.busy_since() = Some(Instant::now());
                    callback(&event);
                    *delivery.busy_since() = None;
                }
            }
        });

        self.lock().insert(
            id,
            Subscriber {
                sender,
                delivery,
                task,
            },
        );
        tracing::debug!(subscription_id = %id, "Subscriber registered");
        id
    }

    /// Remove a subscriber and stop its delivery immediately. Returns
    /// `false` if the handle is unknown (for instance because the
    /// subscriber was already detached).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.lock().remove(&id) {
            Some(subscriber) => {
                subscriber.task.abort();
                tracing::debug!(subscription_id = %id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Queue `event` for every subscriber without blocking.
    pub fn dispatch(&self, event: JobEvent) {
        let event = Arc::new(event);
        let mut subscribers = self.lock();
        let mut detached = Vec::new();

        for (id, subscriber) in subscribers.iter() {
            let backlog = subscriber.delivery.backlog.load(Ordering::Acquire);
            if backlog >= self.buffer {
                if let Some(stalled) = subscriber.delivery.stalled_for() {
                    if stalled >= self.stall_timeout {
                        tracing::warn!(
                            subscription_id = %id,
                            backlog,
                            stalled_ms = stalled.as_millis() as u64,
                            job_id = %event.job_id(),
                            event_type = %event.event_type,
                            "Subscriber is not keeping up, detaching",
                        );
                        detached.push(*id);
                        continue;
                    }
                }
            }

            subscriber.delivery.backlog.fetch_add(1, Ordering::AcqRel);
            if subscriber.sender.send(Arc::clone(&event)).is_err() {
                tracing::warn!(subscription_id = %id, "Subscriber task stopped, detaching");
                detached.push(*id);
            }
        }

        // Dropping the sender lets the task drain its backlog and exit.
        for id in detached {
            subscribers.remove(&id);
        }
    }

    /// Number of attached subscribers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach every subscriber, discarding undelivered events.
    pub fn clear(&self) {
        for (_, subscriber) in self.lock().drain() {
            subscriber.task.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
