//! Process-wide event bus.
//!
//! Decouples producers (multiplexer, process supervisors, channels) from
//! consumers (the host's lifecycle loop, tests, operators).
//!
//! ```text
//!   Supervisor ──┐                     ┌──► [queue] ──► Subscription::recv()
//!   Multiplexer ─┼──► EventBus::publish┼──► [queue] ──► Subscription::recv()
//!   Channel ─────┘    (predicate match)└──► [queue] ──► handler task (catch_unwind)
//! ```
//!
//! - `publish` never blocks: each subscriber owns an unbounded queue.
//! - Each subscriber sees events in publish order; there is no ordering
//!   across subscribers.
//! - A panicking handler is logged and skipped; delivery to other
//!   subscribers is unaffected.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::pair::WorkerId;

/// Lifecycle events published by host components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A worker failed: crash, failed init, or fatal protocol error.
    WorkerError {
        worker_id: WorkerId,
        runtime: String,
        error: String,
    },
    /// A worker process exited during steady-state operation.
    WorkerRestart { worker_id: WorkerId, runtime: String },
    /// A channel finished loading functions and accepts invocations.
    ChannelReady { worker_id: WorkerId, runtime: String },
    /// A worker connection completed its handshake.
    StreamEstablished { worker_id: WorkerId, generation: u64 },
    /// A worker connection ended.
    StreamClosed {
        worker_id: WorkerId,
        generation: u64,
        error: Option<String>,
    },
    /// A runtime exhausted its restart budget.
    RuntimeUnavailable { runtime: String, attempts: u32 },
}

/// Discriminator for [`HostEvent`], used in subscription predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    WorkerError,
    WorkerRestart,
    ChannelReady,
    StreamEstablished,
    StreamClosed,
    RuntimeUnavailable,
}

impl HostEvent {
    /// Returns the event's kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::WorkerError { .. } => EventKind::WorkerError,
            Self::WorkerRestart { .. } => EventKind::WorkerRestart,
            Self::ChannelReady { .. } => EventKind::ChannelReady,
            Self::StreamEstablished { .. } => EventKind::StreamEstablished,
            Self::StreamClosed { .. } => EventKind::StreamClosed,
            Self::RuntimeUnavailable { .. } => EventKind::RuntimeUnavailable,
        }
    }

    /// Returns the worker the event concerns, if any.
    #[must_use]
    pub const fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            Self::WorkerError { worker_id, .. }
            | Self::WorkerRestart { worker_id, .. }
            | Self::ChannelReady { worker_id, .. }
            | Self::StreamEstablished { worker_id, .. }
            | Self::StreamClosed { worker_id, .. } => Some(worker_id),
            Self::RuntimeUnavailable { .. } => None,
        }
    }
}

type Predicate = Box<dyn Fn(&HostEvent) -> bool + Send + Sync>;

struct Subscriber {
    id: u64,
    predicate: Predicate,
    sender: mpsc::UnboundedSender<HostEvent>,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Cloneable handle to the shared bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Identifies a subscription for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A queue of events matching the subscription's predicate.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<HostEvent>,
    bus: EventBus,
}

impl Subscription {
    /// Returns the subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next matching event.
    ///
    /// Returns `None` once the subscription has been removed from the bus.
    pub async fn recv(&mut self) -> Option<HostEvent> {
        self.receiver.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<HostEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers an event to every subscriber whose predicate matches.
    pub fn publish(&self, event: HostEvent) {
        let mut closed = Vec::new();
        {
            let subscribers = self.inner.subscribers.read();
            for subscriber in subscribers.iter() {
                let matches =
                    std::panic::catch_unwind(AssertUnwindSafe(|| (subscriber.predicate)(&event)));
                match matches {
                    Ok(true) => {
                        if subscriber.sender.send(event.clone()).is_err() {
                            closed.push(subscriber.id);
                        }
                    }
                    Ok(false) => {}
                    Err(_) => {
                        error!(subscriber = subscriber.id, kind = ?event.kind(), "Subscriber predicate panicked");
                    }
                }
            }
        }

        if !closed.is_empty() {
            self.inner
                .subscribers
                .write()
                .retain(|s| !closed.contains(&s.id));
        }
    }

    /// Subscribes to events matching `predicate`.
    pub fn subscribe<P>(&self, predicate: P) -> Subscription
    where
        P: Fn(&HostEvent) -> bool + Send + Sync + 'static,
    {
        let (id, receiver) = self.add_subscriber(Box::new(predicate));
        Subscription {
            id,
            receiver,
            bus: self.clone(),
        }
    }

    /// Subscribes to every event of the given kinds.
    pub fn subscribe_kinds(&self, kinds: &[EventKind]) -> Subscription {
        let kinds = kinds.to_vec();
        self.subscribe(move |event| kinds.contains(&event.kind()))
    }

    /// Runs `handler` on its own task for each matching event.
    ///
    /// A panic inside the handler is logged and the task moves on to the
    /// next event. The task ends when the returned subscription id is
    /// unsubscribed.
    pub fn subscribe_fn<P, H>(&self, predicate: P, handler: H) -> (SubscriptionId, JoinHandle<()>)
    where
        P: Fn(&HostEvent) -> bool + Send + Sync + 'static,
        H: Fn(HostEvent) + Send + Sync + 'static,
    {
        let (id, mut receiver) = self.add_subscriber(Box::new(predicate));

        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let kind = event.kind();
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
                if let Err(panic) = outcome {
                    error!(subscriber = id.0, kind = ?kind, panic = %panic_message(&*panic), "Bus subscriber panicked");
                }
            }
        });

        (id, handle)
    }

    fn add_subscriber(
        &self,
        predicate: Predicate,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<HostEvent>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.subscribers.write().push(Subscriber {
            id,
            predicate,
            sender,
        });
        debug!(subscriber = id, "Bus subscriber added");
        (SubscriptionId(id), receiver)
    }

    /// Removes a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id.0);
        if subscribers.len() != before {
            debug!(subscriber = id.0, "Bus subscriber removed");
        }
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
