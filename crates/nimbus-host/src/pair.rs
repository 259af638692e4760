//! Per-worker inbound/outbound queue pairs.
//!
//! A [`ChannelPair`] is registered by the host before a worker process is
//! spawned. When the worker connects and names itself in `StartStream`, the
//! multiplexer [attaches](ChannelPairRegistry::attach) to the wire side of the
//! same pair. Both queues are unbounded so the pull loop can never deadlock
//! against its own consumer.
//!
//! Every registration is stamped with a generation. Removal only succeeds for
//! the matching generation, and it fires the pair's close token under the
//! same map entry lock that `attach` takes. Whichever runs first wins. A
//! handshake that loses the race sees an unknown worker. A handshake that
//! wins is torn down through the close token.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nimbus_proto::StreamingMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{HostError, Result};

/// Opaque identifier of one worker process. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(Arc<str>);

impl WorkerId {
    /// Generates a fresh random worker id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

/// A frame read from the wire, tagged with the worker that sent it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub worker_id: WorkerId,
    pub message: StreamingMessage,
}

/// Logical side of a pair, owned by the worker channel.
#[derive(Debug)]
pub struct ChannelPair {
    pub worker_id: WorkerId,
    pub generation: u64,
    pub outbound: mpsc::UnboundedSender<StreamingMessage>,
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

/// Wire side of a pair, owned by the multiplexer for one connection.
#[derive(Debug)]
pub struct AttachedPair {
    pub worker_id: WorkerId,
    pub generation: u64,
    pub inbound: mpsc::UnboundedSender<InboundMessage>,
    pub outbound: mpsc::UnboundedReceiver<StreamingMessage>,
    /// Fired when the pair is removed from the registry.
    pub closed: CancellationToken,
}

#[derive(Debug)]
struct PairEntry {
    generation: u64,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    outbound: Option<mpsc::UnboundedReceiver<StreamingMessage>>,
    closed: CancellationToken,
}

/// Registry of live channel pairs keyed by worker id.
#[derive(Debug, Default)]
pub struct ChannelPairRegistry {
    pairs: DashMap<WorkerId, PairEntry>,
    next_generation: AtomicU64,
}

impl ChannelPairRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the queues for a worker and returns the logical side.
    pub fn register(&self, worker_id: WorkerId) -> Result<ChannelPair> {
        match self.pairs.entry(worker_id.clone()) {
            Entry::Occupied(_) => Err(HostError::AlreadyRegistered(worker_id)),
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

                slot.insert(PairEntry {
                    generation,
                    inbound: inbound_tx,
                    outbound: Some(outbound_rx),
                    closed: CancellationToken::new(),
                });
                debug!(worker_id = %worker_id, generation, "Channel pair registered");

                Ok(ChannelPair {
                    worker_id,
                    generation,
                    outbound: outbound_tx,
                    inbound: inbound_rx,
                })
            }
        }
    }

    /// Takes the wire side of a registered pair.
    ///
    /// Fails with [`HostError::UnknownWorker`] when no live pair exists, and
    /// with [`HostError::AlreadyAttached`] when another connection holds it.
    pub fn attach(&self, worker_id: &WorkerId) -> Result<AttachedPair> {
        let Some(mut entry) = self.pairs.get_mut(worker_id) else {
            return Err(HostError::UnknownWorker(worker_id.clone()));
        };
        if entry.closed.is_cancelled() {
            return Err(HostError::UnknownWorker(worker_id.clone()));
        }
        let Some(outbound) = entry.outbound.take() else {
            return Err(HostError::AlreadyAttached(worker_id.clone()));
        };

        Ok(AttachedPair {
            worker_id: worker_id.clone(),
            generation: entry.generation,
            inbound: entry.inbound.clone(),
            outbound,
            closed: entry.closed.clone(),
        })
    }

    /// Removes a pair if its generation matches, closing any attached stream.
    pub fn remove(&self, worker_id: &WorkerId, generation: u64) -> bool {
        let removed = self
            .pairs
            .remove_if(worker_id, |_, entry| entry.generation == generation);

        match removed {
            Some((_, entry)) => {
                entry.closed.cancel();
                info!(worker_id = %worker_id, generation, "Channel pair removed");
                true
            }
            None => {
                debug!(worker_id = %worker_id, generation, "No matching channel pair to remove");
                false
            }
        }
    }

    /// Returns the current generation for a worker.
    #[must_use]
    pub fn generation(&self, worker_id: &WorkerId) -> Option<u64> {
        self.pairs.get(worker_id).map(|entry| entry.generation)
    }

    /// Returns true if a pair is registered for the worker.
    #[must_use]
    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        self.pairs.contains_key(worker_id)
    }

    /// Returns the number of registered pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns true if no pairs are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use nimbus_proto::rpc::StartStream;
    use nimbus_proto::Content;

    #[test]
    fn register_then_attach_connects_queues() {
        let registry = ChannelPairRegistry::new();
        let id = WorkerId::from("w-1");

        let mut pair = registry.register(id.clone()).unwrap();
        let mut attached = registry.attach(&id).unwrap();
        assert_eq!(pair.generation, attached.generation);

        pair.outbound
            .send(StreamingMessage::new(Content::StartStream(StartStream::default())))
            .unwrap();
        assert!(attached.outbound.try_recv().is_ok());

        attached
            .inbound
            .send(InboundMessage {
                worker_id: id.clone(),
                message: StreamingMessage::default(),
            })
            .unwrap();
        assert_eq!(pair.inbound.try_recv().unwrap().worker_id, id);
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ChannelPairRegistry::new();
        let id = WorkerId::from("w-1");

        registry.register(id.clone()).unwrap();
        let result = registry.register(id);
        assert!(matches!(result, Err(HostError::AlreadyRegistered(_))));
    }

    #[test]
    fn attach_unknown_worker_fails() {
        let registry = ChannelPairRegistry::new();
        let result = registry.attach(&WorkerId::from("missing"));
        assert!(matches!(result, Err(HostError::UnknownWorker(_))));
    }

    #[test]
    fn second_attach_is_rejected() {
        let registry = ChannelPairRegistry::new();
        let id = WorkerId::from("w-1");
        let _pair = registry.register(id.clone()).unwrap();

        let _first = registry.attach(&id).unwrap();
        let second = registry.attach(&id);
        assert!(matches!(second, Err(HostError::AlreadyAttached(_))));
    }

    #[test]
    fn remove_requires_matching_generation() {
        let registry = ChannelPairRegistry::new();
        let id = WorkerId::from("w-1");
        let pair = registry.register(id.clone()).unwrap();

        assert!(!registry.remove(&id, pair.generation + 1));
        assert!(registry.contains(&id));

        assert!(registry.remove(&id, pair.generation));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_closes_attached_stream() {
        let registry = ChannelPairRegistry::new();
        let id = WorkerId::from("w-1");
        let pair = registry.register(id.clone()).unwrap();
        let attached = registry.attach(&id).unwrap();

        registry.remove(&id, pair.generation);
        assert!(attached.closed.is_cancelled());
    }

    #[test]
    fn dispose_wins_over_late_handshake() {
        let registry = ChannelPairRegistry::new();
        let id = WorkerId::from("w-1");
        let pair = registry.register(id.clone()).unwrap();

        registry.remove(&id, pair.generation);
        let late = registry.attach(&id);
        assert!(matches!(late, Err(HostError::UnknownWorker(_))));
    }

    #[test]
    fn generations_increase() {
        let registry = ChannelPairRegistry::new();
        let a = registry.register(WorkerId::from("a")).unwrap();
        let b = registry.register(WorkerId::from("b")).unwrap();
        assert!(b.generation > a.generation);
        assert_eq!(registry.generation(&WorkerId::from("a")), Some(a.generation));
    }
}
