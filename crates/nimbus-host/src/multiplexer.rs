//! Event stream multiplexer.
//!
//! Owns exactly one bidirectional stream per worker connection and bridges it
//! to the worker's [`AttachedPair`]:
//!
//! ```text
//!                 ┌──────────── pull loop ────────────┐
//!   wire reader ──┤ tag with WorkerId, push to inbound├──► ChannelPair.inbound
//!                 └───────────────────────────────────┘
//!                 ┌──────────── push loop ────────────┐
//!   wire writer ◄─┤ drain outbound in enqueue order   ├─── ChannelPair.outbound
//!                 └───────────────────────────────────┘
//! ```
//!
//! The first frame on a connection must be `StartStream` naming a registered
//! worker. Both loops end together; the push loop is the only context that
//! writes to the wire.

use std::sync::Arc;

use nimbus_proto::{Content, StreamingMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bus::{EventBus, HostEvent};
use crate::error::{HostError, Result};
use crate::pair::{AttachedPair, ChannelPairRegistry, InboundMessage, WorkerId};
use crate::transport::{FrameReader, FrameWriter};

/// Accepts worker connections and runs their pull/push loops.
#[derive(Debug, Clone)]
pub struct Multiplexer {
    registry: Arc<ChannelPairRegistry>,
    bus: EventBus,
}

impl Multiplexer {
    /// Creates a multiplexer over the shared pair registry.
    #[must_use]
    pub const fn new(registry: Arc<ChannelPairRegistry>, bus: EventBus) -> Self {
        Self { registry, bus }
    }

    /// Returns the pair registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ChannelPairRegistry> {
        &self.registry
    }

    /// Handshakes and serves a connection until it ends.
    pub async fn accept<R, W>(&self, mut reader: R, writer: W, cancel: CancellationToken) -> Result<()>
    where
        R: FrameReader,
        W: FrameWriter,
    {
        let attached = self.handshake(&mut reader).await?;
        self.serve(attached, reader, writer, cancel).await
    }

    /// Reads the `StartStream` frame and attaches to the named worker's pair.
    ///
    /// The `StartStream` frame itself is forwarded to the inbound queue so the
    /// channel observes the connection.
    pub async fn handshake<R: FrameReader>(&self, reader: &mut R) -> Result<AttachedPair> {
        let frame = reader
            .read_frame()
            .await?
            .ok_or_else(|| HostError::Protocol("stream ended before start_stream".into()))?;

        let worker_id = match &frame.content {
            Some(Content::StartStream(start)) if !start.worker_id.is_empty() => {
                WorkerId::from(start.worker_id.as_str())
            }
            Some(Content::StartStream(_)) => {
                return Err(HostError::Protocol("start_stream without worker id".into()));
            }
            other => {
                let kind = other
                    .as_ref()
                    .map_or("empty", |content| nimbus_proto::MessageKind::of(content).as_str());
                return Err(HostError::Protocol(format!(
                    "expected start_stream as first frame, got {kind}"
                )));
            }
        };

        let attached = self.registry.attach(&worker_id).inspect_err(|e| {
            warn!(worker_id = %worker_id, error = %e, "Rejecting worker connection");
        })?;

        // The channel's inbound receiver lives as long as the pair is registered.
        let _ = attached.inbound.send(InboundMessage {
            worker_id: worker_id.clone(),
            message: frame,
        });

        Ok(attached)
    }

    /// Runs the pull and push loops for an attached connection.
    ///
    /// Returns when the caller cancels, the pair is closed, the peer completes
    /// the stream, or either side of the wire fails. A
    /// [`HostEvent::StreamClosed`] is published in every case.
    pub async fn serve<R, W>(
        &self,
        attached: AttachedPair,
        reader: R,
        writer: W,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        R: FrameReader,
        W: FrameWriter,
    {
        let AttachedPair {
            worker_id,
            generation,
            inbound,
            outbound,
            closed,
        } = attached;

        info!(worker_id = %worker_id, generation, "Event stream established");
        self.bus.publish(HostEvent::StreamEstablished {
            worker_id: worker_id.clone(),
            generation,
        });

        let result = tokio::select! {
            () = cancel.cancelled() => {
                debug!(worker_id = %worker_id, "Event stream cancelled by host");
                Ok(())
            }
            result = pull_loop(&worker_id, reader, inbound) => result,
            result = push_loop(&worker_id, outbound, writer, &closed) => result,
        };

        match &result {
            Ok(()) => info!(worker_id = %worker_id, generation, "Event stream closed"),
            Err(e) => warn!(worker_id = %worker_id, generation, error = %e, "Event stream failed"),
        }
        self.bus.publish(HostEvent::StreamClosed {
            worker_id,
            generation,
            error: result.as_ref().err().map(ToString::to_string),
        });

        result
    }
}

async fn pull_loop<R: FrameReader>(
    worker_id: &WorkerId,
    mut reader: R,
    inbound: mpsc::UnboundedSender<InboundMessage>,
) -> Result<()> {
    while let Some(frame) = reader.read_frame().await? {
        if let Some(Content::InvocationResponse(response)) = &frame.content {
            if response.invocation_id.is_empty() {
                trace!(worker_id = %worker_id, "Invocation response without invocation id");
            }
        }
        trace!(worker_id = %worker_id, kind = ?frame.kind(), "Frame received");

        let message = InboundMessage {
            worker_id: worker_id.clone(),
            message: frame,
        };
        if inbound.send(message).is_err() {
            debug!(worker_id = %worker_id, "Inbound queue closed, stopping pull loop");
            return Ok(());
        }
    }

    debug!(worker_id = %worker_id, "Worker completed the event stream");
    Ok(())
}

async fn push_loop<W: FrameWriter>(
    worker_id: &WorkerId,
    mut outbound: mpsc::UnboundedReceiver<StreamingMessage>,
    mut writer: W,
    closed: &CancellationToken,
) -> Result<()> {
    // Let the handshake caller proceed before any traffic is written.
    tokio::task::yield_now().await;

    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    trace!(worker_id = %worker_id, kind = ?frame.kind(), "Frame sent");
                    writer.write_frame(frame).await?;
                }
                None => return Ok(()),
            },
            () = closed.cancelled() => {
                // Flush frames queued before the pair closed, e.g. WorkerTerminate.
                while let Ok(frame) = outbound.try_recv() {
                    writer.write_frame(frame).await?;
                }
                return Ok(());
            }
        }
    }
}
