//! Frame transports for the event stream.
//!
//! The multiplexer is written against [`FrameReader`] and [`FrameWriter`] so
//! the same pull/push loops drive a tonic bidirectional stream in production
//! and an in-memory duplex for in-process workers and tests.
//!
//! `write_frame` takes `&mut self`. The writer is moved into the push loop,
//! so the type system rules out a second concurrent writer.

use async_trait::async_trait;
use nimbus_proto::StreamingMessage;
use tokio::sync::mpsc;
use tonic::{Status, Streaming};

use crate::error::{HostError, Result};

/// Reads frames from a connection.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Returns the next frame, or `None` when the peer completed the stream.
    async fn read_frame(&mut self) -> Result<Option<StreamingMessage>>;
}

/// Writes frames to a connection.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Writes one frame.
    async fn write_frame(&mut self, frame: StreamingMessage) -> Result<()>;
}

#[async_trait]
impl FrameReader for Streaming<StreamingMessage> {
    async fn read_frame(&mut self) -> Result<Option<StreamingMessage>> {
        self.message()
            .await
            .map_err(|status| HostError::Transport(status.message().to_owned()))
    }
}

/// Writer half of a tonic server stream.
///
/// Frames are handed to the response stream returned from the RPC handler.
#[derive(Debug)]
pub struct GrpcFrameWriter {
    sender: mpsc::Sender<std::result::Result<StreamingMessage, Status>>,
}

impl GrpcFrameWriter {
    /// Wraps the sender feeding a tonic response stream.
    #[must_use]
    pub const fn new(sender: mpsc::Sender<std::result::Result<StreamingMessage, Status>>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl FrameWriter for GrpcFrameWriter {
    async fn write_frame(&mut self, frame: StreamingMessage) -> Result<()> {
        self.sender
            .send(Ok(frame))
            .await
            .map_err(|_| HostError::Transport("response stream closed by peer".into()))
    }
}

/// In-memory connection used by in-process workers.
pub mod memory {
    use super::*;

    type Frame = std::result::Result<StreamingMessage, String>;

    /// Reading half of an in-memory connection.
    #[derive(Debug)]
    pub struct MemoryReader {
        receiver: mpsc::UnboundedReceiver<Frame>,
    }

    /// Writing half of an in-memory connection.
    #[derive(Debug, Clone)]
    pub struct MemoryWriter {
        sender: mpsc::UnboundedSender<Frame>,
    }

    /// One end of an in-memory connection.
    #[derive(Debug)]
    pub struct MemoryEndpoint {
        pub reader: MemoryReader,
        pub writer: MemoryWriter,
    }

    /// Creates a connected pair of endpoints: `(host, worker)`.
    #[must_use]
    pub fn duplex() -> (MemoryEndpoint, MemoryEndpoint) {
        let (to_host, host_rx) = mpsc::unbounded_channel();
        let (to_worker, worker_rx) = mpsc::unbounded_channel();

        let host = MemoryEndpoint {
            reader: MemoryReader { receiver: host_rx },
            writer: MemoryWriter { sender: to_worker },
        };
        let worker = MemoryEndpoint {
            reader: MemoryReader {
                receiver: worker_rx,
            },
            writer: MemoryWriter { sender: to_host },
        };
        (host, worker)
    }

    impl MemoryWriter {
        /// Sends a frame without awaiting.
        pub fn send(&self, frame: StreamingMessage) -> Result<()> {
            self.sender
                .send(Ok(frame))
                .map_err(|_| HostError::Transport("memory connection closed".into()))
        }

        /// Makes the peer's next read fail with a transport error.
        pub fn send_error(&self, message: impl Into<String>) -> Result<()> {
            self.sender
                .send(Err(message.into()))
                .map_err(|_| HostError::Transport("memory connection closed".into()))
        }
    }

    #[async_trait]
    impl FrameReader for MemoryReader {
        async fn read_frame(&mut self) -> Result<Option<StreamingMessage>> {
            match self.receiver.recv().await {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(message)) => Err(HostError::Transport(message)),
                None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl FrameWriter for MemoryWriter {
        async fn write_frame(&mut self, frame: StreamingMessage) -> Result<()> {
            self.send(frame)
        }
    }
}
