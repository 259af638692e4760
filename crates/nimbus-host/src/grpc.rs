//! tonic service exposing `FunctionRpc.EventStream`.

use std::net::SocketAddr;

use nimbus_proto::{FunctionRpc, FunctionRpcServer, StreamingMessage};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{error, info, warn};

use crate::error::{HostError, Result};
use crate::multiplexer::Multiplexer;
use crate::transport::GrpcFrameWriter;

/// Frames buffered between the push loop and tonic's response encoder.
const RESPONSE_BUFFER: usize = 32;

/// gRPC front end of the multiplexer.
#[derive(Debug, Clone)]
pub struct EventStreamService {
    multiplexer: Multiplexer,
    cancel: CancellationToken,
}

impl EventStreamService {
    /// Creates the service. Streams stop when `cancel` fires.
    #[must_use]
    pub const fn new(multiplexer: Multiplexer, cancel: CancellationToken) -> Self {
        Self {
            multiplexer,
            cancel,
        }
    }
}

#[tonic::async_trait]
impl FunctionRpc for EventStreamService {
    type EventStreamStream = ReceiverStream<std::result::Result<StreamingMessage, Status>>;

    async fn event_stream(
        &self,
        request: Request<Streaming<StreamingMessage>>,
    ) -> std::result::Result<Response<Self::EventStreamStream>, Status> {
        let peer = request.remote_addr();
        let mut reader = request.into_inner();

        let attached = self
            .multiplexer
            .handshake(&mut reader)
            .await
            .map_err(|e| match e {
                HostError::UnknownWorker(id) => {
                    Status::not_found(format!("no channel registered for worker {id}"))
                }
                HostError::AlreadyAttached(id) => {
                    Status::already_exists(format!("worker {id} is already connected"))
                }
                other => {
                    warn!(peer = ?peer, error = %other, "Event stream handshake failed");
                    Status::invalid_argument(other.to_string())
                }
            })?;

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let multiplexer = self.multiplexer.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            // Failures are logged and published by `serve`.
            let _ = multiplexer
                .serve(attached, reader, GrpcFrameWriter::new(tx), cancel)
                .await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Binds the event stream server and serves until `cancel` fires.
pub async fn serve(
    multiplexer: Multiplexer,
    addr: SocketAddr,
    max_message_length: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_with_listener(multiplexer, listener, max_message_length, cancel).await
}

/// Serves on an already-bound listener until `cancel` fires.
pub async fn serve_with_listener(
    multiplexer: Multiplexer,
    listener: TcpListener,
    max_message_length: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    let service = FunctionRpcServer::new(EventStreamService::new(multiplexer, cancel.clone()))
        .max_decoding_message_size(max_message_length)
        .max_encoding_message_size(max_message_length);

    info!(addr = %local_addr, max_message_length, "Event stream server listening");

    tonic::transport::Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), cancel.cancelled())
        .await
        .map_err(|e| {
            error!(error = %e, "Event stream server failed");
            HostError::Transport(e.to_string())
        })?;

    info!(addr = %local_addr, "Event stream server stopped");
    Ok(())
}
