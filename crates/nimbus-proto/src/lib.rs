//! Wire protocol for the nimbus worker event stream.
//!
//! Every frame exchanged between the host and a language worker is a
//! [`StreamingMessage`] carrying exactly one variant of its `content` oneof.
//! The stream itself is the `FunctionRpc.EventStream` bidirectional RPC.
//!
//! ```text
//!   worker                                host
//!     │ ── StartStream{worker_id} ──────────► │  handshake
//!     │ ◄────────────── WorkerInitRequest ─── │
//!     │ ── WorkerInitResponse ──────────────► │
//!     │ ◄──────────── FunctionLoadRequest ─── │
//!     │ ── FunctionLoadResponse ────────────► │
//!     │ ◄────────────── InvocationRequest ─── │  many, concurrently
//!     │ ── InvocationResponse ──────────────► │  matched by invocation_id
//! ```

mod kind;
mod typed;

/// Generated protobuf messages and tonic service for `nimbus.rpc.v1`.
#[allow(clippy::all, clippy::pedantic, missing_docs)]
pub mod rpc {
    tonic::include_proto!("nimbus.rpc.v1");
}

pub use kind::MessageKind;
pub use rpc::function_rpc_client::FunctionRpcClient;
pub use rpc::function_rpc_server::{FunctionRpc, FunctionRpcServer};
pub use rpc::streaming_message::Content;
pub use rpc::StreamingMessage;

/// Default maximum gRPC message length in bytes.
///
/// Invocation payloads can be large, so the cap is effectively unbounded.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = i32::MAX as usize;

/// Capability names negotiated during the init handshake.
pub mod capabilities {
    /// Worker accepts `InvocationCancel` frames.
    pub const HANDLES_INVOCATION_CANCEL: &str = "HandlesInvocationCancelMessage";

    /// Worker accepts `WorkerTerminate` frames.
    pub const HANDLES_WORKER_TERMINATE: &str = "HandlesWorkerTerminateMessage";

    /// Worker accepts `FunctionLoadRequestCollection`.
    pub const SUPPORTS_LOAD_RESPONSE_COLLECTION: &str = "SupportsLoadResponseCollection";

    /// Worker indexes its own function metadata.
    pub const WORKER_INDEXING: &str = "WorkerIndexing";
}

impl StreamingMessage {
    /// Wraps a content variant in a frame with no request id.
    #[must_use]
    pub fn new(content: Content) -> Self {
        Self {
            request_id: String::new(),
            content: Some(content),
        }
    }

    /// Wraps a content variant in a frame with the given request id.
    #[must_use]
    pub fn with_request_id(request_id: impl Into<String>, content: Content) -> Self {
        Self {
            request_id: request_id.into(),
            content: Some(content),
        }
    }

    /// Returns the kind of the populated variant.
    #[must_use]
    pub fn kind(&self) -> Option<MessageKind> {
        self.content.as_ref().map(MessageKind::of)
    }
}

impl rpc::StatusResult {
    /// A successful status with no payload.
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: rpc::status_result::Status::Success.into(),
            ..Default::default()
        }
    }

    /// A failed status carrying an exception message.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: rpc::status_result::Status::Failure.into(),
            exception: Some(rpc::RpcException {
                message: message.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Returns true when the status is `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status() == rpc::status_result::Status::Success
    }

    /// Best-effort error text: the exception message, else the result string.
    #[must_use]
    pub fn error_message(&self) -> String {
        match &self.exception {
            Some(exception) if !exception.message.is_empty() => exception.message.clone(),
            _ => self.result.clone(),
        }
    }
}
