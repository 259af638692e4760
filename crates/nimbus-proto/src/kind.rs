//! Discriminator for the `StreamingMessage.content` oneof.

use std::fmt;

use crate::Content;

/// The kind of a frame, independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    StartStream,
    WorkerInitRequest,
    WorkerInitResponse,
    WorkerTerminate,
    WorkerStatusRequest,
    WorkerStatusResponse,
    FileChangeEventRequest,
    FunctionLoadRequest,
    FunctionLoadResponse,
    FunctionLoadRequestCollection,
    FunctionLoadResponseCollection,
    InvocationRequest,
    InvocationResponse,
    InvocationCancel,
    FunctionEnvironmentReloadRequest,
    FunctionEnvironmentReloadResponse,
    CloseSharedMemoryResourcesRequest,
    CloseSharedMemoryResourcesResponse,
    FunctionsMetadataRequest,
    FunctionMetadataResponse,
    RpcLog,
}

impl MessageKind {
    /// Classifies a content variant.
    #[must_use]
    pub const fn of(content: &Content) -> Self {
        match content {
            Content::StartStream(_) => Self::StartStream,
            Content::WorkerInitRequest(_) => Self::WorkerInitRequest,
            Content::WorkerInitResponse(_) => Self::WorkerInitResponse,
            Content::WorkerTerminate(_) => Self::WorkerTerminate,
            Content::WorkerStatusRequest(_) => Self::WorkerStatusRequest,
            Content::WorkerStatusResponse(_) => Self::WorkerStatusResponse,
            Content::FileChangeEventRequest(_) => Self::FileChangeEventRequest,
            Content::FunctionLoadRequest(_) => Self::FunctionLoadRequest,
            Content::FunctionLoadResponse(_) => Self::FunctionLoadResponse,
            Content::FunctionLoadRequestCollection(_) => Self::FunctionLoadRequestCollection,
            Content::FunctionLoadResponseCollection(_) => Self::FunctionLoadResponseCollection,
            Content::InvocationRequest(_) => Self::InvocationRequest,
            Content::InvocationResponse(_) => Self::InvocationResponse,
            Content::InvocationCancel(_) => Self::InvocationCancel,
            Content::FunctionEnvironmentReloadRequest(_) => Self::FunctionEnvironmentReloadRequest,
            Content::FunctionEnvironmentReloadResponse(_) => {
                Self::FunctionEnvironmentReloadResponse
            }
            Content::CloseSharedMemoryResourcesRequest(_) => {
                Self::CloseSharedMemoryResourcesRequest
            }
            Content::CloseSharedMemoryResourcesResponse(_) => {
                Self::CloseSharedMemoryResourcesResponse
            }
            Content::FunctionsMetadataRequest(_) => Self::FunctionsMetadataRequest,
            Content::FunctionMetadataResponse(_) => Self::FunctionMetadataResponse,
            Content::RpcLog(_) => Self::RpcLog,
        }
    }

    /// Stable name used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartStream => "start_stream",
            Self::WorkerInitRequest => "worker_init_request",
            Self::WorkerInitResponse => "worker_init_response",
            Self::WorkerTerminate => "worker_terminate",
            Self::WorkerStatusRequest => "worker_status_request",
            Self::WorkerStatusResponse => "worker_status_response",
            Self::FileChangeEventRequest => "file_change_event_request",
            Self::FunctionLoadRequest => "function_load_request",
            Self::FunctionLoadResponse => "function_load_response",
            Self::FunctionLoadRequestCollection => "function_load_request_collection",
            Self::FunctionLoadResponseCollection => "function_load_response_collection",
            Self::InvocationRequest => "invocation_request",
            Self::InvocationResponse => "invocation_response",
            Self::InvocationCancel => "invocation_cancel",
            Self::FunctionEnvironmentReloadRequest => "function_environment_reload_request",
            Self::FunctionEnvironmentReloadResponse => "function_environment_reload_response",
            Self::CloseSharedMemoryResourcesRequest => "close_shared_memory_resources_request",
            Self::CloseSharedMemoryResourcesResponse => "close_shared_memory_resources_response",
            Self::FunctionsMetadataRequest => "functions_metadata_request",
            Self::FunctionMetadataResponse => "function_metadata_response",
            Self::RpcLog => "rpc_log",
        }
    }

    /// Returns true for kinds a worker sends to the host.
    #[must_use]
    pub const fn is_worker_to_host(self) -> bool {
        matches!(
            self,
            Self::StartStream
                | Self::WorkerInitResponse
                | Self::WorkerStatusResponse
                | Self::FunctionLoadResponse
                | Self::FunctionLoadResponseCollection
                | Self::InvocationResponse
                | Self::FunctionEnvironmentReloadResponse
                | Self::CloseSharedMemoryResourcesResponse
                | Self::FunctionMetadataResponse
                | Self::RpcLog
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
