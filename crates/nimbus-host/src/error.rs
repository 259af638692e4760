//! Error types for the worker host.

use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelState;
use crate::pair::WorkerId;

/// Host errors.
#[derive(Error, Debug)]
pub enum HostError {
    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Worker description does not support this platform.
    #[error("{0}")]
    UnsupportedPlatform(String),

    /// No channel pair is registered for the worker.
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// A channel pair already exists for the worker.
    #[error("worker already registered: {0}")]
    AlreadyRegistered(WorkerId),

    /// The wire side of the pair was already taken by another connection.
    #[error("worker already attached: {0}")]
    AlreadyAttached(WorkerId),

    /// Peer violated the event stream protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport read or write failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Outbound queue is closed; the stream is gone.
    #[error("channel closed for worker {0}")]
    ChannelClosed(WorkerId),

    /// Operation not permitted in the channel's current state.
    #[error("invalid channel state {state} for {operation}")]
    InvalidState {
        state: ChannelState,
        operation: &'static str,
    },

    /// An init handshake is already in flight or complete.
    #[error("worker init already in progress for {0}")]
    InitInProgress(WorkerId),

    /// Worker rejected or failed the init handshake.
    #[error("worker init failed for {worker_id}: {reason}")]
    InitFailed { worker_id: WorkerId, reason: String },

    /// Function was never loaded on this channel.
    #[error("function not loaded: {0}")]
    FunctionNotLoaded(String),

    /// Function load was reported as failed by the worker.
    #[error("function {function_id} failed to load: {reason}")]
    FunctionLoadFailed { function_id: String, reason: String },

    /// Worker rejected an environment reload.
    #[error("environment reload failed for {worker_id}: {reason}")]
    EnvironmentReloadFailed { worker_id: WorkerId, reason: String },

    /// Invocation-local failure.
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// Worker process exited unexpectedly.
    #[error("{message}")]
    WorkerProcessExit {
        message: String,
        exit_code: i32,
        stderr: Vec<String>,
    },

    /// Worker process could not be started.
    #[error("failed to start worker process {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    /// A handshake step did not complete in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// No ready channel exists for the runtime.
    #[error("no ready channel for runtime {0}")]
    NoReadyChannel(String),

    /// Runtime exceeded its restart budget.
    #[error("runtime {0} is unavailable")]
    RuntimeUnavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single invocation.
///
/// Invocation-local errors never affect channel health. They are cloned
/// when a batch of pending invocations is failed at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// The deadline elapsed before the worker responded.
    #[error("invocation {invocation_id} timed out after {after:?}")]
    Timeout {
        invocation_id: String,
        after: Duration,
    },

    /// The invocation was cancelled.
    #[error("invocation cancelled")]
    Cancelled,

    /// The worker process terminated while the invocation was in flight.
    #[error("worker {worker_id} terminated: {reason}")]
    WorkerTerminated { worker_id: String, reason: String },

    /// The worker is restarting.
    #[error("worker {worker_id} restarted")]
    WorkerRestarted { worker_id: String },

    /// The worker reported a failed execution.
    #[error("invocation failed: {0}")]
    Failed(String),
}

impl InvocationError {
    /// Returns true for the timeout variant.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl HostError {
    /// Returns the invocation-local error, if this is one.
    #[must_use]
    pub const fn as_invocation(&self) -> Option<&InvocationError> {
        match self {
            Self::Invocation(e) => Some(e),
            _ => None,
        }
    }

    /// Errors that a retry of the same operation may clear.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Io(_) | Self::Timeout { .. })
    }
}

/// Result type for host operations.
pub type Result<T> = std::result::Result<T, HostError>;
