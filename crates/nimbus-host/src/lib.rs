//! nimbus host - out-of-process language worker management.
//!
//! The host runs function code in separate language worker processes (Node,
//! Python, Java, ...) and talks to each over one bidirectional gRPC event
//! stream. This crate provides:
//!
//! - **Event stream multiplexing**: one stream per worker, bridged to an
//!   inbound/outbound [`ChannelPair`] keyed by [`WorkerId`]
//! - **Worker channels**: the init → load → invoke protocol, invocation
//!   correlation, deadlines and cancellation
//! - **Process supervision**: spawning, output capture, exit classification
//!   and restart on crash
//! - **Placeholder specialisation**: pre-warmed workers re-targeted at an
//!   application through an environment reload
//!
//! # Architecture
//!
//! ```text
//!  worker process ──gRPC──► Multiplexer ──ChannelPair──► WorkerChannel ◄── Host::invoke
//!        ▲                       │                            │
//!        │                       └────── EventBus ◄───────────┘
//!  WorkerProcess (supervisor) ──────────────┘  WorkerError / WorkerRestart
//! ```
//!
//! # Example
//!
//! ```ignore
//! use nimbus_host::{Host, HostConfig, InvocationInput};
//!
//! let host = Host::new(HostConfig::default());
//! let listener = host.bind().await?;
//! tokio::spawn({
//!     let host = host.clone();
//!     async move { host.serve_with_listener(listener, cancel).await }
//! });
//! host.start().await?;
//! let result = host.invoke("node", InvocationInput::new("F").with_input("req", "hello")).await?;
//! ```

pub mod backoff;
pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod forward;
pub mod grpc;
pub mod host;
pub mod manager;
pub mod multiplexer;
pub mod pair;
pub mod process;
pub mod store;
pub mod transport;

// Re-export main types
pub use backoff::{BackoffPolicy, Jitter, RetryPolicy};
pub use bus::{EventBus, EventKind, HostEvent, Subscription, SubscriptionId};
pub use channel::{
    ChannelOptions, ChannelState, InvocationInput, InvocationResult, LoadReport, WorkerChannel,
};
pub use config::{
    ChannelConfig, FunctionConfig, HeartbeatConfig, HostConfig, PlaceholderConfig, ProcessConfig,
    RpcConfig,
};
pub use error::{HostError, InvocationError, Result};
pub use forward::{
    ForwardError, ForwardRequest, ForwardResponse, Forwarder, HttpForwarder, RetryingForwarder,
};
pub use host::{Host, HostBuilder};
pub use manager::{ChannelManager, Specialization, SpecializeOutcome};
pub use multiplexer::Multiplexer;
pub use pair::{AttachedPair, ChannelPair, ChannelPairRegistry, InboundMessage, WorkerId};
pub use process::{
    LaunchRequest, ProcessLauncher, WorkerDescription, WorkerHandle, WorkerLauncher,
    WorkerProcess, WorkerProcessCount,
};
pub use store::{DurableStore, HeartbeatWriter, InMemoryStore, StoreError, StoreRecord};
