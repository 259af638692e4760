//! nimbus server.
//!
//! Runs the language worker host as a standalone process:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  nimbus-server                                           │
//! │                                                          │
//! │  FunctionRpc.EventStream ◄── 127.0.0.1:<port> ◄── workers│
//! │  Host ──► one worker process per configured runtime      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from `nimbus.toml` in the current directory,
//! with environment variable overrides using the `NIMBUS_` prefix
//! (`NIMBUS_HOST__RPC__PORT=7071`).
//!
//! ```toml
//! [host.rpc]
//! host = "127.0.0.1"
//! port = 0
//!
//! [[host.workers]]
//! language = "node"
//! extensions = [".js"]
//! default_executable_path = "node"
//! default_worker_path = "dist/src/nodejsWorker.js"
//!
//! [[host.functions]]
//! name = "HttpTrigger"
//! runtime = "node"
//! script_file = "HttpTrigger/index.js"
//! ```

pub mod config;
pub mod services;

pub use config::{ConfigError, ServerConfig};
pub use services::{Services, Stopped};
