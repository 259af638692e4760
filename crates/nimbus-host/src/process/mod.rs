//! Worker process lifecycle.
//!
//! - [`description`]: what to launch for a language runtime, validated
//!   against the host platform.
//! - [`command`]: the resolved command line.
//! - [`supervisor`]: spawning, output capture, exit classification.
//!
//! The host launches workers through [`WorkerLauncher`] so that tests can
//! substitute in-process fakes for real OS processes.

mod command;
mod description;
mod supervisor;

use std::time::Duration;

use async_trait::async_trait;

use crate::bus::EventBus;
use crate::error::Result;
use crate::pair::WorkerId;

pub use command::{WorkerArgs, WorkerCommand};
pub use description::{Platform, WorkerDescription, WorkerProcessCount};
pub use supervisor::{
    exit_error, handle_exit, sanitize, ExitClassification, ExitOutcome, ProcessLauncher,
    StderrBuffer, WorkerProcess, STDERR_CAPACITY,
};

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub worker_id: WorkerId,
    pub runtime: String,
    pub command: WorkerCommand,
    /// Bus on which exit events are published.
    pub bus: EventBus,
}

/// A started worker.
#[async_trait]
pub trait WorkerHandle: Send + Sync + std::fmt::Debug {
    /// The worker's id.
    fn worker_id(&self) -> &WorkerId;

    /// OS process id, if the worker is a real process.
    fn pid(&self) -> Option<u32>;

    /// Requests a stop, waiting up to `grace` before killing.
    ///
    /// Exits caused by this call publish no lifecycle events.
    async fn shutdown(&self, grace: Duration);
}

/// Starts workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Launches a worker. The returned handle stays valid after exit.
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn WorkerHandle>>;
}
