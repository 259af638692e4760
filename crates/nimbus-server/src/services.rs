//! Host lifecycle for the server binary.
//!
//! The event stream is bound and served before any worker is launched, since
//! workers are told the bound port. Shutdown runs the other way round: the
//! host stops its workers while the server can still deliver
//! `WorkerTerminate`, then the server stops.

use std::net::SocketAddr;
use std::sync::Arc;

use nimbus_host::{Host, InMemoryStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServerConfig;

/// Why [`Services::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// The cancellation token fired.
    Requested,
    /// The event stream server ended on its own.
    ServerExited,
}

/// A host plus the task serving its event stream.
pub struct Services {
    config: ServerConfig,
    cancel: CancellationToken,
    host: Option<Host>,
    server: Option<JoinHandle<()>>,
}

impl Services {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            host: None,
            server: None,
        }
    }

    /// Binds and serves the event stream, then starts the workers.
    ///
    /// Returns the address workers connect to.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let mut builder = Host::builder(self.config.host.clone());
        if self.config.host.heartbeat.enabled {
            builder = builder.store(Arc::new(InMemoryStore::new()));
        }
        let host = builder.build();

        let listener = host.bind().await?;
        let addr = listener.local_addr()?;
        self.server = Some({
            let host = host.clone();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = host.serve_with_listener(listener, cancel).await {
                    error!(error = %e, "Event stream server failed");
                }
            })
        });

        host.start().await?;
        info!(
            addr = %addr,
            host_id = %host.host_id(),
            workers = host.worker_count(),
            "Worker host started"
        );
        self.host = Some(host);
        Ok(addr)
    }

    /// The running host, once started.
    pub fn host(&self) -> Option<&Host> {
        self.host.as_ref()
    }

    /// Waits until shutdown is requested or the event stream server ends.
    pub async fn wait(&mut self) -> Stopped {
        let Some(server) = self.server.as_mut() else {
            self.cancel.cancelled().await;
            return Stopped::Requested;
        };

        let exited = tokio::select! {
            () = self.cancel.cancelled() => None,
            joined = server => Some(joined),
        };
        match exited {
            None => {
                info!("Shutdown requested");
                Stopped::Requested
            }
            Some(joined) => {
                self.server = None;
                match joined {
                    Ok(()) => warn!("Event stream server exited"),
                    Err(e) => error!(error = %e, "Event stream server panicked"),
                }
                Stopped::ServerExited
            }
        }
    }

    /// Stops the workers, then the server.
    pub async fn shutdown(&mut self) {
        if let Some(host) = self.host.take() {
            host.shutdown().await;
        }
        self.cancel.cancel();
        if let Some(server) = self.server.take() {
            if let Err(e) = server.await {
                error!(error = %e, "Event stream server panicked during shutdown");
            }
        }
    }

    /// Token that stops [`Services::wait`] and the server when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
