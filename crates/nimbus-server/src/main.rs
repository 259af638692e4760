//! nimbus server binary.

use anyhow::Context;
use clap::Parser;
use nimbus_server::{ServerConfig, Services, Stopped};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Hosts out-of-process language workers.
#[derive(Parser, Debug)]
#[command(name = "nimbus-server", version)]
struct Cli {
    /// Configuration file, merged over `nimbus.toml`.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Log at debug level unless `RUST_LOG` is set.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug,h2=info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let config = ServerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(
        workers = config.host.workers.len(),
        functions = config.host.functions.len(),
        placeholder = config.host.placeholder.enabled,
        "Configuration loaded"
    );

    let mut services = Services::new(config);
    let addr = services.start().await?;
    info!(addr = %addr, "Accepting worker connections");

    let stopped = tokio::select! {
        () = shutdown_signal() => Stopped::Requested,
        stopped = services.wait() => stopped,
    };
    services.shutdown().await;

    if stopped == Stopped::ServerExited {
        anyhow::bail!("event stream server exited unexpectedly");
    }
    info!("nimbus server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
