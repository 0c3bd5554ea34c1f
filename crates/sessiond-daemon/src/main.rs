//! sessiond - host-wide login and privilege-session broker.
//!
//! Binds the broker socket, runs the core engine, and serves client
//! connections until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sessiond_core::{FileLingerStore, Manager, ManagerConfig, ProcfsMonitor, SelfServiceOracle};
use sessiond_daemon::protocol::{serve_connection, BrokerSocket, SocketConfig};
use sessiond_daemon::sessions::LoggingSessionSubsystem;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Host-wide login and privilege-session broker.
#[derive(Parser, Debug)]
#[command(name = "sessiond")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the broker Unix socket (mode 0660)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Directory holding per-user linger flag files
    #[arg(long, default_value = "/var/lib/sessiond/linger")]
    linger_dir: PathBuf,

    /// Grace window in milliseconds granted to delay-mode inhibitor
    /// holders before a secure-lock proceeds without them
    #[arg(long, default_value_t = 5000)]
    secure_lock_grace_ms: u64,

    /// Maximum concurrent client connections
    #[arg(long, default_value_t = 64)]
    max_connections: usize,

    /// Log filter, overridden by RUST_LOG when set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = ManagerConfig::new()
        .with_secure_lock_grace(Duration::from_millis(args.secure_lock_grace_ms));
    let (manager, engine) = Manager::spawn(
        config,
        Arc::new(SelfServiceOracle::new()),
        Arc::new(LoggingSessionSubsystem::new()),
        Arc::new(FileLingerStore::new(&args.linger_dir)),
        Arc::new(ProcfsMonitor::new()),
    );

    let socket_config = args
        .socket
        .map_or_else(SocketConfig::default, SocketConfig::new)
        .with_max_connections(args.max_connections);
    let socket = BrokerSocket::bind(socket_config).context("failed to bind broker socket")?;
    info!(path = %socket.path().display(), "sessiond ready");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            accepted = socket.accept() => match accepted {
                Ok((stream, permit, peer)) => {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        // Holds the connection slot for the task's
                        // lifetime.
                        let _permit = permit;
                        if let Err(err) = serve_connection(manager, stream, peer).await {
                            warn!(uid = peer.uid, pid = peer.pid, %err, "connection ended with error");
                        }
                    });
                }
                Err(err) => error!(%err, "accept failed"),
            }
        }
    }

    manager.shutdown();
    engine.await.context("engine task panicked")?;
    Ok(())
}
