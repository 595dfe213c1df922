//! zapretd - the zapret controller daemon.
//!
//! Loads the config, claims the PID file, restores the idle invariant left
//! by any previous instance, then serves control commands over the Unix
//! socket until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use zapret::cmd::SystemExecutor;
use zapret::config::Config;
use zapret::ipc::IpcServer;
use zapret::pidfile::PidFile;
use zapret::session::SessionController;
use zapret::signal::{spawn_signal_watcher, ShutdownToken};

#[derive(Parser)]
#[command(name = "zapretd")]
#[command(author, version, about = "Zapret traffic-shaping daemon")]
struct Args {
    /// Config file path
    #[arg(long, default_value = "/etc/zapret/conf.yml")]
    config: PathBuf,

    /// Unix socket path (overrides config)
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet; the validation failure goes straight
            // to stderr with a nonzero exit.
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    };

    zapret::logging::init(config.debug, config.log_color)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting zapret daemon");

    let socket_path = args.socket.unwrap_or_else(|| config.socket_path.clone());

    let _pid_file = PidFile::create(&config.pid_file)
        .with_context(|| format!("failed to claim pid file: {}", config.pid_file.display()))?;

    let executor = Arc::new(SystemExecutor::new());
    let session = Arc::new(SessionController::new(config, executor));

    // Restore the idle invariant before accepting any command, even if a
    // previous instance crashed mid-session.
    session.recover().await;

    let shutdown = ShutdownToken::new();
    spawn_signal_watcher(shutdown.clone());

    let server = IpcServer::new(socket_path, session.clone(), shutdown.clone());
    if let Err(e) = server.run().await {
        error!(error = %e, "ipc server failed");
        session.shutdown().await;
        return Err(e);
    }

    // Signal-driven exit: tear down any active session before leaving.
    session.shutdown().await;
    info!("zapret daemon stopped");
    Ok(())
}
