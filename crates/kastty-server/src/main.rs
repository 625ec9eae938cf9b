//! kastty: share a running terminal session with browser viewers.
//!
//! Spawns a command on a PTY and serves it over a loopback WebSocket.
//! Every viewer gets the recent scrollback on connect and the live output
//! afterwards; the process exits with the command's exit status.

mod config;
mod security;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, Config};
use server::KasttyServer;
use session::PtySpawner;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Command-line options for kastty.
#[derive(Parser, Debug)]
#[command(name = "kastty", version, about = "Share a terminal session in the browser")]
struct Cli {
    /// Command to run in the PTY (defaults to $SHELL)
    command: Option<String>,

    /// Arguments for the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Start in readonly mode
    #[arg(long)]
    readonly: bool,

    /// Port to listen on (0 for auto)
    #[arg(long)]
    port: Option<u16>,

    /// Replay buffer size in bytes
    #[arg(long)]
    replay_buffer_bytes: Option<usize>,

    /// Maximum concurrent viewers (unlimited when unset)
    #[arg(long)]
    max_viewers: Option<usize>,

    /// Log terminal title changes
    #[arg(long)]
    log_titles: bool,

    /// Config file path
    #[arg(long, default_value = "~/.kastty/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting kastty");

    let overrides = CliOverrides {
        port: cli.port,
        readonly: cli.readonly,
        replay_buffer_bytes: cli.replay_buffer_bytes,
        max_viewers: cli.max_viewers,
        log_titles: cli.log_titles,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match Config::load(Some(&config_path), cli.command, cli.args, &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match KasttyServer::bind(config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    let code = match server.run(&PtySpawner, shutdown_signal()).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "server error");
            1
        }
    };

    std::process::exit(code);
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
