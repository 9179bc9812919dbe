//! webssh-server: browser terminal server.
//!
//! Accepts WebSocket connections and bridges each one to a fresh
//! PTY-backed shell session.

mod config;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::WebsshServer;
use std::path::PathBuf;
use tracing::{error, info};

/// Browser terminal server.
#[derive(Parser, Debug)]
#[command(name = "webssh-server", version, about = "Browser terminal server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.webssh/config.toml")]
    config: String,

    /// Command to run for each session (default: $SHELL)
    #[arg(short, long)]
    command: Option<String>,

    /// Argument passed to the command (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Record every session as an asciicast file in this directory
    #[arg(long)]
    record_dir: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Play back the output of a recorded session to stdout and exit
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Playback speed multiplier for --replay
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &cli.replay {
        let mut stdout = tokio::io::stdout();
        if let Err(e) = session::recording::replay(path, &mut stdout, cli.speed).await {
            error!(path = %path.display(), error = %e, "replay failed");
            std::process::exit(1);
        }
        return;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting webssh-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        command: cli.command,
        args: cli.args,
        record_dir: cli.record_dir,
        max_sessions: cli.max_sessions,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let webssh_server = WebsshServer::new(server_config);
    let shutdown = webssh_server.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        shutdown.cancel();
    });

    if let Err(e) = webssh_server.run().await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("webssh-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
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
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
