//! hpcsh-server: terminal session bridge for HPC clusters.
//!
//! Launches interactive shells inside `salloc` allocations on
//! pseudo-terminals and streams them to remote WebSocket clients.

use clap::Parser;
use hpcsh_server::config::ServerConfig;
use hpcsh_server::server::HpcshServer;
use std::path::PathBuf;
use tracing::{error, info};

/// hpcsh-server — HPC terminal session bridge
#[derive(Parser, Debug)]
#[command(name = "hpcsh-server", version, about = "HPC terminal session bridge")]
struct Cli {
    /// Listen port for the WebSocket gateway
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.hpcsh/config.toml")]
    config: String,

    /// Interactive shell started inside allocations
    #[arg(long)]
    shell: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.shell.as_deref(),
        cli.max_sessions,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        allocator = %config.slurm.salloc,
        "starting hpcsh-server"
    );

    let server = HpcshServer::new(config);

    // Run until shutdown signal, then force-reap all sessions so no
    // orphaned allocations linger on the host.
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("hpcsh-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
