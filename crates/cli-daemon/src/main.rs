//! CLI entry point for Stream Super Daemon
//!
//! Parses command line arguments, initializes logging, and starts the daemon.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use stream_super_daemon::Daemon;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Stream Super Daemon - supervised FFmpeg stream relays with health dashboards
#[derive(Parser, Debug)]
#[command(name = "stream-super-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the daemon configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Path to the channel definitions file (channels.toml)
    #[arg(long, default_value = "channels.toml")]
    channels: PathBuf,

    /// Skip startup checks (engine availability). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        config = %args.config.display(),
        channels = %args.channels.display(),
        "Stream Super Daemon starting"
    );

    let daemon_result = if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(&args.config, &args.channels).await
    } else {
        Daemon::new(&args.config, &args.channels).await
    };

    match daemon_result {
        Ok(daemon) => {
            daemon.autostart().await;
            info!(
                addr = %daemon.config.server.bind_addr,
                "starting status server"
            );

            if let Err(e) = daemon.run_with_server().await {
                error!(error = %e, "daemon error");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}
