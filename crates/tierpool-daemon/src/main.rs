//! tierpoold - tiering daemon.
//!
//! Loads the configuration, provisions and registers drives, mounts the
//! union, then runs the engine's periodic loops next to a JSON-RPC admin
//! server until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tierpool_core::config::DaemonConfig;
use tierpool_core::{TierEngine, TieringConfig};
use tierpool_daemon::start_server;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "tierpoold")]
#[command(about = "Storage tiering daemon for a union of drives", version)]
struct Args {
    /// Configuration file (default: /etc/tierpool/config.json, then the
    /// user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log external commands instead of running them
    #[arg(long)]
    dryrun: bool,

    /// Concurrent migration workers
    #[arg(short, long)]
    threads: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Override the state directory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Admin server host
    #[arg(long, default_value = DaemonConfig::ADMIN_HOST)]
    admin_host: String,

    /// Admin server port (0 = auto-assign)
    #[arg(long, default_value_t = DaemonConfig::ADMIN_PORT)]
    admin_port: u16,

    /// Only register configured drives; do not partition or mount devices
    #[arg(long)]
    no_provision: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    info!("Starting tierpool daemon v{}", env!("CARGO_PKG_VERSION"));

    let config_path = resolve_config_path(args.config.clone());
    let mut config = TieringConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if args.dryrun {
        config.dry_run = true;
    }
    if let Some(threads) = args.threads {
        config.migration.io_threads = threads;
    }
    if let Some(dir) = args.state_dir {
        config.state_dir = dir;
    }
    if config.dry_run {
        info!("Dry run: external commands are logged, not executed");
    }

    let engine = TierEngine::builder(config)
        .provision(!args.no_provision)
        .build()
        .await?;
    engine.start().await?;

    let server = start_server(engine.clone(), &args.admin_host, args.admin_port).await?;
    info!("Admin RPC on http://{}/rpc", server.addr);

    shutdown_signal().await?;
    info!("Shutdown signal received");

    server.shutdown().await;
    engine.shutdown().await?;
    Ok(())
}

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

/// An explicit path wins; otherwise the system file, then the per-user one.
/// A missing file means built-in defaults.
fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    let system = PathBuf::from(DaemonConfig::CONFIG_FILE_PATH);
    if system.exists() {
        return system;
    }
    dirs::config_dir()
        .map(|dir| dir.join(DaemonConfig::APP_NAME).join("config.json"))
        .filter(|path| path.exists())
        .unwrap_or(system)
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
