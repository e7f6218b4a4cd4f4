use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use guestctl_agent::config::{Config, Transport};
use guestctl_agent::{Dispatcher, OsProcessLauncher, SocketChannel};

#[derive(Parser)]
#[command(
    name = "guestctl-agent",
    about = "Runs host-requested processes inside the guest"
)]
struct Cli {
    /// Path to config file (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Connect to the host over TCP instead of vsock.
    #[arg(long)]
    tcp: Option<SocketAddr>,
    /// Override the concurrent process limit (0 = unbounded).
    #[arg(long)]
    max_processes: Option<u32>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(addr) = cli.tcp {
        config.channel.transport = Transport::Tcp;
        config.channel.tcp_addr = addr.to_string();
    }
    if let Some(max) = cli.max_processes {
        config.control.max_processes = max;
    }
    config.validate()?;
    Ok(config)
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, initiating shutdown");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "guestctl agent starting"
    );

    let channel = Arc::new(
        SocketChannel::new(&config.channel, tokio::runtime::Handle::current())
            .context("invalid channel configuration")?,
    );
    info!(endpoint = %channel.endpoint(), "connecting to host control service");

    let control = config.control.clone();
    let dispatcher = tokio::task::spawn_blocking(move || {
        Dispatcher::connect(channel, Arc::new(OsProcessLauncher::new()), control)
    })
    .await
    .context("connect task failed")?
    .context("failed to connect to host control service")?;

    let Some(dispatcher) = dispatcher else {
        warn!("host control service not available, idling until signalled");
        wait_for_signal().await?;
        return Ok(());
    };

    let shutdown = dispatcher.shutdown_handle();
    let mut serve = tokio::task::spawn_blocking(move || dispatcher.run());

    let signalled = tokio::select! {
        result = &mut serve => {
            result.context("dispatcher task failed")?;
            info!("dispatcher stopped");
            return Ok(());
        }
        signal = wait_for_signal() => signal,
    };

    // The blocking dispatcher must be stopped before the runtime goes away.
    shutdown.trigger();
    serve.await.context("dispatcher task failed")?;
    info!("guestctl agent shut down");
    signalled
}
