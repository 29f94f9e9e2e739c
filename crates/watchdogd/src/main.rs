//! watchdogd — WatchDog hub daemon.
//!
//! Accepts agent sessions over the WebSocket transport, evaluates
//! heartbeats into incidents, and dispatches alerts through durable
//! workflows.

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use watchdogd::config::HubConfig;

#[derive(Parser)]
#[command(name = "watchdogd")]
#[command(about = "WatchDog hub daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub (serve agent sessions until interrupted)
    Run,

    /// Validate environment configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Commands::Run => run().await,
        Commands::CheckConfig => check_config(),
    }
}

async fn run() -> anyhow::Result<()> {
    let config = HubConfig::from_env()?;
    info!(
        listen = %config.listen_addr,
        state_dir = %config.state_dir.display(),
        retention_days = config.retention_days,
        "starting watchdogd"
    );

    let runtime = watchdogd::build(&config)?;
    runtime.registry.init_all().await?;
    info!("watchdogd is up");

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    if let Err(e) = runtime.registry.shutdown_all().await {
        error!(error = %e, "shutdown finished with errors");
    }
    Ok(())
}

fn check_config() -> anyhow::Result<()> {
    let config = HubConfig::from_env()?;
    println!("listen:          {}", config.listen_addr);
    println!("state dir:       {}", config.state_dir.display());
    println!("retention days:  {}", config.retention_days);
    println!("encryption key:  set ({} bytes)", config.encryption_key.len());
    println!("session secret:  set ({} bytes)", config.session_secret.len());
    println!("configuration ok");
    Ok(())
}
