//! Command-line interface for the KioskLink bridge.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiosklink_core::{BridgeConfig, MemoryStore};
use kiosklink_devices::{BridgeService, DeviceRegistry};

/// KioskLink - bridge kiosk tablets to a state database.
#[derive(Parser, Debug)]
#[command(name = "kiosklink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge.
    Serve {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "kiosklink.toml")]
        config: PathBuf,
    },
    /// Validate a configuration file and exit.
    Check {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "kiosklink.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // JSON logs for container environments, compact otherwise.
    let json_logging = std::env::var("KIOSKLINK_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if args.verbose {
        "kiosklink=debug"
    } else {
        "kiosklink=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(default_directive)
                .add_directive(tracing::Level::WARN.into())
        });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }

    match args.command {
        Command::Serve { config } => serve(config).await,
        Command::Check { config } => check(config),
    }
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = BridgeConfig::from_path(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(BridgeService::new(config, store)?);
    service.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    service.shutdown().await;
    Ok(())
}

fn check(config_path: PathBuf) -> Result<()> {
    let config = BridgeConfig::from_path(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let registry = DeviceRegistry::load(&config.devices)?;

    println!(
        "configuration OK: {} device(s), {} enabled, broker port {}",
        registry.len(),
        registry.enabled().count(),
        config.broker_port
    );
    for device in registry.all() {
        println!(
            "  {} -> {} ({}://{}:{}, {})",
            device.name,
            device.key,
            device.protocol,
            device.address,
            device.port,
            if device.enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}
