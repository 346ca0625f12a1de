//! Hexmon Signage Player
//!
//! Unattended device runtime: pairs with the backend, keeps a local media
//! cache, plays the scheduled timeline and serves remote commands.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hexmon_common::config::{self, Config};
use hexmon_player::flow::{Collaborators, PlayerFlow};
use hexmon_player::lock::SingleInstanceLock;

/// Hexmon Signage Player - device control plane and media pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory (overrides HEXMON_DATA_DIR and the default)
    #[arg(short, long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Configuration file path (defaults to {dataDir}/config.json)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend base URL (overrides the configuration file)
    #[arg(long, value_name = "URL")]
    api_base: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("hexmon_player={log_level},hexmon_common={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Hexmon Signage Player starting...");

    let data_dir = config::resolve_data_dir(args.data_dir.as_deref());
    std::fs::create_dir_all(&data_dir)?;
    info!("Data directory: {}", data_dir.display());

    // A second instance on the same host exits immediately
    let _instance_lock = SingleInstanceLock::acquire(&data_dir)?;

    let config_path = args
        .config
        .unwrap_or_else(|| data_dir.join("config.json"));
    let mut config = Config::load(&config_path)?;
    if let Some(api_base) = args.api_base {
        config.api_base = api_base;
    }

    // Invalid configuration is the only fatal startup error
    if let Err(e) = config.validate() {
        error!("Refusing to start: {e}");
        return Err(e.into());
    }

    let flow = PlayerFlow::new(config, config_path, &data_dir, Collaborators::default())?;
    flow.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    flow.stop().await;

    Ok(())
}
