//! gramtun client
//!
//! Brings up the TUN device, connects to the messaging bridge and runs
//! the interactive tunnel loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use gramtun::app::App;
use gramtun::backend::remote::RemoteBackend;
use gramtun::config::Config;
use gramtun::session::ConsoleCredentials;
use gramtun::tun::TunInterface;

/// gramtun client - IP tunnel over a text-messaging transport
#[derive(Parser, Debug)]
#[command(name = "gramtun-client")]
#[command(about = "gramtun client - IP tunnel over a text-messaging transport")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    // Load configuration
    let config = Config::load(&args.config).context("Failed to load configuration")?;

    // Bring up the TUN device before touching the network
    let tun = open_tun(&config).context("Failed to create tun device")?;
    info!(
        "tun device {} is up: {}/{}",
        tun.name(),
        config.tun.ip,
        config.tun.prefix
    );

    // Connect to the messaging bridge
    let backend = RemoteBackend::connect(&config.backend.bridge_addr)
        .await
        .context("Failed to connect to the messaging bridge")?;
    info!("connected to bridge at {}", config.backend.bridge_addr);

    let credentials = ConsoleCredentials::new(config.backend.phone_number.clone());
    let app = App::new(config, Arc::new(backend), tun, Box::new(credentials));
    app.run().await?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_tun(config: &Config) -> Result<Box<dyn TunInterface + Send>> {
    let tun = gramtun::tun::LinuxTun::open(
        &config.tun.name,
        config.tun.ip,
        config.tun.prefix,
        config.tun.mtu,
    )?;
    Ok(Box::new(tun))
}

#[cfg(not(target_os = "linux"))]
fn open_tun(_config: &Config) -> Result<Box<dyn TunInterface + Send>> {
    anyhow::bail!("tun devices are only supported on Linux")
}
