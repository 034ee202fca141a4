//! SSTP client CLI.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sstpc::device::{Channel, EmptyTrustStore, Reporter, TrustStore, TunDevice};
use sstpc::host::{DirTrustStore, LogReporter};
use sstpc::{Config, Engine};

#[derive(Parser)]
#[command(name = "sstpc")]
#[command(about = "SSTP VPN client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; the --verbose flag only sets the fallback level.
    let fallback = if cli.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    info!("Loading configuration from: {}", cli.config);
    let config = Arc::new(
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load configuration from: {}", cli.config))?,
    );

    let trust_store: Arc<dyn TrustStore> = if config.tls.specify_trust {
        Arc::new(DirTrustStore::new(&config.tls.cert_dir))
    } else {
        Arc::new(EmptyTrustStore)
    };
    let reporter = Arc::new(LogReporter);

    let engine = Engine::new(config.clone(), trust_store, reporter.clone());
    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    // Reconnection policy lives here, not in the engine: the engine
    // reports one terminal outcome per attempt.
    let mut attempts_left = if config.reconnect.enabled {
        config.reconnect.count
    } else {
        0
    };

    loop {
        let device = create_device()?;
        let terminal = engine.run(device).await;

        let Some(err) = &terminal.error else {
            info!("VPN session ended");
            return Ok(());
        };
        error!("VPN session failed at {}: {}", terminal.from, err);

        if engine.shutdown_token().is_cancelled() || attempts_left == 0 {
            anyhow::bail!("tunnel failed: {terminal}");
        }

        attempts_left -= 1;
        reporter.notify(
            Channel::Reconnect,
            &format!("retrying in {}s, {} attempts left", config.reconnect.interval, attempts_left),
            0,
        );

        let shutdown = engine.shutdown_token();
        tokio::select! {
            _ = shutdown.cancelled() => anyhow::bail!("tunnel failed: {terminal}"),
            _ = tokio::time::sleep(std::time::Duration::from_secs(config.reconnect.interval)) => {}
        }
    }
}

#[cfg(target_os = "linux")]
fn create_device() -> Result<Box<dyn TunDevice>> {
    let device = sstpc::host::linux_tun::LinuxTun::create()
        .context("Failed to create TUN device (root privileges required)")?;
    Ok(Box::new(device))
}

#[cfg(not(target_os = "linux"))]
fn create_device() -> Result<Box<dyn TunDevice>> {
    anyhow::bail!("no virtual-device backend for this platform; embed the engine instead")
}
