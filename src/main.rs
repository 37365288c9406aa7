//! kapsule-dbus-proxy - standalone D-Bus proxy for one container.
//!
//! Connects a container's private bus to the host session bus and keeps
//! the name routing in sync until interrupted.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kapsule_dbus_proxy::{DbusProxy, ProxyConfig, Result};

/// D-Bus proxy between a container bus and the host session bus.
#[derive(Parser, Debug)]
#[command(name = "kapsule-dbus-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Container's private D-Bus address.
    ///
    /// Should be in D-Bus address format, e.g., "unix:path=/path/to/socket".
    #[arg(long, short = 'c')]
    container_bus: String,

    /// Host session bus address.
    ///
    /// If not specified, uses the DBUS_SESSION_BUS_ADDRESS environment variable.
    #[arg(long, short = 'H')]
    host_bus: Option<String>,

    /// Log level filter (e.g., "debug", "info", "warn", "error").
    #[arg(long, short = 'v', default_value = "info")]
    log_level: String,
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    info!("Received shutdown signal");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        built = env!("BUILD_TIMESTAMP"),
        git = option_env!("GIT_HASH").unwrap_or("unknown"),
        container_bus = %args.container_bus,
        host_bus = ?args.host_bus,
        "Starting kapsule-dbus-proxy"
    );

    let mut config = ProxyConfig::new(args.container_bus);
    if let Some(host_bus) = args.host_bus {
        config = config.with_host_bus(host_bus);
    }

    let proxy = DbusProxy::new(config);
    proxy.start().await?;

    let result = tokio::select! {
        result = proxy.run() => result,
        result = shutdown_signal() => {
            info!("Shutting down");
            result
        }
    };

    proxy.stop().await;

    if let Err(e) = &result {
        error!(error = %e, "Proxy error");
    }
    result
}
