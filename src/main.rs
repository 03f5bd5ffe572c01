//! namedock daemon entry point.
//!
//! Startup order matters: the root CA is looked up exactly once, before the
//! listener binds. A missing or unparseable CA logs a warning and disables
//! HTTPS interception for the process lifetime; everything else runs
//! normally. Binding the listen port is the only fatal failure.

use anyhow::{Context, Result};
use clap::Parser;
use namedock::{
    ca::CertificateAuthority,
    cli::Cli,
    config,
    proxy::{AppState, MitmEngine, ProxyServer},
    registry::{ProcScanner, ServiceCache},
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    debug!("Parsed CLI arguments: {:?}", cli);

    let mitm = match CertificateAuthority::load(cli.ca_root.as_deref()) {
        Ok(ca) => Some(Arc::new(MitmEngine::new(Arc::new(ca)))),
        Err(e) => {
            warn!("HTTPS interception disabled: {}", e);
            None
        }
    };

    let services = Arc::new(ServiceCache::new(
        Arc::new(ProcScanner::new()),
        config::REGISTRY_TTL,
    ));

    let state = Arc::new(AppState::new(services, mitm));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::bind(cli.port, state, shutdown_rx)
        .await
        .context("Failed to bind proxy listener")?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run().await.context("Proxy server failed")?;

    Ok(())
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
