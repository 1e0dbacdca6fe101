//! Outpost edge server binary
//!
//! Publicly reachable end of the tunnel. TLS termination is expected to
//! happen upstream; this process serves plain HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use outpost_edge::{EdgeConfig, EdgeServer, DEFAULT_REQUEST_TIMEOUT};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Outpost edge - public entry point for tunneled HTTP services
#[derive(Parser, Debug)]
#[command(name = "outpost-edge")]
#[command(about = "Outpost edge - public entry point for tunneled HTTP services")]
#[command(version)]
struct Cli {
    /// Listener port
    #[arg(long, env = "PORT", default_value_t = outpost_edge::DEFAULT_EDGE_PORT)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Per-request deadline in seconds
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    request_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let bind_addr: SocketAddr = format!("{}:{}", cli.bind, cli.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", cli.bind, cli.port))?;

    let config = EdgeConfig {
        bind_addr,
        request_timeout: Duration::from_secs(cli.request_timeout),
    };

    EdgeServer::new(config)
        .start()
        .await
        .context("Edge server failed")?;

    Ok(())
}
