//! Outpost CLI - expose a local HTTP service through an outpost edge
//!
//! `outpost init <url>` configures the edge, `outpost [port]` opens the
//! tunnel and keeps it open with automatic reconnection, `outpost status`
//! reports the persisted connection state.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use outpost_client::{
    config::normalize_domain, run_with_reconnect, ConfigStore, RunConfig, DEFAULT_LOCAL_PORT,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Outpost - tunnel a local HTTP service to a public edge server
#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Outpost - tunnel a local HTTP service to a public edge server")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configure the edge server URL
    Init {
        /// Edge base URL (e.g. https://tunnel.example.com)
        url: String,
    },

    /// Show configured domain and connection state
    Status,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Local port to expose
    port: Option<u16>,

    /// Local port to expose (overrides the positional argument)
    #[arg(long = "port", env = "OUTPOST_PORT")]
    port_flag: Option<u16>,

    /// Edge base URL (overrides the configured domain)
    #[arg(long, env = "OUTPOST_DOMAIN")]
    domain: Option<String>,

    /// Maximum reconnection attempts before giving up (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_reconnect_attempts: usize,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let store = ConfigStore::new().context("Failed to locate config directory")?;

    match cli.command {
        Some(Commands::Init { url }) => init(&store, &url),
        Some(Commands::Status) => status(&store),
        None => run(&store, cli.run).await,
    }
}

fn init(store: &ConfigStore, url: &str) -> Result<()> {
    let domain = normalize_domain(url).context("Invalid edge URL")?;

    let config = store
        .save_domain(&domain)
        .context("Failed to write configuration")?;

    println!("Configured edge: {}", config.domain);
    Ok(())
}

fn status(store: &ConfigStore) -> Result<()> {
    match store.load()? {
        Some(config) => println!("Domain:    {}", config.domain),
        None => {
            println!("Domain:    (not configured - run `outpost init <url>`)");
            return Ok(());
        }
    }

    match store.read_status()? {
        Some(status) if status.connected => {
            let uptime = Utc::now().signed_duration_since(status.connected_at);
            println!("State:     connected");
            println!("Port:      {}", status.port);
            println!("Uptime:    {}", format_uptime(uptime.num_seconds().max(0)));
        }
        _ => println!("State:     disconnected"),
    }

    Ok(())
}

async fn run(store: &ConfigStore, args: RunArgs) -> Result<()> {
    let domain = match args.domain {
        Some(domain) => normalize_domain(&domain).context("Invalid edge URL")?,
        None => match store.load()? {
            Some(config) => config.domain,
            None => bail!("No edge configured - run `outpost init <url>` first"),
        },
    };

    let local_port = args.port_flag.or(args.port).unwrap_or(DEFAULT_LOCAL_PORT);

    let max_attempts = match args.max_reconnect_attempts {
        0 => None,
        n => Some(n),
    };

    info!("Tunneling {} -> localhost:{}", domain, local_port);

    let run_config = RunConfig {
        domain,
        local_port,
        max_reconnect_attempts: max_attempts,
    };

    let cancel = CancellationToken::new();
    let run_store = ConfigStore::at(store.dir());
    let tunnel = tokio::spawn(run_with_reconnect(run_config, run_store, cancel.clone()));
    tokio::pin!(tunnel);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
            let _ = (&mut tunnel).await;
        }
        result = &mut tunnel => {
            match result {
                Ok(Ok(())) => info!("Tunnel stopped"),
                Ok(Err(e)) => {
                    error!("Tunnel failed: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Tunnel task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

fn format_uptime(total_secs: i64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
