//! `tunnox-client` binary: dials a tunnox server node, authenticates, and
//! keeps the process alive serving source/target tunnels for whatever port
//! mappings the server hands back.

use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnox_client::{Client, ClientConfig};

/// Connects to a tunnox server and serves this node's port mappings.
#[derive(Parser, Debug)]
#[command(name = "tunnox-client")]
#[command(about = "Reverse tunnel client for the tunnox fabric", long_about = None)]
struct Cli {
    /// Server node address, host:port.
    #[arg(long, env = "TUNNOX_SERVER_ADDR")]
    server: SocketAddr,

    /// Auth code identifying a registered user. Empty for an anonymous client.
    #[arg(long, env = "TUNNOX_AUTH_CODE", default_value = "")]
    auth_code: String,

    /// Shared secret paired with `auth_code`.
    #[arg(long, env = "TUNNOX_SECRET_KEY", default_value = "")]
    secret_key: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TUNNOX_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match connect_and_wait(cli).await {
        Ok(Shutdown::Signal) => ExitCode::from(130),
        Ok(Shutdown::Graceful) => ExitCode::from(0),
        Err(e) => {
            tracing::error!(error = %e, "tunnox-client exited with an error");
            ExitCode::from(1)
        }
    }
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Why the client stopped running, per spec.md §6's exit code table: `0`
/// for a graceful top-level close, `130` for a caught `SIGINT`/`SIGTERM`.
enum Shutdown {
    Graceful,
    Signal,
}

async fn connect_and_wait(cli: Cli) -> Result<Shutdown> {
    let mut config = ClientConfig::anonymous(cli.server, cli.secret_key);
    config.auth_code = cli.auth_code;

    let client = Client::connect(config)
        .await
        .with_context(|| format!("failed to connect to {}", cli.server))?;

    let mappings = client.request_config().await.context("initial config_get failed")?;
    tracing::info!(mapping_count = mappings.len(), "fetched initial mapping set");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received, closing");
    client.close().await;
    Ok(Shutdown::Signal)
}
