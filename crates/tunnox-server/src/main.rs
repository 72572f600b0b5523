//! `tunnox-server` binary: runs one node of the tunnel fabric, accepting
//! control connections and bridging tunnels locally or across peer nodes.

use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnox_server::{Server, ServerConfig};

/// Starts a tunnox server node.
#[derive(Parser, Debug)]
#[command(name = "tunnox-server")]
#[command(about = "Control-plane node for the tunnox reverse-tunneling fabric", long_about = None)]
struct Cli {
    /// This node's id, as stored in peer `Node` records. Defaults to a
    /// freshly generated UUID, which is fine for a single-node deployment
    /// but should be stable across restarts in a cluster.
    #[arg(long, env = "TUNNOX_NODE_ID")]
    node_id: Option<String>,

    /// Address the TCP control listener binds.
    #[arg(long, env = "TUNNOX_LISTEN_ADDR", default_value = "0.0.0.0:7000")]
    listen: SocketAddr,

    /// Address the cross-node forward-session bridge listener binds.
    /// Also the address this node advertises to peers in its `Node` record.
    #[arg(long, env = "TUNNOX_BRIDGE_ADDR", default_value = "0.0.0.0:7001")]
    bridge_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TUNNOX_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli).await {
        Ok(Shutdown::Signal) => ExitCode::from(130),
        Ok(Shutdown::Graceful) => ExitCode::from(0),
        Err(e) => {
            tracing::error!(error = %e, "tunnox-server exited with an error");
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

/// Why the node stopped running, per spec.md §6's exit code table: `0` for
/// a graceful top-level scope close, `130` for a caught `SIGINT`/`SIGTERM`.
enum Shutdown {
    Graceful,
    Signal,
}

async fn run(cli: Cli) -> Result<Shutdown> {
    let node_id = cli.node_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let config = ServerConfig::single_node(node_id.clone(), cli.listen, cli.bridge_addr);
    let server = Server::new(config);
    let scope = server.scope();

    tracing::info!(node_id = %node_id, listen = %cli.listen, bridge = %cli.bridge_addr, "starting tunnox-server");

    let run_scope = scope.clone();
    let run_handle = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = run_handle => {
            result.context("server task panicked")?.context("server run failed")?;
            Ok(Shutdown::Graceful)
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, closing");
            run_scope.close().await;
            Ok(Shutdown::Signal)
        }
    }
}
