//! Cluster node demo: several in-process nodes sharing a global counter,
//! a chat room and an event bus.

use anyhow::{Context, Result};
use clap::Parser;
use cluster_node::{LocalCluster, SingletonCounterCommand};
use node_config::NodeConfig;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cluster-node", about = "Run a local actor cluster")]
struct Args {
    /// TOML configuration file; NODE__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Nodes started in this process
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    #[arg(long, default_value_t = 5)]
    tick_delay_secs: u64,

    #[arg(long, default_value_t = 10)]
    tick_interval_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load(args.config.as_deref()).context("Failed to load node configuration")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.system.log_level)))
        .with(args.json_logs.then(|| fmt::layer().json()))
        .with((!args.json_logs).then(fmt::layer))
        .init();

    if args.print_config {
        println!("{}", config.to_toml_string()?);
        return Ok(());
    }

    info!(
        nodes = args.nodes,
        hostname = %config.cluster.hostname,
        first_port = config.cluster.port,
        "Starting local cluster"
    );
    let local = LocalCluster::start(&config, args.nodes)?;

    for node in local.nodes() {
        node.start_ticker(
            Duration::from_secs(args.tick_delay_secs),
            Duration::from_secs(args.tick_interval_secs),
        )?;
    }

    greet(&local).await;

    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    if let Some(first) = local.nodes().first() {
        match first.counter().ask(SingletonCounterCommand::GetCount).await {
            Ok(count) => info!(count, "Global counter at shutdown"),
            Err(e) => warn!(error = %e, "Global counter unavailable at shutdown"),
        }
    }
    local.shutdown().await;
    Ok(())
}

/// Join one chat user per node and announce the nodes on the event bus
async fn greet(local: &LocalCluster) {
    for (index, node) in local.nodes().iter().enumerate() {
        let username = format!("user-{}", index + 1);
        match node.chat().join(&username).await {
            Ok(_messages) => {
                if let Err(e) = node.chat().post(&username, "hello").await {
                    warn!(node = %node.address(), error = %e, "Chat post failed");
                }
            }
            Err(e) => warn!(node = %node.address(), username, error = %e, "Chat join failed"),
        }
        if let Err(e) = node.events().publish("node-started", node.address().to_string()) {
            warn!(node = %node.address(), error = %e, "Event bus publish failed");
        }
    }

    if let Some(first) = local.nodes().first() {
        match first.chat().users().await {
            Ok(users) => info!(users = users.len(), "Chat room roster"),
            Err(e) => warn!(error = %e, "Chat roster unavailable"),
        }
    }
}
