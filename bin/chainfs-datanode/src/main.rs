//! ChainFS data node daemon
//!
//! Serves block reads and chained block writes over TCP.

use anyhow::{Context, Result};
use chainfs_common::Config;
use chainfs_datanode::{DataNode, MemoryBlockStore};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "chainfs-datanode")]
#[command(about = "ChainFS storage node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/chainfs/datanode.toml")]
    config: PathBuf,

    /// Listen address for block transfers
    #[arg(short, long, env = "CHAINFS_LISTEN")]
    listen: Option<SocketAddr>,

    /// Maximum packet payload in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Block size in bytes
    #[arg(long)]
    block_size: Option<u64>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists
    let mut config = if args.config.exists() {
        Config::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    if let Some(listen) = args.listen {
        config.node.listen = listen;
    }
    if let Some(size) = args.max_packet_size {
        config.transfer.max_packet_size = size;
    }
    if let Some(size) = args.block_size {
        config.transfer.block_size = size;
    }
    if let Some(level) = args.log_level {
        config.node.log_level = level;
    }
    config.transfer.validate()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.node.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ChainFS data node");
    info!("Config file: {}", args.config.display());
    info!(
        "Packet size: {} bytes, block size: {} bytes, queue capacity: {}",
        config.transfer.max_packet_size, config.transfer.block_size, config.transfer.queue_capacity
    );

    let node = DataNode::bind(
        config.node.listen,
        &config.transfer,
        Arc::new(MemoryBlockStore::new()),
    )
    .with_context(|| format!("binding {}", config.node.listen))?;
    info!("Listening on {}", node.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Joining the accept thread blocks
    tokio::task::spawn_blocking(move || drop(node)).await?;
    Ok(())
}
