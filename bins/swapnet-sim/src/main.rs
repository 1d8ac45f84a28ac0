//! swapnet Simulator
//!
//! Runs a mesh of exchange nodes, relays and a rendezvous server inside one
//! process and reports how each node reaches its neighbour.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use swapnet_core::PeerPath;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod mesh;

use config::SimConfig;
use mesh::Mesh;

/// swapnet - P2P exchange connectivity simulator
#[derive(Parser)]
#[command(name = "swapnet-sim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "swapnet-sim.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulation
    Run {
        /// Number of exchange nodes
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Number of relay servers
        #[arg(short, long)]
        relays: Option<usize>,

        /// Run time in seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Run {
            nodes,
            relays,
            duration,
        } => cmd_run(cli.config, nodes, relays, duration).await,
        Commands::Config => cmd_config(cli.config).await,
    }
}

async fn cmd_run(
    config_path: PathBuf,
    nodes: Option<usize>,
    relays: Option<usize>,
    duration: Option<u64>,
) -> Result<()> {
    let mut config = SimConfig::load_or_create(&config_path).await?;
    if let Some(n) = nodes {
        config.simulation.nodes = n;
    }
    if let Some(r) = relays {
        config.simulation.relays = r;
    }
    if let Some(d) = duration {
        config.simulation.duration_secs = d;
    }
    config.validate()?;

    info!(
        "Simulating {} nodes ({} behind NAT) and {} relays for {}s",
        config.simulation.nodes,
        config.simulation.nat_nodes,
        config.simulation.relays,
        config.simulation.duration_secs
    );

    let mesh = Mesh::build(&config)?;
    mesh.start().await;

    // Let discovery find the neighbours before trading
    mesh.settle(Duration::from_millis(config.discovery.discovery_interval_ms))
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.simulation.duration_secs);
    let mut round = 0;
    let mut delivered = 0;
    let mut failed = 0;
    let mut relayed = 0;
    while tokio::time::Instant::now() < deadline {
        for delivery in mesh.exchange_round(round).await {
            if !delivery.sent {
                warn!("Round {}: {} -> {} not delivered", round, delivery.from, delivery.to);
                failed += 1;
                continue;
            }
            delivered += 1;
            if matches!(delivery.path, Some(PeerPath::Relayed(_))) {
                relayed += 1;
            }
        }
        round += 1;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    mesh.settle(Duration::from_millis(200)).await;
    print_status(&mesh).await;

    println!();
    println!("Rounds: {}", round);
    println!("Sent: {} ({} relayed), failed: {}", delivered, relayed, failed);

    mesh.stop().await;
    Ok(())
}

async fn print_status(mesh: &Mesh) {
    println!();
    println!(
        "{:<10} {:<6} {:<8} {:<8} {:<8} {:<10} {:<10}",
        "Node", "NAT", "Peers", "Relays", "Routes", "Direct rx", "Relay rx"
    );
    println!("{}", "-".repeat(66));

    for node in mesh.nodes() {
        let discovery = node.context.discovery();
        let relay = node.context.relay();
        println!(
            "{:<10} {:<6} {:<8} {:<8} {:<8} {:<10} {:<10}",
            node.id.short(),
            if node.behind_nat { "yes" } else { "no" },
            discovery.connected_peers().await.len(),
            relay.connected_count().await,
            relay.active_routes().await.len(),
            node.direct_received.load(Ordering::Relaxed),
            node.relayed_received.load(Ordering::Relaxed),
        );
    }
}

async fn cmd_config(config_path: PathBuf) -> Result<()> {
    let config = SimConfig::load_or_create(&config_path).await?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
