//! Operator command line client for the Gravel cluster.

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use client::Cluster;
use gv_core::coordinator::InfoClient;
use gv_core::info::{format_shard_list, ClusterState};

#[derive(Parser)]
#[command(name = "gravelctl")]
#[command(about = "A simple command line client for Gravel")]
struct Args {
    /// Coordinator (etcd) address
    #[arg(short, long, default_value = "localhost:2379")]
    etcd: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Get a key
    Get { key: String },
    /// Put a key
    Put { key: String, value: String },
    /// Delete a key
    Del { key: String },
    /// Print every key
    List,
    /// Print every key-value pair
    Dump,
    /// Print cluster info
    Info,
    /// Ping every node and record availability in the coordinator
    Health,
    /// Rebalance shards over the current nodes
    Migrate,
    /// Request the graceful removal of a node
    Remove { id: usize },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Get { key } => {
            let cluster = Cluster::connect(&args.etcd).await?;
            println!("shard:\t{}", cluster.shard_for_key(key.as_bytes()));
            if let Some(node) = cluster.index_for_key(key.as_bytes()) {
                println!("node:\t{node}");
            }
            match cluster.get(key.as_bytes()).await? {
                Some(value) => println!("value:\t{}", String::from_utf8_lossy(&value)),
                None => println!("(not found)"),
            }
        }
        Command::Put { key, value } => {
            let cluster = Cluster::connect(&args.etcd).await?;
            println!("shard:\t{}", cluster.shard_for_key(key.as_bytes()));
            if let Some(node) = cluster.index_for_key(key.as_bytes()) {
                println!("node:\t{node}");
            }
            cluster.put(key.as_bytes(), value.as_bytes()).await?;
            println!("ok");
        }
        Command::Del { key } => {
            let cluster = Cluster::connect(&args.etcd).await?;
            cluster.delete(key.as_bytes()).await?;
            println!("ok");
        }
        Command::List => {
            let cluster = Cluster::connect(&args.etcd).await?;
            let pairs = cluster.scan().await?;
            for (key, _) in &pairs {
                println!("{}", String::from_utf8_lossy(key));
            }
            println!("total {}", pairs.len());
        }
        Command::Dump => {
            let cluster = Cluster::connect(&args.etcd).await?;
            let pairs = cluster.scan().await?;
            for (key, value) in &pairs {
                println!(
                    "{}: {}",
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(value)
                );
            }
            println!("total {}", pairs.len());
        }
        Command::Info => {
            let info = InfoClient::connect(&args.etcd).await?;
            info.get().await?;
            print_info(&info);
        }
        Command::Health => {
            let cluster = Cluster::connect(&args.etcd).await?;
            for id in cluster.info().node_ids() {
                let alive = cluster.ping_node(id).await;
                cluster.info().set_available(id, alive).await?;
                println!(
                    "node {id} ({}): {}",
                    cluster.info().address(id).unwrap_or_default(),
                    if alive { "ok" } else { "unavailable" }
                );
            }
        }
        Command::Migrate => {
            let info = InfoClient::connect(&args.etcd).await?;
            if info.migrate().await? {
                println!("migration started");
            } else {
                println!("There was nothing to migrate");
            }
        }
        Command::Remove { id } => {
            let info = InfoClient::connect(&args.etcd).await?;
            info.request_remove(id).await?;
            println!("node {id} marked for removal; run \"gravelctl migrate\" to drain it");
        }
    }
    Ok(())
}

fn print_info(info: &InfoClient) {
    let map = info.current();
    let state = match map.state() {
        ClusterState::Init => "INIT",
        ClusterState::Running => "RUNNING",
        ClusterState::Migrating => "MIGRATING",
    };
    println!("state: {state}");
    println!("nodes: {}", map.num_nodes());
    println!("shards: {}", map.num_shards());
    for (id, entry) in map.entries().iter().enumerate() {
        if entry.address.is_empty() {
            continue;
        }
        println!("node {id}:");
        println!("  address: {}", entry.address);
        let shards: Vec<_> = entry.shards.iter().copied().collect();
        if !shards.is_empty() {
            println!(
                "  shards: {} ({})",
                format_shard_list(&shards),
                shards.len()
            );
        }
        let future: Vec<_> = entry.future.iter().copied().collect();
        if !future.is_empty() {
            println!(
                "  future: {} ({})",
                format_shard_list(&future),
                future.len()
            );
        }
        if !entry.available {
            println!("  available: false");
        }
        if entry.remove {
            println!("  remove: true");
        }
    }
}
