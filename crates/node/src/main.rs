//! Gravel storage node entrypoint.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use node::config::Config;
use node::GravelNode;

#[derive(Parser, Debug)]
#[command(name = "gravel-node")]
#[command(about = "Start a Gravel storage node")]
struct Args {
    /// Storage engine directory
    #[arg(short = 'p', long)]
    path: Option<PathBuf>,

    /// Hostname advertised to the cluster
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Listening port
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Coordinator (etcd) address
    #[arg(short, long)]
    etcd: Option<String>,

    /// Number of serving threads
    #[arg(short, long)]
    threads: Option<usize>,

    /// Number of initial shards (used when bootstrapping a new cluster)
    #[arg(short, long)]
    shards: Option<u32>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Configuration file path (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(path) = args.path {
        config.storage.data_dir = path;
    }
    if let Some(host) = args.host {
        config.node.host = host;
    }
    if let Some(port) = args.port {
        config.node.port = port;
    }
    if let Some(etcd) = args.etcd {
        config.node.etcd = etcd;
    }
    if let Some(threads) = args.threads {
        config.server.threads = threads;
    }
    if let Some(shards) = args.shards {
        config.node.num_shards = shards;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    let level = Level::from_str(&config.log.level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.threads.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let node = GravelNode::start(config).await?;
        let result = node.run().await;
        info!("node stopped");
        result
    })
}
