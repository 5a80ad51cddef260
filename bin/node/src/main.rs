// shardp2p node entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::{Config, Environment, File};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shardp2p_network::dissemination;
use shardp2p_network::rpc::RpcClient;
use shardp2p_network::{Identity, Node, NodeConfig, NodeMetrics, OverlaySession, PeerAddress, RpcServer, SendPlan};

/// shardp2p node CLI arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Identity and port seed; 0 picks a random identity
    #[clap(long)]
    seed: Option<i64>,

    /// Number of shards, starting at 0, to listen to at startup
    #[clap(long, default_value = "0")]
    listen_shards: u64,

    /// Seed of a peer to resolve through the DHT and connect to
    #[clap(long)]
    find: Option<i64>,

    /// Collation workload as `<numShards>,<numCollations>,<intervalMs>`
    #[clap(long)]
    send: Option<SendPlan>,

    /// Run as a control plane client instead of a node
    #[clap(long)]
    client: bool,

    /// Client command, e.g. `addpeer <ip> <seed>`
    #[clap(value_parser)]
    command: Vec<String>,

    /// Bootstrap peer address, repeatable
    #[clap(long)]
    bootstrap: Vec<String>,

    /// Path to node configuration file
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Log level
    #[clap(long, default_value = "info")]
    log_level: String,

    /// Seed of a peer to add through this node's own control plane once it is up
    #[clap(long)]
    self_test: Option<i64>,
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut builder = Config::builder();
    if let Some(path) = &args.config {
        info!("Loading configuration from {}", path.display());
        builder = builder.add_source(File::from(path.clone()).required(true));
    }

    let mut node_config: NodeConfig = builder
        .add_source(Environment::with_prefix("SHARDP2P").try_parsing(true))
        .build()
        .context("Failed to load configuration")?
        .try_deserialize()
        .context("Failed to parse node configuration")?;

    if let Some(seed) = args.seed {
        node_config.seed = seed;
    }
    node_config.bootstrap_peers.extend(args.bootstrap.iter().cloned());
    node_config.validate().context("Invalid configuration")?;

    Ok(node_config)
}

/// Usage errors that can only be detected once the configuration is known
fn check_usage(args: &Args, config: &NodeConfig) -> Result<()> {
    if !args.client && !args.command.is_empty() {
        bail!("Unexpected arguments {:?}; commands need --client", args.command);
    }
    if let Some(plan) = &args.send {
        plan.check_shards(config.num_shards)
            .with_context(|| format!("Invalid --send {}", plan))?;
    }
    Ok(())
}

/// One-shot control plane call against the node with our seed
async fn run_client(config: &NodeConfig, command: &[String]) -> Result<()> {
    let (ip, seed) = match command {
        [cmd, ip, seed] if cmd == "addpeer" => {
            let seed: i64 = seed.parse().with_context(|| format!("Client mode: addpeer: bad seed {}", seed))?;
            (ip.as_str(), seed)
        }
        [cmd, ..] if cmd == "addpeer" => bail!("Client mode: addpeer: wrong args"),
        [cmd, ..] => bail!("Client mode: unknown command {}", cmd),
        [] => bail!("Client mode: wrong args"),
    };

    let rpc_addr = config.rpc_addr()?;
    let response = RpcClient::new(rpc_addr).add_peer(ip, seed).await
        .context("Control plane call failed")?;

    if response.success {
        info!("addpeer {} {}: added {}", ip, seed, response.peer_id.unwrap_or_default());
    } else {
        warn!("addpeer {} {} failed: {}", ip, seed, response.error.unwrap_or_default());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG takes precedence over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let config = load_config(&args)?;
    check_usage(&args, &config)?;

    if args.client {
        return run_client(&config, &args.command).await;
    }

    info!("Starting shardp2p node with seed {}", config.seed);

    let identity = Identity::derive(config.seed).context("Failed to derive identity")?;
    let metrics = NodeMetrics::new()?;
    let overlay = OverlaySession::open(&identity, &config, metrics.clone()).await
        .context("Failed to open overlay session")?;
    let node = Arc::new(Node::new(config.clone(), Arc::new(overlay), metrics).await?);
    info!("I am {}", node.full_addr().await?);

    let known_peers = config.bootstrap_peers.iter()
        .map(|addr| addr.parse::<PeerAddress>().with_context(|| format!("Bad bootstrap peer {}", addr)))
        .collect::<Result<Vec<_>>>()?;
    node.bootstrap(&known_peers).await.context("Bootstrap failed")?;

    if let Some(peer_seed) = args.find {
        match Identity::peer_id_for_seed(peer_seed) {
            Ok(peer_id) => {
                if let Err(e) = node.find_and_connect(peer_id).await {
                    warn!("Failed to connect {}: {}", peer_id, e);
                }
            }
            Err(e) => error!("Failed to derive peer id for seed {}: {}", peer_seed, e),
        }
    }

    info!("Sending subscriptions...");
    node.listen_and_announce(args.listen_shards).await
        .context("Failed to subscribe to shards")?;

    if let Some(plan) = args.send {
        // Workers run in the background; launch only staggers their start
        dissemination::launch(node.clone(), plan).await;
    }

    info!("{}: listening for connections", node.name());

    let server = RpcServer::new(node.clone())?;
    if let Some(target_seed) = args.self_test {
        let rpc_addr = server.addr();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match RpcClient::new(rpc_addr).add_peer("127.0.0.1", target_seed).await {
                Ok(response) => info!("Self-test addpeer {}: {:?}", target_seed, response),
                Err(e) => warn!("Self-test addpeer {} failed: {}", target_seed, e),
            }
        });
    }

    server.serve().await?;
    Ok(())
}
