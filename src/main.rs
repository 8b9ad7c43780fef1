use anyhow::Context;
use clap::Parser;
use std::process;
use tokio::io::BufReader;
use tracing::{error, info};

use coord_node::cli::{Cli, CliHandler};
use coord_node::config::{load_peers, require_member, NodeConfig, SinkConfig};
use coord_node::events::sink_from_config;
use coord_node::{logging, Node};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Everything that can fail before networking starts exits with status 1
    let (peers, config) = match load(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = logging::init(&config.log_level, cli.log_dir.clone()) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    let sink_config = SinkConfig::from_env();
    let mut nodes = Vec::with_capacity(cli.ids.len());
    for &id in &cli.ids {
        let sink = sink_from_config(id, &sink_config);
        match Node::start(id, &peers, config.clone(), sink).await {
            Ok(node) => nodes.push(node),
            Err(e) => {
                error!(node = id, "Failed to start: {}", e);
                eprintln!("Error: {}", e);
                for node in &nodes {
                    node.shutdown().await;
                }
                process::exit(1);
            }
        }
    }

    let handler = CliHandler::new(nodes);
    info!("Running nodes {:?}; type 'help' for commands", handler.node_ids());

    // SIGINT/SIGTERM take the same path as `quit`
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    }) {
        error!("Failed to install signal handler: {}", e);
    }

    handler.run(BufReader::new(tokio::io::stdin()), rx).await;
    handler.shutdown().await;
    info!("Goodbye");
    process::exit(0);
}

fn load(cli: &Cli) -> anyhow::Result<(coord_node::PeerMap, NodeConfig)> {
    let peers = load_peers(&cli.peers).with_context(|| format!("loading {}", cli.peers.display()))?;
    for &id in &cli.ids {
        require_member(&peers, id)?;
    }
    let config = match &cli.config {
        Some(path) => NodeConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };
    config.validate()?;
    Ok((peers, config))
}
