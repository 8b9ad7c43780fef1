use std::collections::BTreeMap;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{Command, HELP};
use crate::error::{CoordError, MutexError, Result};
use crate::node::Node;
use crate::protocol::NodeId;

/// What the REPL should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Runs commands against the nodes hosted by this process.
pub struct CliHandler {
    nodes: BTreeMap<NodeId, Node>,
}

impl CliHandler {
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|node| (node.id(), node)).collect(),
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    fn target(&self, id: Option<NodeId>) -> Result<&Node> {
        match id {
            Some(id) => self.nodes.get(&id).ok_or(CoordError::UnknownNode(id)),
            None => self
                .nodes
                .values()
                .next()
                .ok_or_else(|| CoordError::config("No nodes are running in this process")),
        }
    }

    /// Execute one command. Errors are meant for the operator and leave the
    /// nodes untouched.
    pub async fn execute(&self, command: Command) -> Result<Flow> {
        match command {
            Command::Request(id) => {
                let node = self.target(id)?.clone();
                // Opening the request is synchronous so refusals surface here
                node.begin_critical_section()?;
                println!("Node {}: requesting critical section", node.id());
                // Waiting and holding run in the background so the prompt stays responsive
                tokio::spawn(async move {
                    let result = match node.await_critical_section().await {
                        Ok(()) => node.hold_critical_section().await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(()) => info!(node = node.id(), "Critical section done"),
                        Err(CoordError::Mutex(MutexError::QuorumTimeout)) => {
                            warn!(node = node.id(), "Gave up waiting for replies")
                        }
                        Err(CoordError::Shutdown) => {}
                        Err(e) => error!(node = node.id(), "Critical section request failed: {}", e),
                    }
                });
            }
            Command::Elect(id) => {
                let node = self.target(id)?;
                if node.start_election() {
                    println!("Node {}: election started", node.id());
                } else {
                    println!("Node {}: election already in progress", node.id());
                }
            }
            Command::Status(id) => {
                println!("{}", self.target(id)?.status());
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    /// Read commands line by line until `quit`, end of input or a signal on
    /// `interrupt`.
    pub async fn run<R>(&self, input: R, mut interrupt: mpsc::Receiver<()>)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            prompt();
            let line = tokio::select! {
                _ = interrupt.recv() => {
                    info!("Interrupted");
                    break;
                }
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(command) => match self.execute(command).await {
                        Ok(Flow::Quit) => break,
                        Ok(Flow::Continue) => {}
                        Err(e) => println!("Error: {}", e),
                    },
                    Err(e) => println!("Error: {}", e),
                },
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read command: {}", e);
                    break;
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown().await;
        }
    }
}

fn prompt() {
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "> ");
    let _ = out.flush();
}
