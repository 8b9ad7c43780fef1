//! Command-line interface
//!
//! Provides:
//! - Process arguments (which nodes to run, where their configuration lives)
//! - The interactive command language read from stdin
//! - [`CliHandler`], which executes commands against local nodes

mod cli_handler;

pub use cli_handler::{CliHandler, Flow};

use clap::Parser;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::protocol::NodeId;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Node id(s) to run in this process, e.g. `--id 3` or `--id 1,2,3`
    #[arg(long = "id", value_delimiter = ',', required = true)]
    pub ids: Vec<NodeId>,

    /// Cluster membership file
    #[arg(long, default_value = "peers.json")]
    pub peers: PathBuf,

    /// Optional YAML file with timing and transport settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also write JSON logs to a daily rolling file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

pub const HELP: &str = "\
Commands:
  req [ID]      request the critical section, hold it, then release it
  elect [ID]    start a leader election
  status [ID]   show clock, mutex, election and peer state
  help          show this message
  quit          shut down (aliases: exit, kill)

ID defaults to the lowest node id running in this process.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Request(Option<NodeId>),
    Elect(Option<NodeId>),
    Status(Option<NodeId>),
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err("empty command".to_string());
        };
        let target = match words.next() {
            Some(raw) => Some(
                raw.parse::<NodeId>()
                    .map_err(|_| format!("invalid node id '{}'", raw))?,
            ),
            None => None,
        };
        if words.next().is_some() {
            return Err(format!("too many arguments for '{}'", name));
        }

        let command = match name.to_ascii_lowercase().as_str() {
            "req" => Command::Request(target),
            "elect" => Command::Elect(target),
            "status" => Command::Status(target),
            "help" => Command::Help,
            "quit" | "exit" | "kill" => Command::Quit,
            other => return Err(format!("unknown command '{}' (try 'help')", other)),
        };
        if target.is_some() && matches!(command, Command::Help | Command::Quit) {
            return Err(format!("'{}' takes no arguments", name));
        }
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, target) = match self {
            Command::Request(t) => ("req", t),
            Command::Elect(t) => ("elect", t),
            Command::Status(t) => ("status", t),
            Command::Help => return f.write_str("help"),
            Command::Quit => return f.write_str("quit"),
        };
        match target {
            Some(id) => write!(f, "{} {}", name, id),
            None => f.write_str(name),
        }
    }
}
