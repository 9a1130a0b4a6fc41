//! CLI for swarmkeeper
//!
//! Provides command-line interface functionality for:
//! - Discovering peers and bootstrapping cluster membership
//! - Running reconciliation and health monitoring, once or as daemons
//! - Inspecting and resetting local state

mod cli_handler;

pub use cli_handler::CliHandler;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file; defaults to the first file found on the search path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// List candidate peers on the local network
    Discover,
    /// Join an existing cluster or found a new one
    Bootstrap,
    /// Reconcile declared and observed cluster state
    Reconcile {
        /// Keep running on the configured interval
        #[arg(long)]
        daemon: bool,
    },
    /// Check cluster health and write the health report
    Monitor {
        /// Keep running on the configured interval
        #[arg(long)]
        daemon: bool,
    },
    /// Run bootstrap, the token service and both loops until stopped
    Agent,
    /// Show persisted membership and the latest health report
    Status,
    /// Forget persisted membership
    Reset,
}

impl Commands {
    /// Long-running commands log to the rolling file as well.
    pub fn is_daemon(&self) -> bool {
        match self {
            Commands::Agent => true,
            Commands::Reconcile { daemon } | Commands::Monitor { daemon } => *daemon,
            _ => false,
        }
    }
}
