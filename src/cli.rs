//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Sidecar agent managing a replicated searchd cluster under Kubernetes.
#[derive(Debug, Parser)]
#[command(name = "searchd-sentinel", version, about)]
pub struct Cli {
    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info", env = "SENTINEL_LOG")]
    pub log_level: String,

    /// Path to the agent configuration file.
    #[arg(long, global = true, env = "SENTINEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Development mode: no network discovery, fixture defaults.
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one reconcile pass: discover peers, converge cluster
    /// membership, reconcile the persisted node list.
    Run,

    /// Run one maintenance pass: compact over-fragmented tables unless
    /// another peer is already optimizing.
    Optimize,

    /// Print the engine's view of cluster state.
    Status,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
