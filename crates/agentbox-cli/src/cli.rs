//! CLI argument definitions for agentbox
//!
//! Uses clap for argument parsing.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// agentbox - network mediation for sandboxed agents
///
/// Runs a local forward proxy that injects API credentials into plain HTTP
/// requests, tunnels HTTPS untouched, and records every decision in an
/// audit log.
#[derive(Parser, Debug)]
#[command(name = "agentbox")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v info, -vv debug, -vvv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy in the foreground until Ctrl-C
    #[command(after_help = "EXAMPLES:
    # Default configuration, log to ./.agentbox/network.log
    agentbox proxy

    # Explicit configuration and log file
    agentbox proxy --config agentbox.json --log /tmp/network.log
")]
    Proxy(CommonArgs),

    /// Run a command with a sanitized environment behind the proxy
    #[command(trailing_var_arg = true)]
    #[command(after_help = "EXAMPLES:
    # Run an agent; its HTTP clients go through the proxy
    agentbox exec -- claude

    # Custom configuration
    agentbox exec --config agentbox.json -- python agent.py
")]
    Exec(ExecArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Configuration file path (JSON)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Audit log path (default: ./.agentbox/network.log)
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Command to run, followed by its arguments
    #[arg(required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}
