//! Command-line argument parsing

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::commands::Command;

/// desync - ClientHello desynchronization engine
///
/// Rewrites the outgoing TLS and QUIC handshakes of configured hosts so a
/// DPI middlebox cannot follow them, and searches for the strategy that
/// works against a given network.
#[derive(Parser, Debug)]
#[command(name = "desync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (default: search the usual locations)
    #[arg(short = 'c', long, global = true, value_name = "FILE", env = "DESYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format for logs (default: from the configuration)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text
    Text,
    /// JSON format
    Json,
    /// Compact format
    Compact,
}
