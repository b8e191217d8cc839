//! Command-line argument parsing

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::commands::Command;

/// RouteGuard - local routing gateway
///
/// Routes each flow direct, through a VPN tunnel, or drops it, according to
/// prioritized domain/GeoIP/CIDR rules. Includes a caching DNS resolver with
/// ad-block and a TLS ClientHello fragmenter for DPI evasion.
#[derive(Parser, Debug)]
#[command(name = "routeguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Subcommand to execute (default: run)
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Configuration file path
    #[arg(short = 'c', long, global = true, value_name = "FILE", env = "ROUTEGUARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format for logs (default: from config)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Run in quiet mode (errors only)
    #[arg(short, long, global = true)]
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
