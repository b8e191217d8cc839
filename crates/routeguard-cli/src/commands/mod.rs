//! CLI commands

pub mod bypass;
pub mod completions;
pub mod config;
pub mod resolve;
pub mod rules;
pub mod run;

use anyhow::{Context, Result};
use clap::Subcommand;
use routeguard_core::{RoutingEngine, TunnelStatus};
use std::sync::Arc;

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the routing engine (main command)
    Run(run::RunArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Inspect, validate and test routing rules
    Rules(rules::RulesArgs),

    /// Resolve a domain through the caching resolver
    Resolve(resolve::ResolveArgs),

    /// Show what the DPI transform does to a domain's handshake
    Bypass(bypass::BypassArgs),

    /// Print or install a shell completion script
    Completions(completions::CompletionsArgs),
}

/// Build an engine for a one-shot diagnostic command
///
/// The tunnel is reported up only when `[vpn] interface` is set.
fn diagnostic_engine(config: routeguard_core::Config) -> Result<RoutingEngine> {
    let tunnel = Arc::new(TunnelStatus::new());
    if let Some(interface) = &config.vpn.interface {
        tunnel.connect(interface.clone());
    }
    RoutingEngine::from_config(config, tunnel).context("Failed to build routing engine")
}

/// Print `value` as pretty JSON
fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}
