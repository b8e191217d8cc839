//! Run command - start the routing engine

use anyhow::{Context, Result};
use clap::Args;
use routeguard_core::{Config, RoutingEngine, StatsSnapshot, TunnelStatus};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Run command arguments
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Ruleset directory (overrides `routing.rulesets_dir`)
    #[arg(long, value_name = "DIR")]
    pub rulesets: Option<PathBuf>,

    /// Primary DNS upstream (overrides `dns.upstream`)
    #[arg(long, value_name = "ADDR")]
    pub dns: Option<SocketAddr>,

    /// Answer LAN DNS queries on this address (enables `dns.enabled`)
    #[arg(long, value_name = "ADDR")]
    pub serve_dns: Option<SocketAddr>,

    /// Report this tunnel interface as connected (overrides `vpn.interface`)
    #[arg(long, value_name = "IFACE")]
    pub vpn_interface: Option<String>,

    /// Seconds between statistics reports
    #[arg(long, value_name = "SECS", default_value = "60")]
    pub stats_interval: u64,

    /// Validate configuration and load rules, then exit
    #[arg(long)]
    pub dry_run: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            rulesets: None,
            dns: None,
            serve_dns: None,
            vpn_interface: None,
            stats_interval: 60,
            dry_run: false,
        }
    }
}

/// Execute the run command
pub fn execute(args: RunArgs, config_path: Option<&Path>) -> Result<()> {
    info!("Starting RouteGuard...");

    let config = load_config(&args, config_path)?;
    config.validate().context("Configuration validation failed")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("routeguard")
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(serve(config, &args))
}

fn load_config(args: &RunArgs, config_path: Option<&Path>) -> Result<Config> {
    let mut config = super::config::load(config_path)?;

    // Apply command-line overrides
    if let Some(dir) = &args.rulesets {
        config.routing.rulesets_dir = Some(dir.clone());
    }
    if let Some(dns) = args.dns {
        config.dns.upstream = dns;
    }
    if let Some(listen) = args.serve_dns {
        config.dns.enabled = true;
        config.dns.listen = listen;
    }
    if let Some(interface) = &args.vpn_interface {
        config.vpn.interface = Some(interface.clone());
    }

    Ok(config)
}

async fn serve(config: Config, args: &RunArgs) -> Result<()> {
    let tunnel = Arc::new(TunnelStatus::new());
    if let Some(interface) = &config.vpn.interface {
        tunnel.connect(interface.clone());
        info!(interface = %interface, "VPN tunnel marked connected");
    } else {
        warn!("No VPN interface configured; vpn routes fall back to the default route");
    }

    let engine = RoutingEngine::from_config(config, tunnel)
        .context("Failed to start routing engine")?;

    if args.dry_run {
        warn!("Dry run mode - exiting after startup");
        log_stats(&engine.stats());
        return Ok(());
    }

    let maintenance = engine.start_maintenance();

    // Set up signal handler
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        shutdown_tx.send_replace(true);
    })
    .context("Failed to set signal handler")?;

    let dns_server = if engine.config().dns.enabled {
        let server = engine.serve_dns().await.context("Failed to bind DNS server")?;
        info!(addr = %server.local_addr(), "Answering DNS queries");
        Some(tokio::spawn(server.run(shutdown_rx.clone())))
    } else {
        None
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval.max(1)));
    // first tick fires immediately
    ticker.tick().await;

    info!("RouteGuard running - press Ctrl-C to stop");
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => log_stats(&engine.stats()),
        }
    }

    if let Some(handle) = dns_server {
        match handle.await {
            Ok(Err(e)) => warn!(error = %e, "DNS server failed"),
            Err(e) => warn!(error = %e, "DNS server task panicked"),
            Ok(Ok(())) => {}
        }
    }
    maintenance.stop().await;
    log_stats(&engine.stats());
    info!("RouteGuard stopped");
    Ok(())
}

fn log_stats(stats: &StatsSnapshot) {
    let hit_ratio = stats
        .cache_hit_ratio()
        .map_or_else(|| "-".to_string(), |r| format!("{:.1}%", r * 100.0));
    info!(
        rules = stats.rule_count,
        generation = stats.generation,
        live_flows = stats.live_flows,
        direct = stats.routed_direct,
        vpn = stats.routed_vpn,
        blocked = stats.blocked,
        vpn_fallbacks = stats.vpn_fallbacks,
        cache_entries = stats.cache_entries,
        cache_hit_ratio = %hit_ratio,
        upstream_queries = stats.upstream_queries,
        coalesced = stats.coalesced,
        adblock_vetoes = stats.adblock_vetoes,
        dns_queries = stats.dns_queries,
        bypass_applied = stats.bypass_applied,
        passthrough = stats.passthrough,
        "Statistics"
    );
}
