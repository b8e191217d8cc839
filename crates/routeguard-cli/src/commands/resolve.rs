//! Resolve command - resolution through the caching resolver

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use routeguard_core::{AnswerKind, Lookup, RecordType};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Instant;

/// Resolve command arguments
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Domain to resolve
    pub domain: String,

    /// Record type
    #[arg(short = 't', long = "type", value_enum, default_value = "a")]
    pub rtype: QueryType,

    /// DNS upstream to use (overrides `dns.upstream`)
    #[arg(short, long, value_name = "ADDR")]
    pub server: Option<SocketAddr>,

    /// Also classify the domain with the resolved address
    #[arg(long)]
    pub route: bool,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

/// Supported record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueryType {
    /// IPv4 address
    A,
    /// IPv6 address
    Aaaa,
}

impl From<QueryType> for RecordType {
    fn from(qtype: QueryType) -> Self {
        match qtype {
            QueryType::A => RecordType::A,
            QueryType::Aaaa => RecordType::AAAA,
        }
    }
}

/// Execute resolve command
pub fn execute(args: ResolveArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::config::load(config_path)?;
    if let Some(server) = args.server {
        config.dns.upstream = server;
    }
    let upstream = config.dns.upstream;
    let engine = super::diagnostic_engine(config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let start = Instant::now();
    let lookup = runtime
        .block_on(engine.test_resolve(&args.domain, args.rtype.into()))
        .with_context(|| format!("Resolution of {} via {} failed", args.domain, upstream))?;
    let elapsed = start.elapsed();

    let verdict = args.route.then(|| {
        engine.evaluate(&routeguard_core::Target::domain(&args.domain).with_ip(lookup.answer.first()))
    });

    if args.json {
        return super::print_json(&serde_json::json!({
            "domain": args.domain,
            "lookup": lookup,
            "route": verdict,
        }));
    }

    println!("{}", describe_lookup(&args.domain, args.rtype, &lookup));
    println!("  Resolved in {elapsed:?} via {upstream}");
    if let Some(verdict) = verdict {
        println!(
            "  Route: {} ({})",
            verdict.action,
            verdict.rule_id.as_deref().unwrap_or("default route")
        );
    }
    Ok(())
}

fn describe_lookup(domain: &str, rtype: QueryType, lookup: &Lookup) -> String {
    let rtype = RecordType::from(rtype);
    let source = format!("{:?}", lookup.source).to_lowercase();
    match lookup.answer.kind {
        AnswerKind::Positive => {
            let addrs: Vec<String> = lookup.answer.addrs.iter().map(ToString::to_string).collect();
            format!(
                "{} {} {} → {} (ttl {}s, {})",
                "✓".green(),
                domain,
                rtype,
                addrs.join(", "),
                lookup.answer.ttl_secs,
                source
            )
        }
        AnswerKind::NoData => format!("{} {} {}: no records ({})", "✗".yellow(), domain, rtype, source),
        AnswerKind::NxDomain => format!("{} {} {}: NXDOMAIN ({})", "✗".red(), domain, rtype, source),
        AnswerKind::Blocked => format!("{} {} {}: blocked by ad-block list", "✗".red(), domain, rtype),
    }
}
