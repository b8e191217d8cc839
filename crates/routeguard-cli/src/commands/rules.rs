//! Rules command - inspect, validate and test routing rules

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::{ColoredString, Colorize};
use routeguard_core::rules::loader;
use routeguard_core::{RouteAction, Rule, Target, Verdict};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Rules command arguments
#[derive(Args, Debug)]
pub struct RulesArgs {
    #[command(subcommand)]
    pub action: RulesAction,
}

/// Rules subcommands
#[derive(Subcommand, Debug)]
pub enum RulesAction {
    /// List the rules loaded from the ruleset directory, in insertion order
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate every ruleset file in a directory
    Check {
        /// Ruleset directory (default: `routing.rulesets_dir`)
        dir: Option<PathBuf>,
    },

    /// Classify a domain or IP address against the loaded rules
    Test {
        /// Domain name or IP address
        target: String,

        /// Address the domain resolved to, for CIDR/GeoIP rules
        #[arg(long, value_name = "IP")]
        ip: Option<IpAddr>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Execute rules command
pub fn execute(args: RulesArgs, config_path: Option<&Path>) -> Result<()> {
    match args.action {
        RulesAction::List { json } => list_rules(config_path, json),
        RulesAction::Check { dir } => check_rules(dir, config_path),
        RulesAction::Test { target, ip, json } => test_target(config_path, &target, ip, json),
    }
}

fn list_rules(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = super::config::load(config_path)?;
    let engine = super::diagnostic_engine(config)?;
    let rules = engine.list_rules();

    if json {
        return super::print_json(&rules);
    }
    if rules.is_empty() {
        println!("No rules loaded");
        return Ok(());
    }

    println!("{:<24} {:<7} {:<7} {:>8}  PATTERNS", "ID", "KIND", "ACTION", "PRIORITY");
    for rule in &rules {
        println!("{}", format_rule(rule));
    }
    println!();
    println!("{} rule(s)", rules.len());
    Ok(())
}

fn format_rule(rule: &Rule) -> String {
    let id = if rule.enabled {
        rule.id.normal()
    } else {
        format!("{} (off)", rule.id).dimmed()
    };
    format!(
        "{:<24} {:<7} {:<7} {:>8}  {}",
        id,
        rule.kind.as_str(),
        action_label(rule.action),
        rule.priority,
        rule.patterns.join(", ")
    )
}

fn action_label(action: RouteAction) -> ColoredString {
    match action {
        RouteAction::Direct => action.as_str().green(),
        RouteAction::Vpn => action.as_str().cyan(),
        RouteAction::Block => action.as_str().red(),
    }
}

fn check_rules(dir: Option<PathBuf>, config_path: Option<&Path>) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => super::config::load(config_path)?
            .routing
            .rulesets_dir
            .context("No ruleset directory given and routing.rulesets_dir is not set")?,
    };
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let (_, report) = loader::load_dir(&dir);
    for path in &report.loaded {
        println!("  {} {}", "✓".green(), path.display());
    }
    for (path, reason) in &report.failed {
        println!("  {} {}: {}", "✗".red(), path.display(), reason);
    }
    println!();
    println!(
        "{} file(s) loaded, {} failed, {} rule(s)",
        report.loaded.len(),
        report.failed.len(),
        report.rules
    );

    if !report.failed.is_empty() {
        bail!("{} ruleset file(s) failed to load", report.failed.len());
    }
    Ok(())
}

fn test_target(config_path: Option<&Path>, target: &str, ip: Option<IpAddr>, json: bool) -> Result<()> {
    let config = super::config::load(config_path)?;
    let engine = super::diagnostic_engine(config)?;

    let mut query = Target::parse(target);
    if ip.is_some() {
        query = query.with_ip(ip);
    }
    let verdict = engine.evaluate(&query);

    if json {
        return super::print_json(&verdict);
    }
    println!("{}", describe_verdict(target, &verdict));
    Ok(())
}

fn describe_verdict(target: &str, verdict: &Verdict) -> String {
    match (&verdict.rule_id, &verdict.pattern) {
        (Some(rule), Some(pattern)) => format!(
            "{} → {} (rule {}, pattern {}, specificity {})",
            target,
            action_label(verdict.action),
            rule.bold(),
            pattern,
            verdict.specificity
        ),
        _ => format!("{} → {} (default route)", target, action_label(verdict.action)),
    }
}
