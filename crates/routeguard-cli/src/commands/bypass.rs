//! Bypass command - show the DPI transform for a domain

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use routeguard_core::dpi::{BypassReason, BypassReport};
use routeguard_core::DpiState;
use std::path::Path;

/// Bypass command arguments
#[derive(Args, Debug)]
pub struct BypassArgs {
    /// Domain to build a ClientHello for
    pub domain: String,

    /// Dump every segment as hex
    #[arg(long)]
    pub hex: bool,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute bypass command
pub fn execute(args: BypassArgs, config_path: Option<&Path>) -> Result<()> {
    let config = super::config::load(config_path)?;
    let engine = super::diagnostic_engine(config)?;
    let report = engine.test_bypass(&args.domain);

    if args.json {
        let mut value = serde_json::to_value(&report)?;
        if args.hex {
            value["segments_hex"] = report.segments.iter().map(hex::encode).collect();
        }
        return super::print_json(&value);
    }

    println!("{}", summary(&report));
    for (i, segment) in report.segments.iter().enumerate() {
        if args.hex {
            println!("  #{:<3} {:>5} B  {}", i + 1, segment.len(), hex::encode(segment));
        } else {
            println!("  #{:<3} {:>5} B", i + 1, segment.len());
        }
    }
    if let Some(error) = &report.error {
        println!("  {} transform failed: {}", "✗".red(), error);
    }
    Ok(())
}

fn summary(report: &BypassReport) -> String {
    let reason = match &report.reason {
        Some(BypassReason::Manual(entry)) => format!("manual entry {entry}"),
        Some(BypassReason::Keyword(keyword)) => format!("keyword \"{keyword}\""),
        None => "no criterion matched".to_string(),
    };
    let state = match report.state {
        DpiState::BypassApplied => "bypass applied".green(),
        _ => "passthrough".yellow(),
    };
    format!(
        "{}: {} ({}), {} segment(s)",
        report.domain,
        state,
        reason,
        report.segments.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use routeguard_core::config::DpiConfig;
    use routeguard_core::{DpiEngine, Stats};
    use std::sync::Arc;

    #[test]
    fn test_summary_for_keyword_match() {
        colored::control::set_override(false);
        let engine = DpiEngine::new(&DpiConfig::default(), Arc::new(Stats::new()));
        let report = engine.test_bypass("www.youtube.com");
        let line = summary(&report);
        assert!(line.starts_with("www.youtube.com: bypass applied (keyword \"youtube\")"));
        assert!(report.segments.len() > 1);
    }

    #[test]
    fn test_summary_for_unlisted_domain() {
        colored::control::set_override(false);
        let engine = DpiEngine::new(&DpiConfig::default(), Arc::new(Stats::new()));
        let report = engine.test_bypass("example.org");
        assert_eq!(
            summary(&report),
            "example.org: passthrough (no criterion matched), 1 segment(s)"
        );
    }
}
