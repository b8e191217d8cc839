//! RouteGuard CLI
//!
//! Command-line interface for the routing gateway.

mod args;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;
use routeguard_core::config::LoggingConfig;
use tracing::error;

use args::Args;
use commands::Command;

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // `[logging]` from the config file supplies defaults for the flags
    let file_logging = commands::config::locate(args.config.as_deref())
        .and_then(|path| routeguard_core::Config::load(path).ok())
        .map(|config| config.logging)
        .unwrap_or_else(LoggingConfig::default);
    let _log_guard = logging::init(&args, &file_logging)?;

    if !args.quiet && atty::is(atty::Stream::Stdout) && matches!(args.command, None | Some(Command::Run(_))) {
        print_banner();
    }

    let result = run(args);

    if let Err(ref e) = result {
        error!("Fatal error: {:#}", e);
    }

    result
}

fn run(args: Args) -> Result<()> {
    let config_path = args.config.as_deref();
    match args.command {
        Some(Command::Run(run_args)) => commands::run::execute(run_args, config_path),
        Some(Command::Config(config_args)) => commands::config::execute(config_args, config_path),
        Some(Command::Rules(rules_args)) => commands::rules::execute(rules_args, config_path),
        Some(Command::Resolve(resolve_args)) => commands::resolve::execute(resolve_args, config_path),
        Some(Command::Bypass(bypass_args)) => commands::bypass::execute(bypass_args, config_path),
        Some(Command::Completions(comp_args)) => commands::completions::execute(comp_args),
        None => commands::run::execute(commands::run::RunArgs::default(), config_path),
    }
}

fn print_banner() {
    use colored::Colorize;

    println!();
    println!("{}", "╔═══════════════════════════════════════════════════════╗".cyan());
    println!("{}{}{}",
        "║  ".cyan(),
        format!("RouteGuard v{:<8}", env!("CARGO_PKG_VERSION")).green().bold(),
        "                                 ║".cyan()
    );
    println!("{}{}{}",
        "║  ".cyan(),
        "Rule-based VPN / direct routing gateway".white(),
        "              ║".cyan()
    );
    println!("{}", "╚═══════════════════════════════════════════════════════╝".cyan());
    println!();
}
