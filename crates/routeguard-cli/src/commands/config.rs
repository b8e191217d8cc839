//! Config command - configuration management

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use routeguard_core::Config;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File names looked up in the working directory, in order
const LOCAL_CANDIDATES: &[&str] = &["routeguard.toml", "config.toml"];

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Config file to show (default: `--config` or detect)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "routeguard.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Config file to validate (default: `--config` or detect)
        file: Option<PathBuf>,
    },

    /// Show config file locations
    Paths,
}

/// Execute config command
pub fn execute(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    match args.action {
        ConfigAction::Show { file } => show_config(file.as_deref().or(config_path)),
        ConfigAction::Generate { output, force } => generate_config(&output, force),
        ConfigAction::Validate { file } => validate_config(file.as_deref().or(config_path)),
        ConfigAction::Paths => {
            show_paths();
            Ok(())
        }
    }
}

/// Config file to use: the explicit path, else the first existing candidate
pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    search_paths().into_iter().find(|path| path.exists())
}

/// Load the located config, or defaults when none exists
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    match locate(explicit) {
        Some(path) => {
            debug!(path = %path.display(), "Loading configuration");
            Config::load(&path).with_context(|| format!("Failed to load config from {}", path.display()))
        }
        None => {
            debug!("No configuration file found, using defaults");
            Ok(Config::default())
        }
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = LOCAL_CANDIDATES.iter().map(PathBuf::from).collect();
    if let Some(dirs) = project_dirs() {
        paths.push(dirs.config_dir().join("config.toml"));
    }
    paths
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "routeguard")
}

fn show_config(file: Option<&Path>) -> Result<()> {
    let config = load(file)?;
    let toml_str = toml::to_string_pretty(&config).context("Failed to serialize config")?;
    println!("{toml_str}");
    Ok(())
}

fn generate_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let toml_str = Config::default().to_toml().context("Failed to serialize config")?;
    let content = format!(
        "# RouteGuard configuration\n\
         # Every section is optional; omitted keys keep these defaults.\n\n\
         {toml_str}"
    );

    std::fs::write(output, content)
        .with_context(|| format!("Failed to write config to {}", output.display()))?;

    info!(path = %output.display(), "Generated config file");
    println!("Configuration file generated: {}", output.display());
    Ok(())
}

fn validate_config(file: Option<&Path>) -> Result<()> {
    let Some(path) = locate(file) else {
        bail!("No configuration file found (see `routeguard config paths`)");
    };
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.validate().context("Configuration validation failed")?;

    println!("{} Configuration is valid: {}", "✓".green(), path.display());
    println!("  Routing: {} ({:?} mode, default {})",
        if config.routing.enabled { "enabled" } else { "disabled" },
        config.routing.mode,
        config.routing.default_route,
    );
    println!("  Rulesets: {}", display_opt(config.routing.rulesets_dir.as_deref()));
    println!("  GeoIP: {}", display_opt(config.routing.geoip_file.as_deref()));
    println!("  DNS upstream: {}", config.dns.upstream);
    println!("  Ad-block: {} ({} list(s))",
        if config.dns.adblock.enabled { "enabled" } else { "disabled" },
        config.dns.adblock.lists.len(),
    );
    println!("  DPI: {} ({:?} mode)",
        if config.dpi.enabled { "enabled" } else { "disabled" },
        config.dpi.mode,
    );
    println!("  VPN interface: {}", config.vpn.interface.as_deref().unwrap_or("-"));

    Ok(())
}

fn display_opt(path: Option<&Path>) -> String {
    path.map_or_else(|| "-".to_string(), |p| p.display().to_string())
}

fn show_paths() {
    println!("Configuration file search paths:");
    println!();
    for (i, path) in search_paths().iter().enumerate() {
        let marker = if path.exists() { "✓".green() } else { " ".normal() };
        println!("  {}. {} {}", i + 1, path.display(), marker);
    }
    println!();
    println!("Override with --config <FILE> or ROUTEGUARD_CONFIG.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.toml");

        generate_config(&path, false).unwrap();
        assert!(generate_config(&path, false).is_err());
        generate_config(&path, true).unwrap();

        validate_config(Some(path.as_path())).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.dns.max_attempts, Config::default().dns.max_attempts);
    }

    #[test]
    fn test_validate_rejects_block_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.toml");
        std::fs::write(&path, "[routing]\ndefault_route = \"block\"\n").unwrap();
        assert!(validate_config(Some(path.as_path())).is_err());
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = Path::new("/nonexistent/routeguard.toml");
        assert_eq!(locate(Some(path)), Some(path.to_path_buf()));
        assert!(load(Some(path)).is_err());
    }
}
