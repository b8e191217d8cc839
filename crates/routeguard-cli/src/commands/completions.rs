//! `routeguard completions` - print or install a shell completion script

use anyhow::{bail, Context, Result};
use clap::{Args, CommandFactory};
use clap_complete::{generate, Shell};
use colored::Colorize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::args::Args as CliArgs;

/// Completions command arguments
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell (defaults to the one named by `$SHELL`)
    #[arg(value_enum)]
    pub shell: Option<Shell>,

    /// Write the script to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Command name the script completes, for installs under another name
    #[arg(long, value_name = "NAME", default_value = "routeguard")]
    pub bin_name: String,
}

/// Execute completions command
pub fn execute(args: CompletionsArgs) -> Result<()> {
    let shell = match args.shell.or_else(Shell::from_env) {
        Some(shell) => shell,
        None => bail!("Cannot detect the shell from $SHELL; name one, e.g. `routeguard completions bash`"),
    };

    match &args.output {
        Some(path) => {
            write_to_file(shell, &args.bin_name, path)?;
            eprintln!(
                "{} {} completions written to {}",
                "✓".green(),
                shell,
                path.display().to_string().cyan()
            );
        }
        None => render(shell, &args.bin_name, &mut io::stdout().lock())?,
    }
    Ok(())
}

fn write_to_file(shell: Shell, bin_name: &str, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    render(shell, bin_name, &mut out)?;
    out.flush()
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn render(shell: Shell, bin_name: &str, out: &mut dyn Write) -> Result<()> {
    let mut cmd = CliArgs::command();
    generate(shell, &mut cmd, bin_name, out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_bash_script_covers_subcommands() {
        let mut out = Vec::new();
        render(Shell::Bash, "routeguard", &mut out).unwrap();
        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("resolve"));
        assert!(script.contains("bypass"));
        assert!(script.contains("--serve-dns"));
    }

    #[test]
    fn test_output_file_uses_bin_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_rg");
        execute(CompletionsArgs {
            shell: Some(Shell::Zsh),
            output: Some(path.clone()),
            bin_name: "rg-gateway".to_string(),
        })
        .unwrap();

        let script = std::fs::read_to_string(&path).unwrap();
        assert!(script.contains("#compdef rg-gateway"));
    }

    #[test]
    fn test_unwritable_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = execute(CompletionsArgs {
            shell: Some(Shell::Fish),
            output: Some(dir.path().join("missing").join("rg.fish")),
            bin_name: "routeguard".to_string(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("Failed to create"));
    }
}
