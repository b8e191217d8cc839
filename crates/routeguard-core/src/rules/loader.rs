//! Ruleset directory loader
//!
//! Every `*.toml` file in the directory is one ruleset:
//!
//! ```toml
//! [[rules]]
//! id = "streaming"
//! kind = "domain"
//! patterns = ["netflix.com", "nflxvideo.net"]
//! action = "vpn"
//! priority = 10
//! ```
//!
//! `id` may be omitted; it then defaults to `<file stem>:<index>`. A file
//! that fails to read, parse or validate is skipped as a whole and recorded
//! in the [`LoadReport`]; the remaining files still load.

use super::types::{RouteAction, Rule, RuleKind};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct RulesetFile {
    #[serde(default)]
    rules: Vec<FileRule>,
}

#[derive(Debug, Deserialize)]
struct FileRule {
    id: Option<String>,
    kind: RuleKind,
    patterns: Vec<String>,
    action: RouteAction,
    #[serde(default)]
    priority: i32,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Outcome of a ruleset directory load
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Files loaded successfully
    pub loaded: Vec<PathBuf>,
    /// Files skipped, with the reason
    pub failed: Vec<(PathBuf, String)>,
    /// Rules collected from loaded files
    pub rules: usize,
    /// Rules refused by the store after loading (id collisions)
    pub rejected: usize,
}

impl LoadReport {
    /// Whether every file loaded
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.rejected == 0
    }
}

/// Parse one ruleset document; `stem` names rules without an id
pub fn parse_ruleset(content: &str, stem: &str) -> Result<Vec<Rule>> {
    let file: RulesetFile = toml::from_str(content)?;

    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(file.rules.len());
    for (idx, fr) in file.rules.into_iter().enumerate() {
        let rule = Rule {
            id: fr.id.unwrap_or_else(|| format!("{stem}:{idx}")),
            kind: fr.kind,
            patterns: fr.patterns,
            action: fr.action,
            priority: fr.priority,
            enabled: fr.enabled,
        };
        rule.compile()?;
        if !seen.insert(rule.id.clone()) {
            return Err(Error::DuplicateRule { id: rule.id });
        }
        rules.push(rule);
    }
    Ok(rules)
}

/// Load one ruleset file
pub fn load_file(path: &Path) -> Result<Vec<Rule>> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|e| Error::ruleset_load(&display, e))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("ruleset");
    parse_ruleset(&content, stem).map_err(|e| Error::ruleset_load(display, e))
}

/// Load every ruleset in `dir`, in file-name order
///
/// A file whose rule ids collide with an already loaded file is skipped.
pub fn load_dir(dir: &Path) -> (Vec<Rule>, LoadReport) {
    let mut report = LoadReport::default();
    let mut rules: Vec<Rule> = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read ruleset directory {}: {}", dir.display(), e);
            report.failed.push((dir.to_path_buf(), e.to_string()));
            return (rules, report);
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut ids: HashSet<String> = HashSet::new();
    for path in paths {
        let loaded = load_file(&path).and_then(|file_rules| {
            match file_rules.iter().find(|r| ids.contains(&r.id)) {
                Some(dup) => Err(Error::ruleset_load(
                    path.display().to_string(),
                    format!("rule id '{}' already defined by another ruleset", dup.id),
                )),
                None => Ok(file_rules),
            }
        });

        match loaded {
            Ok(file_rules) => {
                ids.extend(file_rules.iter().map(|r| r.id.clone()));
                report.rules += file_rules.len();
                rules.extend(file_rules);
                report.loaded.push(path);
            }
            Err(e) => {
                warn!(error = %e, "Skipping ruleset");
                report.failed.push((path, e.to_string()));
            }
        }
    }

    info!(
        files = report.loaded.len(),
        failed = report.failed.len(),
        rules = report.rules,
        "Loaded rulesets from {}",
        dir.display()
    );
    (rules, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ruleset_default_ids() {
        let rules = parse_ruleset(
            r#"
[[rules]]
kind = "domain"
patterns = ["a.test"]
action = "vpn"

[[rules]]
id = "named"
kind = "cidr"
patterns = ["10.0.0.0/8"]
action = "direct"
priority = 3
enabled = false
"#,
            "streaming",
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "streaming:0");
        assert_eq!(rules[1].id, "named");
        assert_eq!(rules[1].priority, 3);
        assert!(!rules[1].enabled);
    }

    #[test]
    fn test_parse_ruleset_rejects_bad_pattern() {
        let err = parse_ruleset(
            "[[rules]]\nkind = \"cidr\"\npatterns = [\"nope\"]\naction = \"vpn\"\n",
            "x",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_parse_ruleset_rejects_duplicate_ids() {
        let err = parse_ruleset(
            r#"
[[rules]]
id = "a"
kind = "domain"
patterns = ["a.test"]
action = "vpn"

[[rules]]
id = "a"
kind = "domain"
patterns = ["b.test"]
action = "vpn"
"#,
            "x",
        );
        assert!(matches!(err, Err(Error::DuplicateRule { .. })));
    }

    #[test]
    fn test_load_dir_missing() {
        let (rules, report) = load_dir(Path::new("/nonexistent/routeguard/rules"));
        assert!(rules.is_empty());
        assert_eq!(report.failed.len(), 1);
    }
}
