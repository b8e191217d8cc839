//! Ad-block domain filter
//!
//! A blocked domain is a hard veto: the resolver answers it without going
//! upstream and the dispatcher terminates the flow before classification.
//!
//! The block list is replaced as a whole on reload; readers always see one
//! complete list.

use crate::error::{Error, Result};
use crate::rules::{canonical_host, normalize_domain};
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Immutable set of blocked and allowed domain suffixes
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    blocked: HashSet<String>,
    allowed: HashSet<String>,
}

impl BlockList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blocked domain (and its subdomains)
    pub fn block(&mut self, domain: &str) -> bool {
        match normalize_domain(domain) {
            Ok(d) => self.blocked.insert(d),
            Err(_) => false,
        }
    }

    /// Add an exception (and its subdomains)
    pub fn allow(&mut self, domain: &str) -> bool {
        match normalize_domain(domain) {
            Ok(d) => self.allowed.insert(d),
            Err(_) => false,
        }
    }

    /// Parse block-list text into this list
    ///
    /// Accepted lines:
    /// - `example.com` (plain domain)
    /// - `0.0.0.0 example.com` / `127.0.0.1 example.com` (hosts file)
    /// - `||example.com^` (adblock syntax)
    /// - `@@||example.com^` (exception)
    ///
    /// `#` and `!` start comments. Returns the number of entries added.
    pub fn extend_from_str(&mut self, content: &str) -> usize {
        let mut added = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("@@") {
                if let Some(domain) = adblock_domain(rest) {
                    if self.allow(domain) {
                        added += 1;
                    }
                }
                continue;
            }
            let domain = adblock_domain(line).or_else(|| hosts_domain(line)).unwrap_or(line);
            if self.block(domain) {
                added += 1;
            }
        }
        added
    }

    /// Suffix-wise veto check
    pub fn is_blocked(&self, domain: &str) -> bool {
        if self.blocked.is_empty() {
            return false;
        }
        let domain = canonical_host(domain);
        !suffix_hit(&self.allowed, &domain) && suffix_hit(&self.blocked, &domain)
    }

    /// Number of blocked entries
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    /// Check if nothing is blocked
    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

/// Walk `domain` and its parents looking for a set member
fn suffix_hit(set: &HashSet<String>, domain: &str) -> bool {
    let mut current = domain;
    loop {
        if set.contains(current) {
            return true;
        }
        match current.find('.') {
            Some(pos) => current = &current[pos + 1..],
            None => return false,
        }
    }
}

fn adblock_domain(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("||")?;
    let end = rest.find(['^', '/', '$']).unwrap_or(rest.len());
    Some(&rest[..end])
}

fn hosts_domain(line: &str) -> Option<&str> {
    let mut fields = line.split_whitespace();
    let addr = fields.next()?;
    if !matches!(addr, "0.0.0.0" | "127.0.0.1" | "::" | "::1") {
        return None;
    }
    let domain = fields.next()?;
    (!matches!(domain, "localhost" | "localhost.localdomain" | "0.0.0.0")).then_some(domain)
}

/// Thread-safe ad-block filter with atomic reload
pub struct AdBlockFilter {
    enabled: bool,
    list: ArcSwap<BlockList>,
    sources: Vec<PathBuf>,
    allow: Vec<String>,
}

impl AdBlockFilter {
    /// Create a filter with the given sources; call [`reload`](Self::reload)
    /// to read them
    pub fn new(enabled: bool, sources: Vec<PathBuf>, allow: Vec<String>) -> Self {
        Self {
            enabled,
            list: ArcSwap::from_pointee(BlockList::new()),
            sources,
            allow,
        }
    }

    /// A filter that never vetoes
    pub fn disabled() -> Self {
        Self::new(false, Vec::new(), Vec::new())
    }

    /// Build a filter around an in-memory list
    pub fn with_list(list: BlockList) -> Self {
        Self {
            enabled: true,
            list: ArcSwap::from_pointee(list),
            sources: Vec::new(),
            allow: Vec::new(),
        }
    }

    /// Whether vetoes are active
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check whether `domain` (or a parent) is blocked
    pub fn is_blocked(&self, domain: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let blocked = self.list.load().is_blocked(domain);
        if blocked {
            debug!(domain, "Ad-block veto");
        }
        blocked
    }

    /// Re-read every source and swap the list in
    ///
    /// An unreadable source is logged and skipped; the rest still load.
    /// Returns the number of blocked entries now active.
    pub fn reload(&self) -> usize {
        let mut list = BlockList::new();
        for domain in &self.allow {
            list.allow(domain);
        }
        for path in &self.sources {
            match read_source(path) {
                Ok(content) => {
                    let added = list.extend_from_str(&content);
                    debug!(added, "Block list source {}", path.display());
                }
                Err(e) => warn!(error = %e, "Skipping block list source"),
            }
        }
        self.replace(list)
    }

    /// Swap in a prepared list
    pub fn replace(&self, list: BlockList) -> usize {
        let count = list.len();
        self.list.store(Arc::new(list));
        info!(entries = count, "Ad-block list loaded");
        count
    }

    /// Current list snapshot
    pub fn list(&self) -> Arc<BlockList> {
        self.list.load_full()
    }

    /// Number of blocked entries
    pub fn len(&self) -> usize {
        self.list.load().len()
    }

    /// Check if nothing is blocked
    pub fn is_empty(&self) -> bool {
        self.list.load().is_empty()
    }
}

impl std::fmt::Debug for AdBlockFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdBlockFilter")
            .field("enabled", &self.enabled)
            .field("entries", &self.len())
            .field("sources", &self.sources)
            .finish()
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::list_load(path.display().to_string(), e))
}
