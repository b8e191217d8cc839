//! Rule storage with snapshot publication
//!
//! Readers take the current [`RuleSnapshot`] with a single atomic load and
//! keep it for the whole evaluation. Writers serialize on a mutex, build a
//! new snapshot from the current one and swap it in. A reader never waits
//! on a writer, and an old snapshot lives until its last reader drops it.

use super::geoip::GeoIpTable;
use super::pattern::Pattern;
use super::types::{RouteAction, Rule};
use crate::config::{RoutingConfig, RoutingMode};
use crate::error::{Error, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a stored rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOrigin {
    /// Added through the management interface
    Api,
    /// Loaded from the ruleset directory
    File,
}

/// Engine-wide routing switches carried inside every snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingSettings {
    /// Evaluate rules at all
    pub enabled: bool,
    /// Pattern kinds consulted
    pub mode: RoutingMode,
    /// Route on a classification miss
    pub default_route: RouteAction,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: RoutingMode::Mixed,
            default_route: RouteAction::Direct,
        }
    }
}

impl From<&RoutingConfig> for RoutingSettings {
    fn from(config: &RoutingConfig) -> Self {
        Self {
            enabled: config.enabled,
            mode: config.mode,
            default_route: config.default_route,
        }
    }
}

/// A validated rule with its compiled patterns
#[derive(Debug)]
pub struct CompiledRule {
    /// The rule as submitted
    pub rule: Rule,
    /// Compiled patterns, same order as `rule.patterns`
    pub patterns: Vec<Pattern>,
    /// Insertion sequence number (stable across updates)
    pub seq: u64,
    /// Source of the rule
    pub origin: RuleOrigin,
}

/// Immutable point-in-time view of the rule set
#[derive(Debug)]
pub struct RuleSnapshot {
    pub(super) generation: u64,
    /// Every stored rule in insertion order
    pub(super) all: Vec<Arc<CompiledRule>>,
    /// Enabled rules by descending priority, then insertion order
    pub(super) active: Vec<Arc<CompiledRule>>,
    pub(super) geoip: Arc<GeoIpTable>,
    pub(super) settings: RoutingSettings,
}

impl RuleSnapshot {
    fn build(
        generation: u64,
        all: Vec<Arc<CompiledRule>>,
        geoip: Arc<GeoIpTable>,
        settings: RoutingSettings,
    ) -> Self {
        let mut active: Vec<Arc<CompiledRule>> =
            all.iter().filter(|r| r.rule.enabled).cloned().collect();
        active.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then(a.seq.cmp(&b.seq))
        });

        Self {
            generation,
            all,
            active,
            geoip,
            settings,
        }
    }

    /// Monotonic publication counter
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of stored rules (enabled or not)
    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// Check if no rules are stored
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Number of enabled rules
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Routing switches in effect for this snapshot
    pub fn settings(&self) -> RoutingSettings {
        self.settings
    }

    /// Stored rules in insertion order
    pub fn rules(&self) -> Vec<Rule> {
        self.all.iter().map(|r| r.rule.clone()).collect()
    }
}

/// Prioritized, hot-swappable rule set
pub struct RuleStore {
    current: ArcSwap<RuleSnapshot>,
    /// Serializes writers; holds the next insertion sequence number
    writer: Mutex<u64>,
}

impl RuleStore {
    /// Create an empty store
    pub fn new(settings: RoutingSettings) -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSnapshot::build(
                0,
                Vec::new(),
                Arc::new(GeoIpTable::empty()),
                settings,
            )),
            writer: Mutex::new(0),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.load_full()
    }

    /// Add a rule at the end of the insertion order
    ///
    /// Rejects invalid patterns, empty pattern lists and duplicate ids.
    pub fn add(&self, rule: Rule) -> Result<()> {
        self.add_with_origin(rule, RuleOrigin::Api)
    }

    fn add_with_origin(&self, rule: Rule, origin: RuleOrigin) -> Result<()> {
        let patterns = rule.compile()?;

        let mut next_seq = self.writer.lock();
        let cur = self.current.load_full();
        if cur.all.iter().any(|r| r.rule.id == rule.id) {
            return Err(Error::DuplicateRule { id: rule.id });
        }

        let id = rule.id.clone();
        let mut all = cur.all.clone();
        all.push(Arc::new(CompiledRule {
            rule,
            patterns,
            seq: *next_seq,
            origin,
        }));
        *next_seq += 1;

        self.publish(&cur, all, None, None);
        debug!(rule = %id, "Rule added");
        Ok(())
    }

    /// Replace the rule with the same id, keeping its insertion position
    pub fn update(&self, rule: Rule) -> Result<()> {
        let patterns = rule.compile()?;

        let _guard = self.writer.lock();
        let cur = self.current.load_full();
        let Some(pos) = cur.all.iter().position(|r| r.rule.id == rule.id) else {
            return Err(Error::UnknownRule { id: rule.id });
        };

        let id = rule.id.clone();
        let old = &cur.all[pos];
        let mut all = cur.all.clone();
        all[pos] = Arc::new(CompiledRule {
            rule,
            patterns,
            seq: old.seq,
            origin: old.origin,
        });

        self.publish(&cur, all, None, None);
        debug!(rule = %id, "Rule updated");
        Ok(())
    }

    /// Remove a rule; returns whether it existed
    pub fn remove(&self, id: &str) -> bool {
        let _guard = self.writer.lock();
        let cur = self.current.load_full();
        if !cur.all.iter().any(|r| r.rule.id == id) {
            return false;
        }

        let all = cur
            .all
            .iter()
            .filter(|r| r.rule.id != id)
            .cloned()
            .collect();
        self.publish(&cur, all, None, None);
        debug!(rule = %id, "Rule removed");
        true
    }

    /// Look up one rule by id
    pub fn get(&self, id: &str) -> Option<Rule> {
        self.current
            .load()
            .all
            .iter()
            .find(|r| r.rule.id == id)
            .map(|r| r.rule.clone())
    }

    /// All rules in insertion order
    pub fn list(&self) -> Vec<Rule> {
        self.current.load().rules()
    }

    /// Swap every file-origin rule for `rules` in one publication
    ///
    /// API-origin rules keep their positions. A file rule whose id collides
    /// with an API rule, or fails validation, is skipped and returned.
    pub fn replace_file_rules(&self, rules: Vec<Rule>) -> Vec<Error> {
        let mut rejected = Vec::new();

        let mut next_seq = self.writer.lock();
        let cur = self.current.load_full();
        let mut all: Vec<Arc<CompiledRule>> = cur
            .all
            .iter()
            .filter(|r| r.origin == RuleOrigin::Api)
            .cloned()
            .collect();

        for rule in rules {
            if all.iter().any(|r| r.rule.id == rule.id) {
                warn!(rule = %rule.id, "Ruleset rule id already in use, skipping");
                rejected.push(Error::DuplicateRule { id: rule.id });
                continue;
            }
            match rule.compile() {
                Ok(patterns) => {
                    all.push(Arc::new(CompiledRule {
                        rule,
                        patterns,
                        seq: *next_seq,
                        origin: RuleOrigin::File,
                    }));
                    *next_seq += 1;
                }
                Err(e) => {
                    warn!(rule = %rule.id, error = %e, "Invalid ruleset rule, skipping");
                    rejected.push(e);
                }
            }
        }

        let file_rules = all.iter().filter(|r| r.origin == RuleOrigin::File).count();
        self.publish(&cur, all, None, None);
        info!(file_rules, rejected = rejected.len(), "Ruleset rules replaced");
        rejected
    }

    /// Install a new GeoIP table
    pub fn set_geoip(&self, table: GeoIpTable) {
        let _guard = self.writer.lock();
        let cur = self.current.load_full();
        self.publish(&cur, cur.all.clone(), Some(Arc::new(table)), None);
    }

    /// Change the routing switches
    pub fn set_settings(&self, settings: RoutingSettings) {
        let _guard = self.writer.lock();
        let cur = self.current.load_full();
        self.publish(&cur, cur.all.clone(), None, Some(settings));
    }

    /// Edit the routing switches under the writer lock
    pub fn update_settings(&self, change: impl FnOnce(&mut RoutingSettings)) -> RoutingSettings {
        let _guard = self.writer.lock();
        let cur = self.current.load_full();
        let mut settings = cur.settings;
        change(&mut settings);
        self.publish(&cur, cur.all.clone(), None, Some(settings));
        settings
    }

    /// Number of stored rules
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    /// Current snapshot generation
    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    // Caller must hold the writer lock.
    fn publish(
        &self,
        cur: &RuleSnapshot,
        all: Vec<Arc<CompiledRule>>,
        geoip: Option<Arc<GeoIpTable>>,
        settings: Option<RoutingSettings>,
    ) {
        let next = RuleSnapshot::build(
            cur.generation + 1,
            all,
            geoip.unwrap_or_else(|| Arc::clone(&cur.geoip)),
            settings.unwrap_or(cur.settings),
        );
        self.current.store(Arc::new(next));
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new(RoutingSettings::default())
    }
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.current.load();
        f.debug_struct("RuleStore")
            .field("rules", &snap.len())
            .field("generation", &snap.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleKind;

    fn domain_rule(id: &str, pattern: &str, action: RouteAction) -> Rule {
        Rule::new(id, RuleKind::Domain, [pattern], action)
    }

    #[test]
    fn test_add_preserves_order() {
        let store = RuleStore::default();
        store.add(domain_rule("a", "a.test", RouteAction::Vpn)).unwrap();
        store.add(domain_rule("b", "b.test", RouteAction::Vpn)).unwrap();
        store.add(domain_rule("c", "c.test", RouteAction::Vpn)).unwrap();

        let ids: Vec<_> = store.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(store.generation(), 3);
    }

    #[test]
    fn test_add_rejects_duplicate() {
        let store = RuleStore::default();
        store.add(domain_rule("a", "a.test", RouteAction::Vpn)).unwrap();
        let err = store.add(domain_rule("a", "b.test", RouteAction::Direct));
        assert!(matches!(err, Err(Error::DuplicateRule { .. })));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_add_rejects_invalid_without_publishing() {
        let store = RuleStore::default();
        let generation = store.generation();
        let bad = Rule::new("bad", RuleKind::Cidr, ["300.0.0.0/8"], RouteAction::Vpn);
        assert!(store.add(bad).is_err());
        assert_eq!(store.generation(), generation);
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let store = RuleStore::default();
        let generation = store.generation();
        assert!(!store.remove("missing"));
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn test_update_keeps_position() {
        let store = RuleStore::default();
        store.add(domain_rule("a", "a.test", RouteAction::Vpn)).unwrap();
        store.add(domain_rule("b", "b.test", RouteAction::Vpn)).unwrap();

        store
            .update(domain_rule("a", "z.test", RouteAction::Block))
            .unwrap();
        let rules = store.list();
        assert_eq!(rules[0].id, "a");
        assert_eq!(rules[0].patterns, ["z.test"]);

        let err = store.update(domain_rule("nope", "x.test", RouteAction::Block));
        assert!(matches!(err, Err(Error::UnknownRule { .. })));
    }

    #[test]
    fn test_old_snapshot_survives_writes() {
        let store = RuleStore::default();
        store.add(domain_rule("a", "a.test", RouteAction::Vpn)).unwrap();
        let held = store.snapshot();

        store.remove("a");
        store.add(domain_rule("b", "b.test", RouteAction::Vpn)).unwrap();

        assert_eq!(held.rules()[0].id, "a");
        assert_eq!(store.list()[0].id, "b");
    }

    #[test]
    fn test_replace_file_rules_keeps_api_rules() {
        let store = RuleStore::default();
        store.add(domain_rule("api", "api.test", RouteAction::Vpn)).unwrap();
        store.replace_file_rules(vec![domain_rule("f1", "f1.test", RouteAction::Direct)]);
        assert_eq!(store.len(), 2);

        let rejected = store.replace_file_rules(vec![
            domain_rule("f2", "f2.test", RouteAction::Direct),
            domain_rule("api", "dup.test", RouteAction::Direct),
            domain_rule("bad", "bad..test", RouteAction::Direct),
        ]);
        assert_eq!(rejected.len(), 2);

        let ids: Vec<_> = store.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["api", "f2"]);
    }

    #[test]
    fn test_disabled_rules_stored_not_active() {
        let store = RuleStore::default();
        store
            .add(domain_rule("a", "a.test", RouteAction::Vpn).with_enabled(false))
            .unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.active_len(), 0);
    }
}
