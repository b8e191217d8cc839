//! Management facade
//!
//! [`RoutingEngine`] wires every component from a [`Config`] and exposes the
//! typed operations a management layer calls. Components are injected, not
//! global; a process may run several engines side by side.

use crate::adblock::AdBlockFilter;
use crate::config::{Config, RoutingMode};
use crate::dispatch::RouteDispatcher;
use crate::dns::{DnsCache, DnsServer, Lookup, RecordType, Resolver, ResolverOptions, UdpUpstream, Upstream};
use crate::dpi::{BypassReport, DpiEngine};
use crate::error::{DnsError, Error, Result};
use crate::rules::{
    loader, GeoIpTable, LoadReport, RouteAction, Rule, RoutingSettings, RuleStore, Target, Verdict,
};
use crate::stats::{Stats, StatsSnapshot};
use crate::tunnel::VpnTunnel;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The routing engine and its management operations
pub struct RoutingEngine {
    config: Config,
    rules: Arc<RuleStore>,
    adblock: Arc<AdBlockFilter>,
    resolver: Arc<Resolver>,
    dpi: Arc<DpiEngine>,
    dispatcher: Arc<RouteDispatcher>,
    stats: Arc<Stats>,
}

impl RoutingEngine {
    /// Build an engine talking to the configured UDP upstreams
    pub fn from_config(config: Config, tunnel: Arc<dyn VpnTunnel>) -> Result<Self> {
        let primary: Arc<dyn Upstream> = Arc::new(UdpUpstream::new(config.dns.upstream));
        let bootstrap = config
            .dns
            .bootstrap
            .map(|addr| Arc::new(UdpUpstream::new(addr)) as Arc<dyn Upstream>);
        Self::with_upstreams(config, primary, bootstrap, tunnel)
    }

    /// Build an engine around the given upstreams
    ///
    /// Validates the configuration, then loads block lists, the GeoIP table
    /// and the ruleset directory. Load failures are logged and skipped.
    pub fn with_upstreams(
        config: Config,
        primary: Arc<dyn Upstream>,
        bootstrap: Option<Arc<dyn Upstream>>,
        tunnel: Arc<dyn VpnTunnel>,
    ) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(Stats::new());
        let rules = Arc::new(RuleStore::new(RoutingSettings::from(&config.routing)));
        let adblock = Arc::new(AdBlockFilter::new(
            config.dns.adblock.enabled,
            config.dns.adblock.lists.clone(),
            config.dns.adblock.allow.clone(),
        ));
        let cache = Arc::new(DnsCache::from_config(&config.dns));
        let resolver = Arc::new(Resolver::new(
            primary,
            bootstrap,
            cache,
            Arc::clone(&adblock),
            Arc::clone(&stats),
            ResolverOptions::from(&config.dns),
        ));
        let dpi = Arc::new(DpiEngine::new(&config.dpi, Arc::clone(&stats)));
        let dispatcher = Arc::new(RouteDispatcher::new(
            Arc::clone(&rules),
            Arc::clone(&adblock),
            Arc::clone(&resolver),
            Arc::clone(&dpi),
            tunnel,
            Arc::clone(&stats),
            config.dns.timeout(),
        ));

        let engine = Self {
            config,
            rules,
            adblock,
            resolver,
            dpi,
            dispatcher,
            stats,
        };

        if engine.adblock.is_enabled() {
            engine.reload_adblock();
        }
        if engine.config.routing.geoip_file.is_some() {
            if let Err(e) = engine.reload_geoip() {
                warn!(error = %e, "GeoIP table not loaded");
            }
        }
        if engine.config.routing.rulesets_dir.is_some() {
            let report = engine.reload_rules();
            if !report.is_clean() {
                warn!(
                    failed = report.failed.len(),
                    rejected = report.rejected,
                    "Some rulesets did not load"
                );
            }
        }

        info!(
            rules = engine.rules.len(),
            mode = ?engine.config.routing.mode,
            default_route = %engine.config.routing.default_route,
            "Routing engine ready"
        );
        Ok(engine)
    }

    /// Configuration the engine was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flow dispatcher
    pub fn dispatcher(&self) -> &Arc<RouteDispatcher> {
        &self.dispatcher
    }

    /// Rule store
    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    /// DNS resolver
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// DPI engine
    pub fn dpi(&self) -> &Arc<DpiEngine> {
        &self.dpi
    }

    /// Every rule in insertion order
    pub fn list_rules(&self) -> Vec<Rule> {
        self.rules.list()
    }

    /// One rule by id
    pub fn get_rule(&self, id: &str) -> Option<Rule> {
        self.rules.get(id)
    }

    /// Validate and store a rule
    pub fn add_rule(&self, rule: Rule) -> Result<()> {
        self.rules.add(rule)
    }

    /// Replace the rule with the same id
    pub fn update_rule(&self, rule: Rule) -> Result<()> {
        self.rules.update(rule)
    }

    /// Remove a rule; `false` if no rule had that id
    pub fn remove_rule(&self, id: &str) -> bool {
        self.rules.remove(id)
    }

    /// Classify a target against the current rules
    pub fn evaluate(&self, target: &Target) -> Verdict {
        self.rules.evaluate(target)
    }

    /// Re-read the ruleset directory
    ///
    /// File rules are replaced in one publication; rules added through the
    /// API stay. Without a configured directory this is a no-op.
    pub fn reload_rules(&self) -> LoadReport {
        let Some(dir) = self.config.routing.rulesets_dir.as_deref() else {
            debug!("No ruleset directory configured");
            return LoadReport::default();
        };

        let (rules, mut report) = loader::load_dir(dir);
        let rejected = self.rules.replace_file_rules(rules);
        report.rejected = rejected.len();
        info!(
            files = report.loaded.len(),
            failed = report.failed.len(),
            rules = report.rules,
            rejected = report.rejected,
            "Rulesets reloaded"
        );
        report
    }

    /// Reload the GeoIP table; returns the number of entries
    pub fn reload_geoip(&self) -> Result<usize> {
        let path = self
            .config
            .routing
            .geoip_file
            .as_deref()
            .ok_or_else(|| Error::config_value("routing.geoip_file", "Not configured"))?;
        let table = GeoIpTable::load(path)?;
        let entries = table.len();
        self.rules.set_geoip(table);
        info!(entries, "GeoIP table loaded");
        Ok(entries)
    }

    /// Re-read the block lists; returns the number of blocked entries
    pub fn reload_adblock(&self) -> usize {
        self.adblock.reload()
    }

    /// Turn rule evaluation on or off
    pub fn set_routing_enabled(&self, enabled: bool) {
        self.update_settings(|s| s.enabled = enabled);
    }

    /// Change which pattern kinds are consulted
    pub fn set_routing_mode(&self, mode: RoutingMode) {
        self.update_settings(|s| s.mode = mode);
    }

    /// Change the default route; `block` is refused
    pub fn set_default_route(&self, action: RouteAction) -> Result<()> {
        if action == RouteAction::Block {
            return Err(Error::config_value(
                "routing.default_route",
                "Must be 'direct' or 'vpn'",
            ));
        }
        self.update_settings(|s| s.default_route = action);
        Ok(())
    }

    fn update_settings(&self, change: impl FnOnce(&mut RoutingSettings)) {
        let settings = self.rules.update_settings(change);
        info!(?settings, "Routing settings changed");
    }

    /// Discard every cached DNS answer
    pub fn clear_cache(&self) {
        self.resolver.clear_cache();
    }

    /// Counters plus current gauges
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.cache_entries = self.resolver.cache().len() as u64;
        let rules = self.rules.snapshot();
        snapshot.rule_count = rules.len() as u64;
        snapshot.generation = rules.generation();
        snapshot
    }

    /// Resolve outside any flow, bounded by the configured DNS timeout
    pub async fn test_resolve(
        &self,
        domain: &str,
        rtype: RecordType,
    ) -> std::result::Result<Lookup, DnsError> {
        let deadline = Instant::now() + self.config.dns.timeout();
        self.resolver.resolve(domain, rtype, deadline).await
    }

    /// Bind the DNS frontend on `dns.listen`
    ///
    /// The server shares this engine's resolver, so LAN clients and flows
    /// see one cache. Run it with [`DnsServer::run`].
    pub async fn serve_dns(&self) -> Result<DnsServer> {
        let server = DnsServer::bind(
            self.config.dns.listen,
            Arc::clone(&self.resolver),
            Arc::clone(&self.stats),
            self.config.dns.timeout(),
        )
        .await?;
        Ok(server)
    }

    /// Run the bypass path for `domain` on a synthetic handshake
    pub fn test_bypass(&self, domain: &str) -> BypassReport {
        self.dpi.test_bypass(domain)
    }

    /// Start the periodic cache sweeps
    ///
    /// Must be called inside a tokio runtime. The sweeps stop when the
    /// returned handle is dropped.
    pub fn start_maintenance(&self) -> Maintenance {
        let dns_every = Duration::from_secs(self.config.dns.sweep_interval_secs);
        let dpi_every = Duration::from_secs(self.config.dpi.sweep_interval_secs);

        let resolver = Arc::clone(&self.resolver);
        let dns = tokio::spawn(sweep_loop(dns_every, move || {
            let removed = resolver.cache().sweep();
            if removed > 0 {
                debug!(removed, remaining = resolver.cache().len(), "DNS cache swept");
            }
        }));

        let dpi = Arc::clone(&self.dpi);
        let decisions = tokio::spawn(sweep_loop(dpi_every, move || {
            dpi.sweep_decisions();
        }));

        Maintenance {
            tasks: vec![dns, decisions],
        }
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("rules", &self.rules)
            .field("adblock", &self.adblock)
            .field("resolver", &self.resolver)
            .field("dpi", &self.dpi)
            .finish_non_exhaustive()
    }
}

async fn sweep_loop(every: Duration, mut sweep: impl FnMut() + Send) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        sweep();
    }
}

/// Handle to the background sweep tasks
#[derive(Debug)]
pub struct Maintenance {
    tasks: Vec<JoinHandle<()>>,
}

impl Maintenance {
    /// Abort every sweep and wait for the tasks to wind down
    pub async fn stop(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            // a cancelled task reports JoinError::Cancelled
            let _ = task.await;
        }
        debug!("Maintenance stopped");
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Answer, MockUpstream};
    use crate::rules::RuleKind;
    use crate::tunnel::TunnelStatus;

    fn upstream() -> Arc<dyn Upstream> {
        let mut mock = MockUpstream::new();
        mock.expect_name().return_const("mock".to_string());
        mock.expect_query()
            .returning(|_, _| Ok(Answer::positive(vec!["198.51.100.1".parse().unwrap()], 1)));
        Arc::new(mock)
    }

    fn engine(config: Config) -> RoutingEngine {
        RoutingEngine::with_upstreams(config, upstream(), None, Arc::new(TunnelStatus::new())).unwrap()
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut config = Config::default();
        config.dns.max_attempts = 0;
        let err = RoutingEngine::with_upstreams(config, upstream(), None, Arc::new(TunnelStatus::new()))
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_rule_management() {
        let engine = engine(Config::default());
        engine
            .add_rule(Rule::new("r1", RuleKind::Domain, ["a.test"], RouteAction::Vpn))
            .unwrap();
        assert!(engine.add_rule(Rule::new("r2", RuleKind::Cidr, ["nope"], RouteAction::Vpn)).is_err());

        engine
            .update_rule(Rule::new("r1", RuleKind::Domain, ["b.test"], RouteAction::Vpn))
            .unwrap();
        assert_eq!(engine.get_rule("r1").unwrap().patterns, vec!["b.test".to_string()]);
        assert_eq!(engine.list_rules().len(), 1);

        assert!(engine.remove_rule("r1"));
        assert!(!engine.remove_rule("r1"));
        assert_eq!(engine.stats().rule_count, 0);
    }

    #[test]
    fn test_settings_switches() {
        let engine = engine(Config::default());
        engine
            .add_rule(Rule::new("r", RuleKind::Domain, ["a.test"], RouteAction::Block))
            .unwrap();
        assert_eq!(engine.evaluate(&Target::domain("a.test")).action, RouteAction::Block);

        engine.set_routing_enabled(false);
        assert_eq!(engine.evaluate(&Target::domain("a.test")).action, RouteAction::Direct);

        engine.set_routing_enabled(true);
        engine.set_routing_mode(RoutingMode::Cidr);
        assert_eq!(engine.evaluate(&Target::domain("a.test")).action, RouteAction::Direct);

        assert!(engine.set_default_route(RouteAction::Block).is_err());
        engine.set_default_route(RouteAction::Vpn).unwrap();
        assert_eq!(engine.evaluate(&Target::domain("a.test")).action, RouteAction::Vpn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_sweeps_cache() {
        let mut config = Config::default();
        config.dns.min_ttl_secs = 1;
        config.dns.sweep_interval_secs = 5;
        let engine = engine(config);

        engine.test_resolve("example.com", RecordType::A).await.unwrap();
        assert_eq!(engine.stats().cache_entries, 1);

        let maintenance = engine.start_maintenance();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(engine.stats().cache_entries, 0);
        maintenance.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_maintenance_no_longer_sweeps() {
        let mut config = Config::default();
        config.dns.min_ttl_secs = 1;
        config.dns.sweep_interval_secs = 5;
        let engine = engine(config);

        let maintenance = engine.start_maintenance();
        maintenance.stop().await;

        engine.test_resolve("example.com", RecordType::A).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        // expired but never swept
        assert_eq!(engine.stats().cache_entries, 1);
    }

    #[tokio::test]
    async fn test_serve_dns_binds_configured_address() {
        let mut config = Config::default();
        config.dns.listen = "127.0.0.1:0".parse().unwrap();
        let engine = engine(config);

        let server = engine.serve_dns().await.unwrap();
        assert!(server.local_addr().ip().is_loopback());
        assert_ne!(server.local_addr().port(), 0);
    }

    #[test]
    fn test_reload_without_directory() {
        let engine = engine(Config::default());
        let report = engine.reload_rules();
        assert!(report.is_clean());
        assert!(report.loaded.is_empty());
        assert!(engine.reload_geoip().is_err());
    }
}
