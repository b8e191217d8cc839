//! Runtime counters
//!
//! One `Stats` instance is shared (behind an `Arc`) by the resolver, the DPI
//! engine and the dispatcher. Counters are relaxed atomics; a snapshot is a
//! best-effort view, not a consistent cut.

use crate::rules::RouteAction;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters
#[derive(Debug, Default)]
pub struct Stats {
    /// DNS cache hits
    pub cache_hits: AtomicU64,
    /// DNS cache misses
    pub cache_misses: AtomicU64,
    /// Queries sent to an upstream (every attempt counts)
    pub upstream_queries: AtomicU64,
    /// Resolutions that attached to an in-flight query
    pub coalesced: AtomicU64,
    /// Resolutions that produced addresses
    pub resolved_ok: AtomicU64,
    /// Resolutions answered with NXDOMAIN
    pub resolved_nxdomain: AtomicU64,
    /// Resolutions that failed
    pub resolve_failed: AtomicU64,
    /// Ad-block vetoes (resolver and dispatcher)
    pub adblock_vetoes: AtomicU64,
    /// Queries received by the DNS server
    pub dns_queries: AtomicU64,
    /// Flows routed direct
    pub routed_direct: AtomicU64,
    /// Flows routed through the tunnel
    pub routed_vpn: AtomicU64,
    /// Flows terminated
    pub blocked: AtomicU64,
    /// `vpn` decisions rerouted because no tunnel was up
    pub vpn_fallbacks: AtomicU64,
    /// Flows that received the DPI transform
    pub bypass_applied: AtomicU64,
    /// Flows left untouched by the DPI engine
    pub passthrough: AtomicU64,
    /// DPI decisions served from the decision cache
    pub decision_cache_hits: AtomicU64,
    /// Transforms that failed and fell back to passthrough
    pub transform_errors: AtomicU64,
    /// Flows opened
    pub flows_opened: AtomicU64,
    /// Flows closed
    pub flows_closed: AtomicU64,
}

impl Stats {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a routed flow under its final action
    pub fn record_route(&self, action: RouteAction) {
        let counter = match action {
            RouteAction::Direct => &self.routed_direct,
            RouteAction::Vpn => &self.routed_vpn,
            RouteAction::Block => &self.blocked,
        };
        Self::incr(counter);
    }

    /// Get a snapshot of current counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let opened = load(&self.flows_opened);
        let closed = load(&self.flows_closed);

        StatsSnapshot {
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            upstream_queries: load(&self.upstream_queries),
            coalesced: load(&self.coalesced),
            resolved_ok: load(&self.resolved_ok),
            resolved_nxdomain: load(&self.resolved_nxdomain),
            resolve_failed: load(&self.resolve_failed),
            adblock_vetoes: load(&self.adblock_vetoes),
            dns_queries: load(&self.dns_queries),
            routed_direct: load(&self.routed_direct),
            routed_vpn: load(&self.routed_vpn),
            blocked: load(&self.blocked),
            vpn_fallbacks: load(&self.vpn_fallbacks),
            bypass_applied: load(&self.bypass_applied),
            passthrough: load(&self.passthrough),
            decision_cache_hits: load(&self.decision_cache_hits),
            transform_errors: load(&self.transform_errors),
            flows_opened: opened,
            flows_closed: closed,
            live_flows: opened.saturating_sub(closed),
            cache_entries: 0,
            rule_count: 0,
            generation: 0,
        }
    }
}

/// Point-in-time copy of the counters plus engine gauges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// DNS cache hits
    pub cache_hits: u64,
    /// DNS cache misses
    pub cache_misses: u64,
    /// Upstream query attempts
    pub upstream_queries: u64,
    /// Coalesced waiters
    pub coalesced: u64,
    /// Successful resolutions
    pub resolved_ok: u64,
    /// NXDOMAIN resolutions
    pub resolved_nxdomain: u64,
    /// Failed resolutions
    pub resolve_failed: u64,
    /// Ad-block vetoes
    pub adblock_vetoes: u64,
    /// Queries received by the DNS server
    pub dns_queries: u64,
    /// Flows routed direct
    pub routed_direct: u64,
    /// Flows routed via VPN
    pub routed_vpn: u64,
    /// Flows blocked
    pub blocked: u64,
    /// VPN fallbacks to the default route
    pub vpn_fallbacks: u64,
    /// DPI bypass applications
    pub bypass_applied: u64,
    /// DPI passthrough decisions
    pub passthrough: u64,
    /// DPI decision-cache hits
    pub decision_cache_hits: u64,
    /// DPI transform errors
    pub transform_errors: u64,
    /// Flows opened since start
    pub flows_opened: u64,
    /// Flows closed or dropped since start
    pub flows_closed: u64,
    /// Flows currently open
    pub live_flows: u64,
    /// Entries currently in the DNS cache (expired included until swept)
    pub cache_entries: u64,
    /// Rules currently stored
    pub rule_count: u64,
    /// Rule snapshot generation
    pub generation: u64,
}

impl StatsSnapshot {
    /// Cache hit ratio in `[0, 1]`, `None` before the first lookup
    pub fn cache_hit_ratio(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        #[allow(clippy::cast_precision_loss)]
        (total > 0).then(|| self.cache_hits as f64 / total as f64)
    }
}
