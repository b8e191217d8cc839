//! Rule evaluation
//!
//! Ordering: descending priority first. Among matching rules of the same
//! priority the most specific matched pattern wins, then the earliest
//! inserted rule. A lower-priority rule never beats a higher-priority
//! match, however specific it is.

use super::pattern::{canonical_host, Pattern};
use super::store::{RuleSnapshot, RuleStore};
use super::types::{RouteAction, RuleKind};
use crate::config::RoutingMode;
use serde::Serialize;
use std::net::IpAddr;
use tracing::trace;

/// What to classify: a domain, an IP, or both
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    domain: Option<String>,
    ip: Option<IpAddr>,
}

impl Target {
    /// Classify by domain name
    pub fn domain(domain: &str) -> Self {
        Self {
            domain: Some(canonical_host(domain)),
            ip: None,
        }
    }

    /// Classify by IP address
    pub fn ip(ip: IpAddr) -> Self {
        Self {
            domain: None,
            ip: Some(ip),
        }
    }

    /// Parse `s` as an IP, falling back to a domain name
    pub fn parse(s: &str) -> Self {
        match s.trim().parse::<IpAddr>() {
            Ok(ip) => Self::ip(ip),
            Err(_) => Self::domain(s),
        }
    }

    /// Attach a resolved address
    #[must_use]
    pub fn with_ip(mut self, ip: Option<IpAddr>) -> Self {
        if ip.is_some() {
            self.ip = ip;
        }
        self
    }

    /// Domain part
    pub fn domain_name(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// IP part
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip
    }
}

/// Classification result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Action to take
    pub action: RouteAction,
    /// Matching rule, `None` on a default-route fallback
    pub rule_id: Option<String>,
    /// Matched pattern as text
    pub pattern: Option<String>,
    /// Specificity of the matched pattern
    pub specificity: u32,
}

impl Verdict {
    /// Fallback verdict for a classification miss
    pub fn default_route(action: RouteAction) -> Self {
        Self {
            action,
            rule_id: None,
            pattern: None,
            specificity: 0,
        }
    }

    /// Whether a rule matched
    pub fn is_match(&self) -> bool {
        self.rule_id.is_some()
    }
}

fn mode_admits(mode: RoutingMode, pattern: &Pattern) -> bool {
    match mode {
        RoutingMode::Mixed => true,
        RoutingMode::Domain => pattern.kind() == RuleKind::Domain,
        RoutingMode::Geoip => pattern.kind() == RuleKind::Geoip,
        RoutingMode::Cidr => pattern.kind() == RuleKind::Cidr,
    }
}

impl RuleSnapshot {
    /// Classify a target against this snapshot
    pub fn evaluate(&self, target: &Target) -> Verdict {
        let settings = self.settings;
        if !settings.enabled {
            return Verdict::default_route(settings.default_route);
        }

        let domain = target.domain.as_deref();
        let ip = target.ip;
        let mut best: Option<(i32, u32, usize, &Pattern)> = None;

        for (idx, compiled) in self.active.iter().enumerate() {
            let priority = compiled.rule.priority;
            if best.is_some_and(|(p, ..)| priority < p) {
                break;
            }

            let matched = compiled
                .patterns
                .iter()
                .filter(|p| mode_admits(settings.mode, p))
                .filter(|p| p.matches(domain, ip, &self.geoip))
                .max_by_key(|p| p.specificity());

            if let Some(pattern) = matched {
                let spec = pattern.specificity();
                // `active` is in insertion order within a priority, so only a
                // strictly more specific match displaces the current best.
                if best.map_or(true, |(_, s, ..)| spec > s) {
                    best = Some((priority, spec, idx, pattern));
                }
            }
        }

        match best {
            Some((_, specificity, idx, pattern)) => {
                let rule = &self.active[idx].rule;
                trace!(rule = %rule.id, action = %rule.action, "Rule matched");
                Verdict {
                    action: rule.action,
                    rule_id: Some(rule.id.clone()),
                    pattern: Some(pattern.to_string()),
                    specificity,
                }
            }
            None => Verdict::default_route(settings.default_route),
        }
    }
}

impl RuleStore {
    /// Classify against the snapshot current at call time
    pub fn evaluate(&self, target: &Target) -> Verdict {
        self.snapshot().evaluate(target)
    }
}
