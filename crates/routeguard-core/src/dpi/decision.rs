//! Per-endpoint bypass decisions
//!
//! Keyed by `(remote IP, SNI)` with a TTL independent of DNS TTLs, so a
//! repeat connection to the same endpoint skips the bypass criteria.

use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Cached outcome for an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BypassDecision {
    /// Apply the transform
    Bypass,
    /// Leave the flow alone
    Passthrough,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct DecisionKey {
    remote_ip: IpAddr,
    sni: String,
}

#[derive(Debug, Clone, Copy)]
struct DecisionEntry {
    decision: BypassDecision,
    created: Instant,
}

/// Short-TTL concurrent decision cache
#[derive(Debug)]
pub struct DecisionCache {
    entries: DashMap<DecisionKey, DecisionEntry>,
    ttl: Duration,
}

impl DecisionCache {
    /// Create a cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Record a decision
    pub fn record(&self, remote_ip: IpAddr, sni: &str, decision: BypassDecision) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.insert(
            DecisionKey {
                remote_ip,
                sni: sni.to_string(),
            },
            DecisionEntry {
                decision,
                created: Instant::now(),
            },
        );
    }

    /// Get an unexpired decision
    pub fn get(&self, remote_ip: IpAddr, sni: &str) -> Option<BypassDecision> {
        let key = DecisionKey {
            remote_ip,
            sni: sni.to_string(),
        };
        let entry = self.entries.get(&key)?;
        (entry.created.elapsed() < self.ttl).then_some(entry.decision)
    }

    /// Drop expired entries; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.created) < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.entries.clear();
    }
}
