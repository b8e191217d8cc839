//! TTL-bounded answer cache

use super::{Answer, RecordType};
use crate::config::DnsConfig;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Entries inspected when the cache is full
const EVICTION_SAMPLE: usize = 32;

/// Cache key: lowercased domain and record type
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    domain: String,
    rtype: RecordType,
}

impl CacheKey {
    /// Create a key; the domain is expected in canonical form
    pub fn new(domain: impl Into<String>, rtype: RecordType) -> Self {
        Self {
            domain: domain.into(),
            rtype,
        }
    }

    /// Domain part
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Record type part
    pub fn record_type(&self) -> RecordType {
        self.rtype
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    answer: Answer,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.inserted_at + self.ttl
    }
}

/// Concurrent DNS cache
///
/// An entry is valid while `now < inserted_at + ttl`. Expired entries stay
/// in the map until [`sweep`](Self::sweep) runs but are never returned.
#[derive(Debug)]
pub struct DnsCache {
    entries: DashMap<CacheKey, CacheEntry>,
    min_ttl: u32,
    max_ttl: u32,
    /// 0 = unbounded
    max_entries: usize,
}

impl DnsCache {
    /// Create a cache with TTL bounds in seconds
    pub fn new(min_ttl: u32, max_ttl: u32, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            min_ttl,
            max_ttl: max_ttl.max(min_ttl),
            max_entries,
        }
    }

    /// Create from the `[dns]` configuration section
    pub fn from_config(config: &DnsConfig) -> Self {
        Self::new(config.min_ttl_secs, config.max_ttl_secs, config.max_entries)
    }

    /// Clamp an upstream TTL into the configured bounds
    pub fn clamp_ttl(&self, ttl_secs: u32) -> u32 {
        ttl_secs.clamp(self.min_ttl, self.max_ttl)
    }

    /// Look up a valid entry
    pub fn get(&self, key: &CacheKey) -> Option<Answer> {
        let entry = self.entries.get(key)?;
        entry
            .is_valid(Instant::now())
            .then(|| entry.answer.clone())
    }

    /// Insert an answer with its TTL clamped; returns the cached copy
    pub fn insert(&self, key: CacheKey, mut answer: Answer) -> Answer {
        answer.ttl_secs = self.clamp_ttl(answer.ttl_secs);

        if self.max_entries > 0
            && self.entries.len() >= self.max_entries
            && !self.entries.contains_key(&key)
        {
            self.make_room();
        }

        self.entries.insert(
            key,
            CacheEntry {
                answer: answer.clone(),
                inserted_at: Instant::now(),
                ttl: Duration::from_secs(u64::from(answer.ttl_secs)),
            },
        );
        answer
    }

    /// Drop expired entries; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_valid(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "DNS cache swept");
        }
        removed
    }

    /// Discard every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict the entry closest to expiry among a bounded sample
    ///
    /// Expired entries sort first, so they go before live ones. Bulk
    /// cleanup is left to [`sweep`](Self::sweep).
    fn make_room(&self) {
        let victim = self
            .entries
            .iter()
            .take(EVICTION_SAMPLE)
            .min_by_key(|e| e.inserted_at + e.ttl)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::from_config(&DnsConfig::default())
    }
}
