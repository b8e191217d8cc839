//! Resolver: veto, cache, coalescing, upstream fallback

use super::cache::{CacheKey, DnsCache};
use super::upstream::Upstream;
use super::{check_record_type, Answer, AnswerKind, RecordType};
use crate::adblock::AdBlockFilter;
use crate::config::DnsConfig;
use crate::error::DnsError;
use crate::rules::normalize_domain;
use crate::stats::Stats;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, instrument, warn};

type Waiters = Vec<oneshot::Sender<Result<Answer, DnsError>>>;
type InflightMap = DashMap<CacheKey, Waiters>;

/// Where an answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Ad-block veto; nothing was queried
    Blocked,
    /// Served from cache
    Cache,
    /// Shared result of another caller's upstream query
    Coalesced,
    /// This call queried upstream
    Upstream,
}

/// A resolved answer and its provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lookup {
    /// The answer
    pub answer: Answer,
    /// Provenance
    pub source: Source,
}

/// Resolver tuning
#[derive(Debug, Clone, Copy)]
pub struct ResolverOptions {
    /// Attempts across primary and bootstrap combined
    pub max_attempts: u32,
    /// TTL for NXDOMAIN/NODATA answers before clamping
    pub negative_ttl_secs: u32,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            negative_ttl_secs: 60,
        }
    }
}

impl From<&DnsConfig> for ResolverOptions {
    fn from(config: &DnsConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            negative_ttl_secs: config.negative_ttl_secs,
        }
    }
}

/// Removes the in-flight entry if the leader goes away without publishing
///
/// Dropping the waiters' senders wakes them with a receive error; they then
/// retry and one of them becomes the new leader.
struct InflightGuard {
    inflight: Arc<InflightMap>,
    key: Option<CacheKey>,
}

impl InflightGuard {
    fn new(inflight: Arc<InflightMap>, key: CacheKey) -> Self {
        Self {
            inflight,
            key: Some(key),
        }
    }

    /// Hand the result to every waiter and retire the entry
    fn publish(mut self, result: &Result<Answer, DnsError>) -> usize {
        let Some(key) = self.key.take() else {
            return 0;
        };
        let waiters = self
            .inflight
            .remove(&key)
            .map(|(_, v)| v)
            .unwrap_or_default();
        let count = waiters.len();
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        count
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inflight.remove(&key);
        }
    }
}

/// Caching, coalescing DNS resolver
pub struct Resolver {
    primary: Arc<dyn Upstream>,
    bootstrap: Option<Arc<dyn Upstream>>,
    cache: Arc<DnsCache>,
    adblock: Arc<AdBlockFilter>,
    stats: Arc<Stats>,
    inflight: Arc<InflightMap>,
    options: ResolverOptions,
}

impl Resolver {
    /// Create a resolver from its collaborators
    pub fn new(
        primary: Arc<dyn Upstream>,
        bootstrap: Option<Arc<dyn Upstream>>,
        cache: Arc<DnsCache>,
        adblock: Arc<AdBlockFilter>,
        stats: Arc<Stats>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            primary,
            bootstrap,
            cache,
            adblock,
            stats,
            inflight: Arc::new(DashMap::new()),
            options: ResolverOptions {
                max_attempts: options.max_attempts.max(1),
                ..options
            },
        }
    }

    /// The answer cache
    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    /// Discard every cached answer
    ///
    /// In-flight queries are untouched and re-populate the cache when they
    /// finish.
    pub fn clear_cache(&self) {
        let dropped = self.cache.len();
        self.cache.clear();
        debug!(dropped, "DNS cache cleared");
    }

    /// Number of distinct queries currently in flight
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Resolve `domain` for `rtype`, giving up at `deadline`
    ///
    /// Transient failures are returned, never cached. The returned future
    /// may be dropped at any time; waiters attached to it are released.
    #[instrument(skip(self, deadline), fields(domain = %domain, rtype = %rtype))]
    pub async fn resolve(
        &self,
        domain: &str,
        rtype: RecordType,
        deadline: Instant,
    ) -> Result<Lookup, DnsError> {
        check_record_type(rtype)?;
        let domain = normalize_domain(domain).map_err(|_| DnsError::InvalidName(domain.to_string()))?;

        if self.adblock.is_blocked(&domain) {
            Stats::incr(&self.stats.adblock_vetoes);
            return Ok(Lookup {
                answer: Answer::blocked(),
                source: Source::Blocked,
            });
        }

        let key = CacheKey::new(domain, rtype);
        let started = Instant::now();
        let mut first_pass = true;

        loop {
            if let Some(answer) = self.cache.get(&key) {
                Stats::incr(&self.stats.cache_hits);
                return Ok(Lookup {
                    answer,
                    source: Source::Cache,
                });
            }
            if first_pass {
                Stats::incr(&self.stats.cache_misses);
                first_pass = false;
            }

            let waiter = match self.inflight.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().push(tx);
                    Some(rx)
                }
                Entry::Vacant(entry) => {
                    entry.insert(Vec::new());
                    None
                }
            };

            let Some(rx) = waiter else {
                let guard = InflightGuard::new(Arc::clone(&self.inflight), key.clone());
                return self.lead(&key, guard, deadline, started).await;
            };

            match timeout_at(deadline, rx).await {
                Ok(Ok(result)) => {
                    Stats::incr(&self.stats.coalesced);
                    return result.map(|answer| Lookup {
                        answer,
                        source: Source::Coalesced,
                    });
                }
                // Leader was cancelled; try again (possibly as leader)
                Ok(Err(_)) => continue,
                Err(_) => {
                    return Err(DnsError::Timeout {
                        domain: key.domain().to_string(),
                        elapsed: started.elapsed(),
                    })
                }
            }
        }
    }

    async fn lead(
        &self,
        key: &CacheKey,
        guard: InflightGuard,
        deadline: Instant,
        started: Instant,
    ) -> Result<Lookup, DnsError> {
        let result = self
            .query_upstreams(key.domain(), key.record_type(), deadline, started)
            .await
            .map(|answer| self.store(key, answer));

        match &result {
            Ok(answer) if answer.kind == AnswerKind::NxDomain => {
                Stats::incr(&self.stats.resolved_nxdomain);
            }
            Ok(_) => Stats::incr(&self.stats.resolved_ok),
            Err(e) => {
                Stats::incr(&self.stats.resolve_failed);
                warn!(domain = key.domain(), error = %e, "DNS resolution failed");
            }
        }

        let waiters = guard.publish(&result);
        if waiters > 0 {
            debug!(domain = key.domain(), waiters, "Coalesced waiters released");
        }

        result.map(|answer| Lookup {
            answer,
            source: Source::Upstream,
        })
    }

    /// Cache a successful answer; negative answers get the negative TTL
    fn store(&self, key: &CacheKey, mut answer: Answer) -> Answer {
        if answer.is_negative() {
            answer.ttl_secs = self.options.negative_ttl_secs;
        }
        self.cache.insert(key.clone(), answer)
    }

    async fn query_upstreams(
        &self,
        domain: &str,
        rtype: RecordType,
        deadline: Instant,
        started: Instant,
    ) -> Result<Answer, DnsError> {
        let max = self.options.max_attempts;
        let mut last_reason = String::from("no attempt made");

        for attempt in 0..max {
            let upstream = match (&self.bootstrap, attempt % 2) {
                (Some(bootstrap), 1) => bootstrap,
                _ => &self.primary,
            };

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            // Split what is left of the deadline across remaining attempts
            let budget = (deadline - now) / (max - attempt);

            Stats::incr(&self.stats.upstream_queries);
            match timeout(budget, upstream.query(domain, rtype)).await {
                Ok(Ok(answer)) => {
                    debug!(upstream = %upstream.name(), attempt, addrs = answer.addrs.len(), "DNS answer");
                    return Ok(answer);
                }
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => {
                    debug!(upstream = %upstream.name(), attempt, error = %e, "DNS attempt failed");
                    last_reason = e.to_string();
                }
                Err(_) => {
                    debug!(upstream = %upstream.name(), attempt, "DNS attempt timed out");
                    last_reason = format!("{} timed out", upstream.name());
                }
            }
        }

        if Instant::now() >= deadline {
            return Err(DnsError::Timeout {
                domain: domain.to_string(),
                elapsed: started.elapsed(),
            });
        }
        Err(DnsError::Unreachable {
            domain: domain.to_string(),
            attempts: max,
            reason: last_reason,
        })
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("primary", &self.primary.name())
            .field("bootstrap", &self.bootstrap.as_ref().map(|b| b.name()))
            .field("cache_entries", &self.cache.len())
            .field("inflight", &self.inflight.len())
            .field("options", &self.options)
            .finish()
    }
}
