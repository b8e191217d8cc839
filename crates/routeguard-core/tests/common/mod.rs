//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use routeguard_core::dns::{Answer, RecordType, Upstream};
use routeguard_core::{DnsError, RoutingEngine, TunnelStatus};
use routeguard_core::config::Config;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ANSWER_IP: &str = "93.184.216.34";

/// Upstream that answers every query with one address after a delay
pub struct CountingUpstream {
    calls: AtomicUsize,
    delay: Duration,
    ttl_secs: u32,
    fail: bool,
}

impl CountingUpstream {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            ttl_secs: 300,
            fail: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_ttl(mut self, ttl_secs: u32) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for CountingUpstream {
    async fn query(&self, _domain: &str, _rtype: RecordType) -> Result<Answer, DnsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(DnsError::transport(self.name(), "connection refused"));
        }
        let ip: IpAddr = ANSWER_IP.parse().unwrap();
        Ok(Answer::positive(vec![ip], self.ttl_secs))
    }

    fn name(&self) -> String {
        "counting".to_string()
    }
}

/// Engine around a counting upstream and a disconnected tunnel
pub fn engine(
    config: Config,
    upstream: Arc<CountingUpstream>,
) -> (RoutingEngine, Arc<TunnelStatus>) {
    let tunnel = Arc::new(TunnelStatus::new());
    let engine = RoutingEngine::with_upstreams(config, upstream, None, tunnel.clone()).unwrap();
    (engine, tunnel)
}
