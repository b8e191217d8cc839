//! Bypass criteria and the per-flow inspection state machine
//!
//! ```text
//! Init ──first bytes──▶ Inspecting ──match──▶ BypassApplied
//!                            │
//!                            └─no match / budget / garbage──▶ Passthrough
//! any state ──close──▶ Closed
//! ```
//!
//! The transform happens once per flow; bytes after the first flight are
//! forwarded unchanged.

use super::decision::{BypassDecision, DecisionCache};
use super::tls::{build_client_hello, parse_client_hello, ClientHello, Parse};
use super::transform::{build_segments, TransformOptions};
use crate::config::{DpiConfig, DpiMode};
use crate::rules::{canonical_host, normalize_domain};
use crate::stats::Stats;
use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

/// SNI substrings that trigger the transform in auto mode
static DEFAULT_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "youtube",
        "googlevideo",
        "ytimg",
        "discord",
        "twitter",
        "twimg",
        "instagram",
        "facebook",
        "fbcdn",
        "telegram",
        "linkedin",
        "rutracker",
    ]
});

const READ_CHUNK: usize = 4096;

/// Per-flow DPI state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DpiState {
    /// No bytes seen
    Init,
    /// Buffering the first flight
    Inspecting,
    /// Transform emitted; irreversible for the flow
    BypassApplied,
    /// Forwarding unchanged
    Passthrough,
    /// Connection gone
    Closed,
}

/// Why a server name qualifies for the transform
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum BypassReason {
    /// Listed in the manual bypass domains (the matched entry)
    Manual(String),
    /// Matched an auto-mode keyword
    Keyword(String),
}

/// Result of feeding bytes to an inspector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectOutcome {
    /// Keep buffering
    NeedMore,
    /// Write these segments, in order
    Forward(Vec<Bytes>),
}

/// Diagnostic result of [`DpiEngine::test_bypass`]
#[derive(Debug, Clone, Serialize)]
pub struct BypassReport {
    /// Normalized domain
    pub domain: String,
    /// Matching criterion, if any
    pub reason: Option<BypassReason>,
    /// State a flow to this domain would settle in
    pub state: DpiState,
    /// Segment sizes in order
    pub segment_sizes: Vec<usize>,
    /// Transform failure, if one occurred
    pub error: Option<String>,
    /// The emitted segments
    #[serde(skip)]
    pub segments: Vec<Bytes>,
}

/// DPI bypass engine shared by every flow
pub struct DpiEngine {
    enabled: bool,
    mode: DpiMode,
    manual: HashSet<String>,
    keywords: Vec<String>,
    byte_budget: usize,
    time_budget: Duration,
    options: TransformOptions,
    decisions: DecisionCache,
    stats: Arc<Stats>,
}

impl DpiEngine {
    /// Create from the `[dpi]` configuration section
    pub fn new(config: &DpiConfig, stats: Arc<Stats>) -> Self {
        let manual = config
            .bypass_domains
            .iter()
            .filter_map(|d| match normalize_domain(d) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!(error = %e, "Ignoring bypass domain");
                    None
                }
            })
            .collect();

        let keywords = if config.auto_keywords.is_empty() {
            DEFAULT_KEYWORDS.iter().map(|k| (*k).to_string()).collect()
        } else {
            config
                .auto_keywords
                .iter()
                .map(|k| k.trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .collect()
        };

        Self {
            enabled: config.enabled,
            mode: config.mode,
            manual,
            keywords,
            byte_budget: config.inspect_byte_budget,
            time_budget: config.inspect_timeout(),
            options: TransformOptions::from(&config.fragment),
            decisions: DecisionCache::new(config.decision_ttl()),
            stats,
        }
    }

    /// Whether the engine transforms anything at all
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Inspection time budget
    pub fn time_budget(&self) -> Duration {
        self.time_budget
    }

    /// The decision cache
    pub fn decisions(&self) -> &DecisionCache {
        &self.decisions
    }

    /// Drop expired decisions
    pub fn sweep_decisions(&self) -> usize {
        let removed = self.decisions.sweep();
        if removed > 0 {
            debug!(removed, "DPI decision cache swept");
        }
        removed
    }

    /// Check a server name against the bypass criteria
    pub fn match_criteria(&self, sni: &str) -> Option<BypassReason> {
        let host = canonical_host(sni);

        let mut current = host.as_str();
        loop {
            if self.manual.contains(current) {
                return Some(BypassReason::Manual(current.to_string()));
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => break,
            }
        }

        if self.mode == DpiMode::Auto {
            if let Some(k) = self.keywords.iter().find(|k| host.contains(k.as_str())) {
                return Some(BypassReason::Keyword(k.clone()));
            }
        }
        None
    }

    /// Start inspecting a new flow
    ///
    /// `hint` is the domain the flow was opened for, if known; a cached
    /// passthrough decision for it skips inspection entirely.
    pub fn inspector(self: &Arc<Self>, remote_ip: IpAddr, hint: Option<&str>) -> FlowInspector {
        FlowInspector {
            engine: Arc::clone(self),
            remote_ip,
            hint: hint.map(canonical_host),
            state: DpiState::Init,
            buf: BytesMut::new(),
            started: None,
            sni: None,
        }
    }

    /// Run the bypass path for `domain` on a synthetic ClientHello
    ///
    /// Touches neither the decision cache nor the counters.
    pub fn test_bypass(&self, domain: &str) -> BypassReport {
        let domain = canonical_host(domain);
        let hello = build_client_hello(&domain);
        let reason = self.match_criteria(&domain);

        let mut report = BypassReport {
            domain,
            reason,
            state: DpiState::Passthrough,
            segment_sizes: vec![hello.len()],
            error: None,
            segments: vec![Bytes::from(hello.clone())],
        };
        if !self.enabled || report.reason.is_none() {
            return report;
        }

        let transformed = match parse_client_hello(&hello) {
            Parse::Hello(parsed) => build_segments(&hello, &parsed, &self.options)
                .map_err(|e| e.to_string()),
            other => Err(format!("synthetic hello did not parse: {other:?}")),
        };
        match transformed {
            Ok(segments) => {
                report.state = DpiState::BypassApplied;
                report.segment_sizes = segments.iter().map(Bytes::len).collect();
                report.segments = segments;
            }
            Err(e) => report.error = Some(e),
        }
        report
    }
}

impl std::fmt::Debug for DpiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpiEngine")
            .field("enabled", &self.enabled)
            .field("mode", &self.mode)
            .field("manual", &self.manual.len())
            .field("keywords", &self.keywords.len())
            .field("decisions", &self.decisions.len())
            .finish()
    }
}

/// Inspection state for one flow
#[derive(Debug)]
pub struct FlowInspector {
    engine: Arc<DpiEngine>,
    remote_ip: IpAddr,
    hint: Option<String>,
    state: DpiState,
    buf: BytesMut,
    started: Option<Instant>,
    sni: Option<String>,
}

impl FlowInspector {
    /// Current state
    pub fn state(&self) -> DpiState {
        self.state
    }

    /// Server name learned from the handshake
    pub fn sni(&self) -> Option<&str> {
        self.sni.as_deref()
    }

    /// Whether inspection has reached a final decision
    pub fn is_settled(&self) -> bool {
        matches!(
            self.state,
            DpiState::BypassApplied | DpiState::Passthrough | DpiState::Closed
        )
    }

    /// Feed client-to-server bytes
    pub fn feed(&mut self, data: &[u8]) -> InspectOutcome {
        match self.state {
            DpiState::Closed => InspectOutcome::Forward(Vec::new()),
            DpiState::BypassApplied | DpiState::Passthrough => {
                InspectOutcome::Forward(vec![Bytes::copy_from_slice(data)])
            }
            DpiState::Init => {
                self.state = DpiState::Inspecting;
                self.started = Some(Instant::now());
                trace!(remote = %self.remote_ip, "DPI inspecting");

                if !self.engine.enabled {
                    self.buf.extend_from_slice(data);
                    return self.settle_passthrough("disabled");
                }
                if let Some(hint) = &self.hint {
                    if self.engine.decisions.get(self.remote_ip, hint)
                        == Some(BypassDecision::Passthrough)
                    {
                        Stats::incr(&self.engine.stats.decision_cache_hits);
                        self.sni = Some(hint.clone());
                        self.buf.extend_from_slice(data);
                        return self.settle_passthrough("cached decision");
                    }
                }
                self.inspect(data)
            }
            DpiState::Inspecting => self.inspect(data),
        }
    }

    /// Give up waiting; buffered bytes are released unchanged
    pub fn on_timeout(&mut self) -> InspectOutcome {
        if self.state == DpiState::Inspecting || self.state == DpiState::Init {
            self.settle_passthrough("time budget")
        } else {
            InspectOutcome::Forward(Vec::new())
        }
    }

    /// Mark the flow closed and drop buffered bytes
    pub fn close(&mut self) {
        self.state = DpiState::Closed;
        self.buf.clear();
    }

    /// Read the first flight from `reader` until a decision is reached
    ///
    /// Bounded by the engine's byte and time budgets. End of stream settles
    /// as passthrough with whatever was buffered.
    pub async fn inspect_stream<R>(&mut self, reader: &mut R) -> std::io::Result<Vec<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        let deadline = Instant::now() + self.engine.time_budget;
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let n = match timeout_at(deadline, reader.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => return Ok(self.on_timeout().into_segments()),
            };
            if n == 0 {
                return Ok(self.on_timeout().into_segments());
            }
            match self.feed(&chunk[..n]) {
                InspectOutcome::NeedMore => continue,
                InspectOutcome::Forward(segments) => return Ok(segments),
            }
        }
    }

    fn inspect(&mut self, data: &[u8]) -> InspectOutcome {
        self.buf.extend_from_slice(data);

        if self
            .started
            .is_some_and(|s| s.elapsed() >= self.engine.time_budget)
        {
            return self.settle_passthrough("time budget");
        }

        match parse_client_hello(&self.buf) {
            Parse::Incomplete if self.buf.len() >= self.engine.byte_budget => {
                self.settle_passthrough("byte budget")
            }
            Parse::Incomplete => InspectOutcome::NeedMore,
            Parse::NotHandshake => self.settle_passthrough("not a TLS handshake"),
            Parse::Malformed(reason) => self.settle_passthrough(reason),
            Parse::Hello(hello) => self.decide(&hello),
        }
    }

    fn decide(&mut self, hello: &ClientHello) -> InspectOutcome {
        let Some(sni) = hello.server_name.as_ref().map(|s| s.host.clone()) else {
            return self.settle_passthrough("no server name");
        };

        let decision = match self.engine.decisions.get(self.remote_ip, &sni) {
            Some(cached) => {
                Stats::incr(&self.engine.stats.decision_cache_hits);
                cached
            }
            None => {
                let decision = match self.engine.match_criteria(&sni) {
                    Some(reason) => {
                        debug!(sni = %sni, ?reason, "DPI bypass criteria matched");
                        BypassDecision::Bypass
                    }
                    None => BypassDecision::Passthrough,
                };
                self.engine.decisions.record(self.remote_ip, &sni, decision);
                decision
            }
        };
        self.sni = Some(sni);

        if decision == BypassDecision::Passthrough {
            return self.settle_passthrough("criteria not matched");
        }

        match build_segments(&self.buf, hello, &self.engine.options) {
            Ok(segments) => {
                self.state = DpiState::BypassApplied;
                self.buf.clear();
                Stats::incr(&self.engine.stats.bypass_applied);
                debug!(
                    remote = %self.remote_ip,
                    sni = ?self.sni,
                    segments = segments.len(),
                    "DPI bypass applied"
                );
                InspectOutcome::Forward(segments)
            }
            Err(e) => {
                Stats::incr(&self.engine.stats.transform_errors);
                warn!(remote = %self.remote_ip, error = %e, "DPI transform failed, passing through");
                self.settle_passthrough("transform error")
            }
        }
    }

    fn settle_passthrough(&mut self, why: &str) -> InspectOutcome {
        self.state = DpiState::Passthrough;
        Stats::incr(&self.engine.stats.passthrough);
        trace!(remote = %self.remote_ip, why, "DPI passthrough");

        let buffered = self.buf.split().freeze();
        if buffered.is_empty() {
            InspectOutcome::Forward(Vec::new())
        } else {
            InspectOutcome::Forward(vec![buffered])
        }
    }
}

impl InspectOutcome {
    /// Segments to write; empty while more bytes are needed
    pub fn into_segments(self) -> Vec<Bytes> {
        match self {
            Self::NeedMore => Vec::new(),
            Self::Forward(segments) => segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    fn engine(mutate: impl FnOnce(&mut DpiConfig)) -> Arc<DpiEngine> {
        let mut config = DpiConfig {
            bypass_domains: vec!["blocked.test".into()],
            ..DpiConfig::default()
        };
        config.fragment.segment_size = 16;
        mutate(&mut config);
        Arc::new(DpiEngine::new(&config, Arc::new(Stats::new())))
    }

    fn concat(segments: &[Bytes]) -> Vec<u8> {
        segments.iter().flat_map(|s| s.iter().copied()).collect()
    }

    #[test]
    fn test_criteria() {
        let engine = engine(|_| {});
        assert_eq!(
            engine.match_criteria("cdn.Blocked.test"),
            Some(BypassReason::Manual("blocked.test".into()))
        );
        assert_eq!(
            engine.match_criteria("www.youtube.com"),
            Some(BypassReason::Keyword("youtube".into()))
        );
        assert_eq!(engine.match_criteria("example.com"), None);

        let manual = self::engine(|c| c.mode = DpiMode::Manual);
        assert_eq!(manual.match_criteria("www.youtube.com"), None);
    }

    #[test]
    fn test_bypass_applied_once() {
        let engine = engine(|_| {});
        let hello = build_client_hello("blocked.test");
        let mut inspector = engine.inspector(IP, None);

        let InspectOutcome::Forward(segments) = inspector.feed(&hello) else {
            panic!("complete hello must settle");
        };
        assert_eq!(inspector.state(), DpiState::BypassApplied);
        assert!(segments.len() > 1);
        assert_eq!(concat(&segments), hello);

        // later bytes pass unchanged
        let later = inspector.feed(b"application data");
        assert_eq!(
            later,
            InspectOutcome::Forward(vec![Bytes::from_static(b"application data")])
        );
        assert_eq!(inspector.state(), DpiState::BypassApplied);
    }

    #[test]
    fn test_split_hello_needs_more() {
        let engine = engine(|_| {});
        let hello = build_client_hello("blocked.test");
        let mut inspector = engine.inspector(IP, None);

        assert_eq!(inspector.feed(&hello[..10]), InspectOutcome::NeedMore);
        assert_eq!(inspector.state(), DpiState::Inspecting);
        let out = inspector.feed(&hello[10..]);
        assert!(matches!(out, InspectOutcome::Forward(_)));
        assert_eq!(inspector.state(), DpiState::BypassApplied);
    }

    #[test]
    fn test_unlisted_sni_passthrough() {
        let engine = engine(|_| {});
        let hello = build_client_hello("example.com");
        let mut inspector = engine.inspector(IP, None);

        let out = inspector.feed(&hello);
        assert_eq!(out, InspectOutcome::Forward(vec![Bytes::from(hello)]));
        assert_eq!(inspector.state(), DpiState::Passthrough);
        assert_eq!(inspector.sni(), Some("example.com"));
    }

    #[test]
    fn test_garbage_passthrough() {
        let engine = engine(|_| {});
        let mut inspector = engine.inspector(IP, None);
        let out = inspector.feed(b"\x00\x01garbage");
        assert_eq!(out, InspectOutcome::Forward(vec![Bytes::from_static(b"\x00\x01garbage")]));
        assert_eq!(inspector.state(), DpiState::Passthrough);
    }

    #[test]
    fn test_byte_budget() {
        let engine = engine(|c| c.inspect_byte_budget = 8);
        let hello = build_client_hello("blocked.test");
        let mut inspector = engine.inspector(IP, None);

        assert_eq!(inspector.feed(&hello[..6]), InspectOutcome::NeedMore);
        let out = inspector.feed(&hello[6..12]);
        assert_eq!(out, InspectOutcome::Forward(vec![Bytes::copy_from_slice(&hello[..12])]));
        assert_eq!(inspector.state(), DpiState::Passthrough);
    }

    #[test]
    fn test_disabled_engine() {
        let engine = engine(|c| c.enabled = false);
        let hello = build_client_hello("blocked.test");
        let mut inspector = engine.inspector(IP, None);
        assert_eq!(inspector.feed(&hello), InspectOutcome::Forward(vec![Bytes::from(hello)]));
        assert_eq!(inspector.state(), DpiState::Passthrough);
    }

    #[test]
    fn test_transform_error_falls_back() {
        let engine = engine(|c| c.fragment.padding = Some(u16::MAX));
        let hello = build_client_hello("blocked.test");
        let mut inspector = engine.inspector(IP, None);

        let out = inspector.feed(&hello);
        assert_eq!(out, InspectOutcome::Forward(vec![Bytes::from(hello)]));
        assert_eq!(inspector.state(), DpiState::Passthrough);
        assert_eq!(engine.stats.snapshot().transform_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_passthrough_skips_inspection() {
        let engine = engine(|_| {});
        let hello = build_client_hello("example.com");

        let mut first = engine.inspector(IP, Some("example.com"));
        first.feed(&hello);
        assert_eq!(first.state(), DpiState::Passthrough);

        let mut second = engine.inspector(IP, Some("example.com"));
        // a partial hello would normally need more bytes
        let out = second.feed(&hello[..10]);
        assert_eq!(out, InspectOutcome::Forward(vec![Bytes::copy_from_slice(&hello[..10])]));
        assert_eq!(second.state(), DpiState::Passthrough);
        assert_eq!(engine.stats.snapshot().decision_cache_hits, 1);
    }

    #[test]
    fn test_close() {
        let engine = engine(|_| {});
        let mut inspector = engine.inspector(IP, None);
        inspector.feed(&[0x16, 0x03]);
        inspector.close();
        assert_eq!(inspector.state(), DpiState::Closed);
        assert_eq!(inspector.feed(b"x"), InspectOutcome::Forward(Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inspect_stream_time_budget() {
        let engine = engine(|c| c.inspect_timeout_ms = 100);
        let hello = build_client_hello("blocked.test");
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut client, &hello[..10]).await.unwrap();

        let mut inspector = engine.inspector(IP, None);
        // client never sends the rest; the paused clock auto-advances
        let segments = inspector.inspect_stream(&mut server).await.unwrap();
        assert_eq!(concat(&segments), hello[..10]);
        assert_eq!(inspector.state(), DpiState::Passthrough);
        drop(client);
    }

    #[test]
    fn test_test_bypass_report() {
        let engine = engine(|_| {});
        let report = engine.test_bypass("Blocked.test");
        assert_eq!(report.state, DpiState::BypassApplied);
        assert!(report.segments.len() > 1);
        assert_eq!(report.segment_sizes.iter().sum::<usize>(), concat(&report.segments).len());
        assert!(engine.decisions().is_empty());

        let report = engine.test_bypass("example.com");
        assert_eq!(report.state, DpiState::Passthrough);
        assert_eq!(report.segments.len(), 1);
    }
}
