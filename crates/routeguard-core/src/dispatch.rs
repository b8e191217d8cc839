//! Per-flow orchestration
//!
//! filter → resolve → classify → inspect/transform → forward.
//!
//! Each collaborator is used and released on its own: the dispatcher never
//! holds a rule snapshot across a DNS or inspection await.

use crate::adblock::AdBlockFilter;
use crate::dns::{RecordType, Resolver, Source};
use crate::dpi::{DpiEngine, DpiState};
use crate::error::DnsError;
use crate::flow::Flow;
use crate::rules::{RouteAction, RuleStore, Target, Verdict};
use crate::stats::Stats;
use crate::tunnel::{TunnelPath, VpnTunnel};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Where a flow's bytes go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardPath {
    /// Straight out the default interface
    Direct,
    /// Through the active VPN tunnel
    Tunnel(TunnelPath),
    /// Close the connection
    Terminate,
}

/// Routing outcome for one flow
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Final action after any fallback
    pub action: RouteAction,
    /// Forwarding path for `action`
    pub path: ForwardPath,
    /// Classifier verdict that produced the action
    pub verdict: Verdict,
    /// Address the domain resolved to, if resolution ran and succeeded
    pub resolved: Option<IpAddr>,
    /// Resolution failure that forced the default route
    pub resolve_error: Option<DnsError>,
    /// The verdict said `vpn` but no tunnel was up
    pub vpn_fallback: bool,
}

impl RouteDecision {
    fn terminate(verdict: Verdict) -> Self {
        Self {
            action: RouteAction::Block,
            path: ForwardPath::Terminate,
            verdict,
            resolved: None,
            resolve_error: None,
            vpn_fallback: false,
        }
    }

    /// Whether the flow is to be closed
    pub fn is_terminated(&self) -> bool {
        self.path == ForwardPath::Terminate
    }
}

/// What the transport layer should do with an accepted flow
#[derive(Debug, Clone)]
pub struct FlowPlan {
    /// Routing outcome
    pub decision: RouteDecision,
    /// First flight to write upstream, possibly transformed; empty when
    /// terminated
    pub first_flight: Vec<Bytes>,
}

/// Routes flows using the rule store, resolver, DPI engine and tunnel
pub struct RouteDispatcher {
    rules: Arc<RuleStore>,
    adblock: Arc<AdBlockFilter>,
    resolver: Arc<Resolver>,
    dpi: Arc<DpiEngine>,
    tunnel: Arc<dyn VpnTunnel>,
    stats: Arc<Stats>,
    resolve_budget: Duration,
}

impl RouteDispatcher {
    /// Wire a dispatcher from its collaborators
    pub fn new(
        rules: Arc<RuleStore>,
        adblock: Arc<AdBlockFilter>,
        resolver: Arc<Resolver>,
        dpi: Arc<DpiEngine>,
        tunnel: Arc<dyn VpnTunnel>,
        stats: Arc<Stats>,
        resolve_budget: Duration,
    ) -> Self {
        Self {
            rules,
            adblock,
            resolver,
            dpi,
            tunnel,
            stats,
            resolve_budget,
        }
    }

    /// Start tracking an accepted connection
    ///
    /// `domain` may be an IP literal; the flow is then classified by that
    /// address without any DNS query.
    pub fn open_flow(&self, remote_addr: SocketAddr, domain: Option<&str>) -> Flow {
        let mut flow = Flow::new(remote_addr, domain.map(str::to_string));
        flow.track(Arc::clone(&self.stats));
        debug!(
            flow = %flow.id(),
            remote = %remote_addr,
            domain = ?flow.domain(),
            target = %flow.target_ip(),
            "Flow opened"
        );
        flow
    }

    /// Close a flow; work waiting on it is cancelled
    ///
    /// Flows closed through a [`FlowCloser`](crate::flow::FlowCloser) or
    /// simply dropped are released as well.
    pub fn close_flow(&self, flow: &mut Flow) {
        if flow.close() {
            debug!(flow = %flow.id(), "Flow closed");
        }
    }

    /// Decide the route for `flow`
    ///
    /// A block decided by the domain alone (ad-block or a matching `block`
    /// rule) terminates the flow before any DNS query. Otherwise the domain
    /// is resolved and the classifier sees both name and address; a
    /// resolution error falls back to the default route.
    ///
    /// A flow whose destination is an IP literal has no domain and is
    /// classified by that address alone.
    ///
    /// Returns `None` if the flow closed before a decision was reached.
    #[instrument(skip(self, flow), fields(flow = %flow.id(), domain = ?flow.domain()))]
    pub async fn route_flow(&self, flow: &mut Flow) -> Option<RouteDecision> {
        if flow.is_closed() {
            return None;
        }
        let domain = flow.domain().map(str::to_string);

        if let Some(domain) = domain.as_deref() {
            if self.adblock.is_blocked(domain) {
                Stats::incr(&self.stats.adblock_vetoes);
                let verdict = Verdict::default_route(RouteAction::Block);
                return Some(self.finish(flow, RouteDecision::terminate(verdict)));
            }
            let by_name = self.rules.evaluate(&Target::domain(domain));
            if by_name.is_match() && by_name.action == RouteAction::Block {
                return Some(self.finish(flow, RouteDecision::terminate(by_name)));
            }
        }

        let (resolved, resolve_error) = match domain.as_deref() {
            Some(domain) => {
                let mut closed = flow.closed();
                let deadline = Instant::now() + self.resolve_budget;
                let lookup = tokio::select! {
                    biased;
                    () = closed.wait() => {
                        debug!("Flow closed during resolution");
                        return None;
                    }
                    result = self.resolver.resolve(domain, RecordType::A, deadline) => result,
                };
                match lookup {
                    Ok(lookup) if lookup.source == Source::Blocked => {
                        // block list reloaded between the check above and the lookup
                        return Some(self.finish(
                            flow,
                            RouteDecision::terminate(Verdict::default_route(RouteAction::Block)),
                        ));
                    }
                    Ok(lookup) => (lookup.answer.first(), None),
                    Err(e) => (None, Some(e)),
                }
            }
            None => (None, None),
        };

        let snapshot = self.rules.snapshot();
        let default_route = snapshot.settings().default_route;
        let verdict = if resolve_error.is_some() {
            Verdict::default_route(default_route)
        } else {
            let target = match domain.as_deref() {
                Some(domain) => Target::domain(domain).with_ip(resolved),
                None => Target::ip(flow.target_ip()),
            };
            snapshot.evaluate(&target)
        };
        drop(snapshot);

        if let Some(e) = &resolve_error {
            warn!(error = %e, route = %default_route, "Resolution failed, using default route");
        }

        let mut decision = RouteDecision {
            action: verdict.action,
            path: ForwardPath::Direct,
            verdict,
            resolved,
            resolve_error,
            vpn_fallback: false,
        };

        match decision.action {
            RouteAction::Block => decision.path = ForwardPath::Terminate,
            RouteAction::Direct => decision.path = ForwardPath::Direct,
            RouteAction::Vpn => match self.tunnel.active_path() {
                Some(path) if self.tunnel.is_connected() => decision.path = ForwardPath::Tunnel(path),
                _ => {
                    Stats::incr(&self.stats.vpn_fallbacks);
                    decision.vpn_fallback = true;
                    // a vpn default route cannot be honored either
                    decision.action = match default_route {
                        RouteAction::Vpn => RouteAction::Direct,
                        other => other,
                    };
                    decision.path = match decision.action {
                        RouteAction::Block => ForwardPath::Terminate,
                        _ => ForwardPath::Direct,
                    };
                    warn!(route = %decision.action, "No VPN tunnel connected, falling back");
                }
            },
        }

        Some(self.finish(flow, decision))
    }

    /// Route a flow and prepare its first flight from `client`
    ///
    /// A flow opened without a domain is inspected first so the SNI can
    /// drive classification. Inspection is bounded by the DPI budgets and
    /// cancelled when the flow closes; `None` means it closed first.
    #[instrument(skip(self, flow, client), fields(flow = %flow.id()))]
    pub async fn handle_flow<R>(
        &self,
        flow: &mut Flow,
        client: &mut R,
    ) -> std::io::Result<Option<FlowPlan>>
    where
        R: AsyncRead + Unpin,
    {
        let mut inspector = self.dpi.inspector(flow.remote_addr().ip(), flow.domain());
        let mut first_flight = None;

        if flow.domain().is_none() {
            let mut closed = flow.closed();
            let segments = tokio::select! {
                biased;
                () = closed.wait() => return Ok(None),
                result = inspector.inspect_stream(client) => result?,
            };
            if let Some(sni) = inspector.sni() {
                flow.learn_domain(sni);
            }
            flow.set_dpi_state(inspector.state());
            first_flight = Some(segments);
        }

        let Some(decision) = self.route_flow(flow).await else {
            return Ok(None);
        };

        if decision.is_terminated() {
            inspector.close();
            flow.set_dpi_state(DpiState::Closed);
            return Ok(Some(FlowPlan {
                decision,
                first_flight: Vec::new(),
            }));
        }

        let first_flight = match first_flight {
            Some(segments) => segments,
            None => {
                let mut closed = flow.closed();
                tokio::select! {
                    biased;
                    () = closed.wait() => return Ok(None),
                    result = inspector.inspect_stream(client) => result?,
                }
            }
        };
        flow.set_dpi_state(inspector.state());

        Ok(Some(FlowPlan {
            decision,
            first_flight,
        }))
    }

    fn finish(&self, flow: &mut Flow, decision: RouteDecision) -> RouteDecision {
        flow.set_route(decision.action);
        self.stats.record_route(decision.action);
        info!(
            flow = %flow.id(),
            domain = ?flow.domain(),
            action = %decision.action,
            rule = ?decision.verdict.rule_id,
            "Flow routed"
        );
        decision
    }
}

impl std::fmt::Debug for RouteDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDispatcher")
            .field("rules", &self.rules.len())
            .field("tunnel_connected", &self.tunnel.is_connected())
            .field("resolve_budget", &self.resolve_budget)
            .finish()
    }
}
