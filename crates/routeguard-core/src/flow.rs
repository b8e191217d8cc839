//! Per-connection bookkeeping
//!
//! A [`Flow`] owns no network resources; the transport layer owns the
//! socket and closes the flow when it goes away, either through
//! [`Flow::close`] or from another task through a [`FlowCloser`].
//! Everything running on behalf of the flow watches [`Flow::closed`] and
//! stops.

use crate::dpi::DpiState;
use crate::rules::{canonical_host, RouteAction};
use crate::stats::Stats;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique flow identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowId(u64);

impl FlowId {
    fn next() -> Self {
        Self(NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}

/// One client connection, accept to close
#[derive(Debug)]
pub struct Flow {
    id: FlowId,
    remote_addr: SocketAddr,
    domain: Option<String>,
    /// Destination given as an address literal instead of a name
    literal_ip: Option<IpAddr>,
    route: Option<RouteAction>,
    dpi_state: DpiState,
    created_at: Instant,
    close_tx: Arc<watch::Sender<bool>>,
    /// Set while the flow counts as live in these stats
    stats: Option<Arc<Stats>>,
}

impl Flow {
    /// Track a new connection to `remote_addr`, optionally for `domain`
    ///
    /// A `domain` that is an IP literal (`10.1.2.3`, `[::1]`) is taken as the
    /// destination address; the flow then has no domain.
    pub fn new(remote_addr: SocketAddr, domain: Option<String>) -> Self {
        let (close_tx, _) = watch::channel(false);
        let mut flow = Self {
            id: FlowId::next(),
            remote_addr,
            domain: None,
            literal_ip: None,
            route: None,
            dpi_state: DpiState::Init,
            created_at: Instant::now(),
            close_tx: Arc::new(close_tx),
            stats: None,
        };
        if let Some(domain) = domain {
            flow.learn_domain(&domain);
        }
        flow
    }

    /// Count this flow as live in `stats` until it closes or drops
    pub(crate) fn track(&mut self, stats: Arc<Stats>) {
        Stats::incr(&stats.flows_opened);
        self.stats = Some(stats);
    }

    /// Flow id
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Remote endpoint
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Domain or SNI, once known
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Address the flow is headed to: an IP-literal destination if one was
    /// given, otherwise the remote endpoint
    pub fn target_ip(&self) -> IpAddr {
        self.literal_ip.unwrap_or_else(|| self.remote_addr.ip())
    }

    /// Record a learned domain; an existing one is kept
    ///
    /// IP literals set the destination address instead.
    pub fn learn_domain(&mut self, domain: &str) {
        if self.domain.is_some() || self.literal_ip.is_some() {
            return;
        }
        let host = canonical_host(domain);
        match parse_ip_literal(&host) {
            Some(ip) => self.literal_ip = Some(ip),
            None if !host.is_empty() => self.domain = Some(host),
            None => {}
        }
    }

    /// Chosen route, once decided
    pub fn route(&self) -> Option<RouteAction> {
        self.route
    }

    pub(crate) fn set_route(&mut self, route: RouteAction) {
        self.route = Some(route);
    }

    /// DPI state; `Closed` once the flow is closed from anywhere
    pub fn dpi_state(&self) -> DpiState {
        if self.is_closed() {
            DpiState::Closed
        } else {
            self.dpi_state
        }
    }

    pub(crate) fn set_dpi_state(&mut self, state: DpiState) {
        self.dpi_state = state;
    }

    /// When the flow was accepted
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Signal that resolves once the flow is closed
    pub fn closed(&self) -> FlowClosed {
        FlowClosed(self.close_tx.subscribe())
    }

    /// Handle that closes the flow from another task
    pub fn closer(&self) -> FlowCloser {
        FlowCloser(Arc::clone(&self.close_tx))
    }

    /// Whether the flow has been closed
    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Close the flow; pending work observing [`closed`](Self::closed) stops
    ///
    /// Returns `true` the first time the flow stops counting as live.
    pub fn close(&mut self) -> bool {
        self.dpi_state = DpiState::Closed;
        self.close_tx.send_replace(true);
        self.untrack()
    }

    fn untrack(&mut self) -> bool {
        match self.stats.take() {
            Some(stats) => {
                Stats::incr(&stats.flows_closed);
                true
            }
            None => false,
        }
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.close_tx.send_replace(true);
        self.untrack();
    }
}

fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse().ok()
}

/// Closes a [`Flow`] from outside the task driving it
#[derive(Debug, Clone)]
pub struct FlowCloser(Arc<watch::Sender<bool>>);

impl FlowCloser {
    /// Close the flow; work waiting on [`Flow::closed`] stops
    pub fn close(&self) {
        self.0.send_replace(true);
    }

    /// Whether the flow has been closed
    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

/// Close notification for one flow
#[derive(Debug, Clone)]
pub struct FlowClosed(watch::Receiver<bool>);

impl FlowClosed {
    /// Wait until the flow closes
    ///
    /// Also returns once the flow and every [`FlowCloser`] are dropped.
    pub async fn wait(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}
