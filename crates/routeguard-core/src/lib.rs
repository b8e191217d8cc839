//! # RouteGuard Core
//!
//! Platform-independent routing decision engine for a local network gateway.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Rules** - prioritized, hot-swappable rule set with snapshot reads
//! - **Ad-block** - domain veto applied before resolution and routing
//! - **DNS** - caching, coalescing resolver with bootstrap fallback
//! - **DPI** - per-flow ClientHello inspection and fragmentation
//! - **Dispatch** - filter, resolve, classify, transform, forward
//!
//! ## Example
//!
//! ```rust,no_run
//! use routeguard_core::{Config, RoutingEngine, Rule, RuleKind, RouteAction, TunnelStatus};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("routeguard.toml")?;
//! let tunnel = Arc::new(TunnelStatus::new());
//! let engine = RoutingEngine::from_config(config, tunnel.clone())?;
//!
//! engine.add_rule(Rule::new("streaming", RuleKind::Domain, ["netflix.com"], RouteAction::Vpn))?;
//!
//! let dispatcher = engine.dispatcher();
//! let mut flow = dispatcher.open_flow("203.0.113.5:443".parse()?, Some("www.netflix.com"));
//! if let Some(decision) = dispatcher.route_flow(&mut flow).await {
//!     println!("{} via {:?}", decision.action, decision.path);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod adblock;
pub mod config;
pub mod dispatch;
pub mod dns;
pub mod dpi;
pub mod engine;
pub mod error;
pub mod flow;
pub mod rules;
pub mod stats;
pub mod tunnel;

// Re-exports for convenience
pub use adblock::{AdBlockFilter, BlockList};
pub use config::Config;
pub use dispatch::{FlowPlan, ForwardPath, RouteDecision, RouteDispatcher};
pub use dns::{Answer, AnswerKind, DnsCache, DnsServer, Lookup, RecordType, Resolver, Source};
pub use dpi::{BypassDecision, BypassReport, DpiEngine, DpiState, FlowInspector};
pub use engine::{Maintenance, RoutingEngine};
pub use error::{DnsError, Error, Result};
pub use flow::{Flow, FlowCloser, FlowId};
pub use rules::{LoadReport, RouteAction, Rule, RuleKind, RuleStore, Target, Verdict};
pub use stats::{Stats, StatsSnapshot};
pub use tunnel::{TunnelPath, TunnelStatus, VpnTunnel};
