//! Routing rules
//!
//! [`RuleStore`] holds the prioritized rule set and publishes immutable
//! [`RuleSnapshot`]s; [`RuleSnapshot::evaluate`] is the classifier.

mod classifier;
mod geoip;
pub mod loader;
mod pattern;
mod store;
mod types;

pub use classifier::{Target, Verdict};
pub use geoip::GeoIpTable;
pub use loader::LoadReport;
pub use pattern::{canonical_host, domain_has_suffix, normalize_domain, Pattern};
pub use store::{CompiledRule, RoutingSettings, RuleOrigin, RuleSnapshot, RuleStore};
pub use types::{RouteAction, Rule, RuleKind};
