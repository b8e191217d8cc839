//! Caching DNS resolver
//!
//! ## Resolution order
//!
//! 1. Ad-block veto (synthesized empty answer, upstream never contacted)
//! 2. Cache lookup
//! 3. Attach to an identical in-flight query
//! 4. Upstream query, primary then bootstrap, bounded attempts
//!
//! Only A and AAAA lookups are supported. [`DnsServer`] answers LAN
//! clients through the same resolver.

mod cache;
mod resolver;
mod server;
mod upstream;

pub use cache::{CacheKey, DnsCache};
pub use hickory_proto::rr::RecordType;
pub use resolver::{Lookup, Resolver, ResolverOptions, Source};
pub use server::{answer_query, DnsServer};
pub use upstream::{UdpUpstream, Upstream};

#[cfg(test)]
pub use upstream::MockUpstream;

use crate::error::DnsError;
use serde::Serialize;
use std::net::IpAddr;

/// Outcome class of an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerKind {
    /// Addresses present
    Positive,
    /// Name exists, no records of this type
    NoData,
    /// Name does not exist
    NxDomain,
    /// Synthesized for an ad-block veto
    Blocked,
}

/// A resolved answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    /// Addresses in upstream order
    pub addrs: Vec<IpAddr>,
    /// TTL in seconds (clamped once cached)
    pub ttl_secs: u32,
    /// Outcome class
    pub kind: AnswerKind,
}

impl Answer {
    /// Positive answer; an empty address list becomes `NoData`
    pub fn positive(addrs: Vec<IpAddr>, ttl_secs: u32) -> Self {
        let kind = if addrs.is_empty() {
            AnswerKind::NoData
        } else {
            AnswerKind::Positive
        };
        Self {
            addrs,
            ttl_secs,
            kind,
        }
    }

    /// NXDOMAIN answer
    pub fn nxdomain(ttl_secs: u32) -> Self {
        Self {
            addrs: Vec::new(),
            ttl_secs,
            kind: AnswerKind::NxDomain,
        }
    }

    /// Empty answer standing in for an ad-block veto
    pub fn blocked() -> Self {
        Self {
            addrs: Vec::new(),
            ttl_secs: 0,
            kind: AnswerKind::Blocked,
        }
    }

    /// Whether this answer carries no addresses
    pub fn is_negative(&self) -> bool {
        self.kind != AnswerKind::Positive
    }

    /// First address, if any
    pub fn first(&self) -> Option<IpAddr> {
        self.addrs.first().copied()
    }
}

/// Reject record types the resolver does not handle
pub fn check_record_type(rtype: RecordType) -> Result<(), DnsError> {
    match rtype {
        RecordType::A | RecordType::AAAA => Ok(()),
        other => Err(DnsError::UnsupportedRecordType(other.to_string())),
    }
}
