//! Pattern compilation and matching
//!
//! Patterns are validated once, when a rule is stored. Evaluation only ever
//! sees compiled patterns, so a malformed pattern can never surface as an
//! evaluation error.

use super::geoip::GeoIpTable;
use super::types::RuleKind;
use crate::error::{Error, Result};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// A compiled rule pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Normalized domain suffix (`example.com` matches `a.example.com`)
    Domain(String),
    /// Network prefix (a bare address becomes a host prefix)
    Cidr(IpNet),
    /// Uppercase ISO 3166 alpha-2 country code
    Country(String),
}

impl Pattern {
    /// Parse a raw pattern for a rule of the given kind
    ///
    /// `mixed` rules accept `domain:`, `cidr:` and `geoip:` prefixes; an
    /// unprefixed pattern is a CIDR if it parses as one, else a domain.
    pub fn parse(kind: RuleKind, raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        match kind {
            RuleKind::Domain => parse_domain(trimmed),
            RuleKind::Cidr => parse_cidr(trimmed),
            RuleKind::Geoip => parse_country(trimmed.strip_prefix("geoip:").unwrap_or(trimmed)),
            RuleKind::Mixed => {
                if let Some(rest) = trimmed.strip_prefix("geoip:") {
                    parse_country(rest)
                } else if let Some(rest) = trimmed.strip_prefix("cidr:") {
                    parse_cidr(rest)
                } else if let Some(rest) = trimmed.strip_prefix("domain:") {
                    parse_domain(rest)
                } else if looks_like_network(trimmed) {
                    parse_cidr(trimmed)
                } else {
                    parse_domain(trimmed)
                }
            }
        }
    }

    /// Kind this pattern matches on (never `Mixed`)
    pub const fn kind(&self) -> RuleKind {
        match self {
            Self::Domain(_) => RuleKind::Domain,
            Self::Cidr(_) => RuleKind::Cidr,
            Self::Country(_) => RuleKind::Geoip,
        }
    }

    /// Tie-break weight among rules of equal priority
    ///
    /// Domain: label count. CIDR: prefix length. Country: 0.
    pub fn specificity(&self) -> u32 {
        match self {
            Self::Domain(d) => u32::try_from(d.split('.').count()).unwrap_or(u32::MAX),
            Self::Cidr(net) => u32::from(net.prefix_len()),
            Self::Country(_) => 0,
        }
    }

    /// Match against a normalized domain and/or IP
    pub fn matches(&self, domain: Option<&str>, ip: Option<IpAddr>, geoip: &GeoIpTable) -> bool {
        match self {
            Self::Domain(suffix) => domain.is_some_and(|d| domain_has_suffix(d, suffix)),
            Self::Cidr(net) => ip.is_some_and(|ip| net.contains(&ip)),
            Self::Country(code) => ip
                .and_then(|ip| geoip.lookup(ip))
                .is_some_and(|cc| cc == code),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(d) => f.write_str(d),
            Self::Cidr(net) => write!(f, "{net}"),
            Self::Country(cc) => write!(f, "geoip:{cc}"),
        }
    }
}

/// Reverse-label suffix test on already normalized names
///
/// `example.com` is a suffix of `example.com` and `a.example.com` but not of
/// `notexample.com`.
pub fn domain_has_suffix(domain: &str, suffix: &str) -> bool {
    if domain.len() == suffix.len() {
        return domain == suffix;
    }
    domain.len() > suffix.len()
        && domain.ends_with(suffix)
        && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.'
}

/// Lowercase a hostname and drop a trailing root dot
pub fn canonical_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Normalize and validate a domain pattern
///
/// Strips `*.`/`.` wildcard prefixes, since every domain pattern already
/// matches its subdomains.
pub fn normalize_domain(raw: &str) -> Result<String> {
    let lowered = canonical_host(raw);
    let name = lowered
        .strip_prefix("*.")
        .or_else(|| lowered.strip_prefix('.'))
        .unwrap_or(&lowered);

    if name.is_empty() {
        return Err(Error::invalid_pattern(raw, "empty domain"));
    }
    if name.len() > MAX_DOMAIN_LEN {
        return Err(Error::invalid_pattern(raw, "domain longer than 253 bytes"));
    }
    if name.parse::<IpAddr>().is_ok() {
        return Err(Error::invalid_pattern(raw, "IP address in a domain pattern"));
    }
    for label in name.split('.') {
        if label.is_empty() {
            return Err(Error::invalid_pattern(raw, "empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(Error::invalid_pattern(raw, "label longer than 63 bytes"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::invalid_pattern(raw, "label starts or ends with '-'"));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(Error::invalid_pattern(raw, "invalid character"));
        }
    }
    Ok(name.to_string())
}

fn parse_domain(raw: &str) -> Result<Pattern> {
    normalize_domain(raw).map(Pattern::Domain)
}

fn parse_cidr(raw: &str) -> Result<Pattern> {
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(Pattern::Cidr(net.trunc()));
    }
    let ip: IpAddr = raw
        .parse()
        .map_err(|_| Error::invalid_pattern(raw, "not a CIDR or IP address"))?;
    let host_len = if ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(ip, host_len)
        .map(Pattern::Cidr)
        .map_err(|e| Error::invalid_pattern(raw, e.to_string()))
}

fn parse_country(raw: &str) -> Result<Pattern> {
    let code = raw.trim();
    if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(Error::invalid_pattern(raw, "country code must be two letters"));
    }
    Ok(Pattern::Country(code.to_ascii_uppercase()))
}

fn looks_like_network(raw: &str) -> bool {
    raw.contains('/') || raw.contains(':') || raw.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_match() {
        assert!(domain_has_suffix("example.com", "example.com"));
        assert!(domain_has_suffix("a.example.com", "example.com"));
        assert!(domain_has_suffix("deep.a.example.com", "example.com"));
        assert!(!domain_has_suffix("notexample.com", "example.com"));
        assert!(!domain_has_suffix("com", "example.com"));
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("Example.COM.").unwrap(), "example.com");
        assert_eq!(normalize_domain("*.example.com").unwrap(), "example.com");
        assert_eq!(normalize_domain(".example.com").unwrap(), "example.com");
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("a..b").is_err());
        assert!(normalize_domain("-bad.com").is_err());
        assert!(normalize_domain("sp ace.com").is_err());
        assert!(normalize_domain("1.2.3.4").is_err());
        assert!(normalize_domain(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_parse_cidr() {
        let p = Pattern::parse(RuleKind::Cidr, "10.1.2.3/8").unwrap();
        assert_eq!(p, Pattern::Cidr("10.0.0.0/8".parse().unwrap()));
        assert_eq!(p.specificity(), 8);

        let host = Pattern::parse(RuleKind::Cidr, "192.168.1.1").unwrap();
        assert_eq!(host.specificity(), 32);

        let v6 = Pattern::parse(RuleKind::Cidr, "2001:db8::/32").unwrap();
        assert_eq!(v6.specificity(), 32);

        assert!(Pattern::parse(RuleKind::Cidr, "10.0.0.0/33").is_err());
        assert!(Pattern::parse(RuleKind::Cidr, "example.com").is_err());
    }

    #[test]
    fn test_parse_country() {
        assert_eq!(
            Pattern::parse(RuleKind::Geoip, "ru").unwrap(),
            Pattern::Country("RU".into())
        );
        assert_eq!(
            Pattern::parse(RuleKind::Geoip, "geoip:CN").unwrap(),
            Pattern::Country("CN".into())
        );
        assert!(Pattern::parse(RuleKind::Geoip, "RUS").is_err());
        assert!(Pattern::parse(RuleKind::Geoip, "1A").is_err());
    }

    #[test]
    fn test_parse_mixed() {
        assert_eq!(
            Pattern::parse(RuleKind::Mixed, "geoip:ir").unwrap().kind(),
            RuleKind::Geoip
        );
        assert_eq!(
            Pattern::parse(RuleKind::Mixed, "10.0.0.0/8").unwrap().kind(),
            RuleKind::Cidr
        );
        assert_eq!(
            Pattern::parse(RuleKind::Mixed, "::1").unwrap().kind(),
            RuleKind::Cidr
        );
        assert_eq!(
            Pattern::parse(RuleKind::Mixed, "example.com").unwrap().kind(),
            RuleKind::Domain
        );
        assert_eq!(
            Pattern::parse(RuleKind::Mixed, "domain:example.com").unwrap().kind(),
            RuleKind::Domain
        );
    }

    #[test]
    fn test_domain_specificity() {
        let p = Pattern::parse(RuleKind::Domain, "ads.example.com").unwrap();
        assert_eq!(p.specificity(), 3);
    }

    #[test]
    fn test_matches() {
        let geoip = GeoIpTable::from_entries([("5.0.0.0/8".parse().unwrap(), "RU".to_string())]);
        let ip: IpAddr = "5.1.2.3".parse().unwrap();

        let domain = Pattern::parse(RuleKind::Domain, "example.com").unwrap();
        assert!(domain.matches(Some("www.example.com"), None, &geoip));
        assert!(!domain.matches(None, Some(ip), &geoip));

        let cidr = Pattern::parse(RuleKind::Cidr, "5.0.0.0/16").unwrap();
        assert!(cidr.matches(None, Some(ip), &geoip));
        assert!(!cidr.matches(Some("example.com"), None, &geoip));

        let country = Pattern::parse(RuleKind::Geoip, "RU").unwrap();
        assert!(country.matches(None, Some(ip), &geoip));
        assert!(!country.matches(None, Some("8.8.8.8".parse().unwrap()), &geoip));
    }
}
