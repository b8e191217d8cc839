//! Configuration management for RouteGuard
//!
//! Strongly-typed configuration with TOML support. Every section falls back
//! to its defaults, so a partial file is a valid file.

use crate::error::{Error, Result};
use crate::rules::RouteAction;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General application settings
    pub general: GeneralConfig,

    /// Routing engine settings
    pub routing: RoutingConfig,

    /// DNS resolver and cache settings
    pub dns: DnsConfig,

    /// DPI bypass settings
    pub dpi: DpiConfig,

    /// VPN tunnel collaborator settings
    pub vpn: VpnConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.routing.default_route == RouteAction::Block {
            return Err(Error::config_value(
                "routing.default_route",
                "Must be 'direct' or 'vpn'",
            ));
        }

        if self.dns.max_attempts == 0 {
            return Err(Error::config_value("dns.max_attempts", "Must be at least 1"));
        }
        if self.dns.timeout_ms == 0 {
            return Err(Error::config_value("dns.timeout_ms", "Must be non-zero"));
        }
        if self.dns.min_ttl_secs > self.dns.max_ttl_secs {
            return Err(Error::config_value(
                "dns.min_ttl_secs",
                format!(
                    "Floor {} exceeds ceiling {}",
                    self.dns.min_ttl_secs, self.dns.max_ttl_secs
                ),
            ));
        }
        if self.dns.sweep_interval_secs == 0 {
            return Err(Error::config_value("dns.sweep_interval_secs", "Must be non-zero"));
        }

        // A TLS record header is 5 bytes; anything smaller can never classify
        if self.dpi.inspect_byte_budget < 5 {
            return Err(Error::config_value(
                "dpi.inspect_byte_budget",
                "Must be at least 5 bytes",
            ));
        }
        if self.dpi.inspect_timeout_ms == 0 {
            return Err(Error::config_value("dpi.inspect_timeout_ms", "Must be non-zero"));
        }
        if self.dpi.fragment.segment_size == 0 {
            return Err(Error::config_value("dpi.fragment.segment_size", "Must be non-zero"));
        }
        if self.dpi.sweep_interval_secs == 0 {
            return Err(Error::config_value("dpi.sweep_interval_secs", "Must be non-zero"));
        }

        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Instance name
    pub name: String,
    /// Configuration version
    pub version: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "routeguard".to_string(),
            version: "1.0".to_string(),
        }
    }
}

/// Which pattern kinds the classifier consults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Domain patterns only
    Domain,
    /// GeoIP patterns only
    Geoip,
    /// CIDR patterns only
    Cidr,
    /// Every pattern kind
    #[default]
    Mixed,
}

/// Routing engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Enable rule evaluation (disabled = everything takes the default route)
    pub enabled: bool,
    /// Pattern kinds consulted during evaluation
    pub mode: RoutingMode,
    /// Route for flows no rule matches (`direct` or `vpn`)
    pub default_route: RouteAction,
    /// Directory holding `*.toml` ruleset files
    pub rulesets_dir: Option<PathBuf>,
    /// GeoIP table (`CIDR,CC` per line)
    pub geoip_file: Option<PathBuf>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: RoutingMode::Mixed,
            default_route: RouteAction::Direct,
            rulesets_dir: None,
            geoip_file: None,
        }
    }
}

/// DNS resolver and cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Primary upstream resolver
    pub upstream: SocketAddr,
    /// Fallback resolver used when the primary is unreachable
    pub bootstrap: Option<SocketAddr>,
    /// Per-resolution deadline in milliseconds
    pub timeout_ms: u64,
    /// Attempts across primary and bootstrap combined
    pub max_attempts: u32,
    /// TTL floor applied before caching
    pub min_ttl_secs: u32,
    /// TTL ceiling applied before caching
    pub max_ttl_secs: u32,
    /// TTL for NXDOMAIN answers (still clamped)
    pub negative_ttl_secs: u32,
    /// Expired-entry sweep interval
    pub sweep_interval_secs: u64,
    /// Soft cap on cached entries (0 = unbounded)
    pub max_entries: usize,
    /// Answer LAN clients' DNS queries on `listen`
    pub enabled: bool,
    /// Listen address of the DNS frontend
    pub listen: SocketAddr,
    /// Ad-block settings
    pub adblock: AdBlockConfig,
}

impl DnsConfig {
    /// Deadline budget for one resolution
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            upstream: SocketAddr::from(([1, 1, 1, 1], 53)),
            bootstrap: Some(SocketAddr::from(([8, 8, 8, 8], 53))),
            timeout_ms: 3000,
            max_attempts: 2,
            min_ttl_secs: 30,
            max_ttl_secs: 86_400,
            negative_ttl_secs: 60,
            sweep_interval_secs: 60,
            max_entries: 50_000,
            enabled: false,
            listen: SocketAddr::from(([0, 0, 0, 0], 53)),
            adblock: AdBlockConfig::default(),
        }
    }
}

/// Ad-block configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdBlockConfig {
    /// Enable ad-block vetoes
    pub enabled: bool,
    /// Block list files (plain, hosts or adblock syntax)
    pub lists: Vec<PathBuf>,
    /// Domains never blocked (suffix match)
    pub allow: Vec<String>,
}

/// DPI bypass selection mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DpiMode {
    /// Manual list plus keyword heuristics
    #[default]
    Auto,
    /// Manual list only
    Manual,
}

/// DPI bypass configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DpiConfig {
    /// Enable DPI bypass
    pub enabled: bool,
    /// Selection mode
    pub mode: DpiMode,
    /// Domains that always get the transform (suffix match)
    pub bypass_domains: Vec<String>,
    /// SNI substrings that trigger the transform in auto mode
    /// (empty = built-in list)
    pub auto_keywords: Vec<String>,
    /// Maximum bytes buffered while looking for a ClientHello
    pub inspect_byte_budget: usize,
    /// Maximum wait for a complete ClientHello in milliseconds
    pub inspect_timeout_ms: u64,
    /// Lifetime of a cached (remote IP, SNI) decision
    pub decision_ttl_secs: u64,
    /// Decision-cache sweep interval
    pub sweep_interval_secs: u64,
    /// Transform settings
    pub fragment: FragmentConfig,
}

impl DpiConfig {
    /// Inspection time budget
    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_millis(self.inspect_timeout_ms)
    }

    /// Decision cache TTL
    pub fn decision_ttl(&self) -> Duration {
        Duration::from_secs(self.decision_ttl_secs)
    }
}

impl Default for DpiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: DpiMode::Auto,
            bypass_domains: Vec::new(),
            auto_keywords: Vec::new(),
            inspect_byte_budget: 16 * 1024,
            inspect_timeout_ms: 2000,
            decision_ttl_secs: 300,
            sweep_interval_secs: 30,
            fragment: FragmentConfig::default(),
        }
    }
}

/// ClientHello transform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    /// Size of each emitted segment
    pub segment_size: usize,
    /// Put the first segment boundary inside the SNI hostname
    pub split_at_sni: bool,
    /// Re-frame the handshake as multiple TLS records before segmenting
    pub split_records: bool,
    /// Pad the ClientHello to this many bytes with a padding extension
    pub padding: Option<u16>,
    /// Randomize each segment length within `1..=segment_size`
    pub jitter: bool,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            segment_size: 64,
            split_at_sni: true,
            split_records: true,
            padding: None,
            jitter: false,
        }
    }
}

/// VPN collaborator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    /// Tunnel interface to report as active at startup
    pub interface: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path (None = stdout only)
    pub file: Option<String>,
    /// Enable JSON format logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json_format: false,
        }
    }
}
