//! Error types for routeguard-core
//!
//! Centralized error handling using `thiserror` for ergonomic error definitions.
//!
//! Only configuration errors (rejected at mutation time) and resolution
//! errors reach callers. Ruleset load failures and DPI transform failures
//! are logged and degraded locally.

use std::time::Duration;
use thiserror::Error;

/// Main error type for routeguard-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// A rule field holds a value outside its enum
    #[error("Invalid rule field '{field}': '{value}'")]
    InvalidRuleField {
        /// Field name (kind, action)
        field: &'static str,
        /// Offending value
        value: String,
    },

    /// A rule pattern failed validation
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// A rule was submitted without patterns
    #[error("Rule '{id}' has no patterns")]
    EmptyPatterns {
        /// Rule id
        id: String,
    },

    /// A rule with this id is already stored
    #[error("Rule '{id}' already exists")]
    DuplicateRule {
        /// Rule id
        id: String,
    },

    /// No rule with this id is stored
    #[error("Rule '{id}' not found")]
    UnknownRule {
        /// Rule id
        id: String,
    },

    /// A ruleset file could not be read or parsed
    #[error("Ruleset file error for '{path}': {message}")]
    RulesetLoad {
        /// Path to the ruleset file
        path: String,
        /// Error message
        message: String,
    },

    /// A block list or GeoIP source could not be read
    #[error("List file error for '{path}': {message}")]
    ListLoad {
        /// Path to the list file
        path: String,
        /// Error message
        message: String,
    },

    /// DNS resolution failed
    #[error(transparent)]
    Resolution(#[from] DnsError),

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an invalid pattern error
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Create a ruleset load error
    pub fn ruleset_load(path: impl Into<String>, message: impl ToString) -> Self {
        Self::RulesetLoad {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create a list load error
    pub fn list_load(path: impl Into<String>, message: impl ToString) -> Self {
        Self::ListLoad {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error was raised while validating a mutation
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigValue { .. }
                | Self::InvalidRuleField { .. }
                | Self::InvalidPattern { .. }
                | Self::EmptyPatterns { .. }
                | Self::DuplicateRule { .. }
                | Self::UnknownRule { .. }
        )
    }
}

/// Resolution failure surfaced by the resolver
///
/// Cloneable so a single upstream failure can be handed to every coalesced
/// waiter of the same query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// The deadline passed before an answer arrived
    #[error("DNS resolution for '{domain}' timed out after {elapsed:?}")]
    Timeout {
        /// Queried domain
        domain: String,
        /// Time spent before giving up
        elapsed: Duration,
    },

    /// Every attempt against primary and bootstrap failed
    #[error("DNS upstream unreachable for '{domain}' after {attempts} attempt(s): {reason}")]
    Unreachable {
        /// Queried domain
        domain: String,
        /// Attempts made
        attempts: u32,
        /// Last failure reason
        reason: String,
    },

    /// The upstream answered with something we cannot use
    #[error("Malformed DNS response from {upstream}: {reason}")]
    Malformed {
        /// Upstream that answered
        upstream: String,
        /// What was wrong
        reason: String,
    },

    /// The upstream refused or failed the query (SERVFAIL, REFUSED, ...)
    #[error("DNS upstream {upstream} returned {code}")]
    ServerFailure {
        /// Upstream that answered
        upstream: String,
        /// Response code name
        code: String,
    },

    /// The domain cannot be turned into a DNS name
    #[error("Invalid domain name '{0}'")]
    InvalidName(String),

    /// Only address records are resolved
    #[error("Unsupported record type {0}")]
    UnsupportedRecordType(String),

    /// Transport-level failure talking to one upstream
    #[error("DNS transport error via {upstream}: {reason}")]
    Transport {
        /// Upstream address
        upstream: String,
        /// I/O failure
        reason: String,
    },

    /// The owning flow went away before resolution finished
    #[error("DNS resolution for '{0}' cancelled")]
    Cancelled(String),
}

impl DnsError {
    /// Create a transport error
    pub fn transport(upstream: impl ToString, reason: impl ToString) -> Self {
        Self::Transport {
            upstream: upstream.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a malformed-response error
    pub fn malformed(upstream: impl ToString, reason: impl Into<String>) -> Self {
        Self::Malformed {
            upstream: upstream.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether another upstream might do better
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::ServerFailure { .. } | Self::Malformed { .. }
        )
    }
}
