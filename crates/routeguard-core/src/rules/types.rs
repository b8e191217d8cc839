//! Rule data model

use super::pattern::Pattern;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pattern family a rule matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Reverse-label suffix match on domain names
    Domain,
    /// Country code of the target IP
    Geoip,
    /// Longest-prefix containment of the target IP
    Cidr,
    /// Any of the above, decided per pattern
    Mixed,
}

impl RuleKind {
    /// Lowercase name as used in ruleset files
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Geoip => "geoip",
            Self::Cidr => "cidr",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "domain" => Ok(Self::Domain),
            "geoip" => Ok(Self::Geoip),
            "cidr" => Ok(Self::Cidr),
            "mixed" => Ok(Self::Mixed),
            _ => Err(Error::InvalidRuleField {
                field: "kind",
                value: s.to_string(),
            }),
        }
    }
}

/// What happens to a matching flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    /// Forward on the direct path
    Direct,
    /// Forward through the VPN tunnel
    Vpn,
    /// Terminate the flow
    Block,
}

impl RouteAction {
    /// Lowercase name as used in ruleset files
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Vpn => "vpn",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "vpn" => Ok(Self::Vpn),
            "block" => Ok(Self::Block),
            _ => Err(Error::InvalidRuleField {
                field: "action",
                value: s.to_string(),
            }),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A routing rule as submitted by the management layer or a ruleset file
///
/// Rules are immutable once stored. An update replaces the stored rule
/// wholesale and publishes a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier
    pub id: String,
    /// Pattern family
    pub kind: RuleKind,
    /// Ordered patterns; at least one
    pub patterns: Vec<String>,
    /// Action for matching flows
    pub action: RouteAction,
    /// Higher wins
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules are stored but never evaluated
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Rule {
    /// Create an enabled rule with priority 0
    pub fn new<I, S>(id: impl Into<String>, kind: RuleKind, patterns: I, action: RouteAction) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            kind,
            patterns: patterns.into_iter().map(Into::into).collect(),
            action,
            priority: 0,
            enabled: true,
        }
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set enabled flag
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Validate and compile every pattern
    ///
    /// Fails on an empty id, an empty pattern list, or the first pattern
    /// that does not parse for this rule's kind.
    pub fn compile(&self) -> Result<Vec<Pattern>> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidRuleField {
                field: "id",
                value: self.id.clone(),
            });
        }
        if self.patterns.is_empty() {
            return Err(Error::EmptyPatterns { id: self.id.clone() });
        }
        self.patterns
            .iter()
            .map(|raw| Pattern::parse(self.kind, raw))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_str() {
        assert_eq!("Domain".parse::<RuleKind>().unwrap(), RuleKind::Domain);
        assert_eq!(" mixed ".parse::<RuleKind>().unwrap(), RuleKind::Mixed);
        assert!(matches!(
            "regex".parse::<RuleKind>(),
            Err(Error::InvalidRuleField { field: "kind", .. })
        ));
    }

    #[test]
    fn test_action_from_str() {
        assert_eq!("VPN".parse::<RouteAction>().unwrap(), RouteAction::Vpn);
        assert!(matches!(
            "teleport".parse::<RouteAction>(),
            Err(Error::InvalidRuleField { field: "action", .. })
        ));
    }

    #[test]
    fn test_rule_deserialize_defaults() {
        let rule: Rule = toml::from_str(
            r#"
id = "r1"
kind = "domain"
patterns = ["example.com"]
action = "vpn"
"#,
        )
        .unwrap();
        assert_eq!(rule.priority, 0);
        assert!(rule.enabled);
    }

    #[test]
    fn test_rule_deserialize_rejects_unknown_action() {
        let rule: std::result::Result<Rule, _> = toml::from_str(
            r#"
id = "r1"
kind = "domain"
patterns = ["example.com"]
action = "tunnel"
"#,
        );
        assert!(rule.is_err());
    }

    #[test]
    fn test_compile_empty_patterns() {
        let rule = Rule::new("r1", RuleKind::Domain, Vec::<String>::new(), RouteAction::Block);
        assert!(matches!(rule.compile(), Err(Error::EmptyPatterns { .. })));
    }

    #[test]
    fn test_compile_empty_id() {
        let rule = Rule::new(" ", RuleKind::Domain, ["example.com"], RouteAction::Block);
        assert!(rule.compile().is_err());
    }

    #[test]
    fn test_compile_bad_cidr() {
        let rule = Rule::new("r1", RuleKind::Cidr, ["10.0.0.0/33"], RouteAction::Vpn);
        assert!(matches!(rule.compile(), Err(Error::InvalidPattern { .. })));
    }
}
