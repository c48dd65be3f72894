// model.rs — Applications, match clauses, firewall rules, templates, assignments.
//
// Everything in this module is plain data: no I/O, no clocks beyond the
// timestamps stamped at construction. The Rule Store owns the canonical
// copies; agents hold read-only snapshots of them.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RuleError;

/// Identifier of an [`ApplicationInstance`].
pub type InstanceId = Uuid;

/// Identifier of a [`FirewallRule`].
pub type RuleId = Uuid;

/// Lowest accepted rule priority.
pub const PRIORITY_MIN: i32 = -10_000;

/// Highest accepted rule priority.
pub const PRIORITY_MAX: i32 = 10_000;

/// A piece of software, independent of any single running copy.
///
/// Names collide, content hashes do not: when both sides carry a hash the
/// hash alone decides whether two identities denote the same application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ApplicationIdentity {
    /// Display name (e.g., "Firefox").
    pub name: String,
    /// Publisher / vendor, when known.
    #[serde(default)]
    pub publisher: Option<String>,
    /// Lowercase hex SHA-256 of the executable, when known.
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl ApplicationIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            publisher: None,
            content_hash: None,
        }
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into().to_ascii_lowercase());
        self
    }

    /// Whether `other` denotes the same application as `self`.
    pub fn same_application(&self, other: &ApplicationIdentity) -> bool {
        match (&self.content_hash, &other.content_hash) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => {
                self.name.eq_ignore_ascii_case(&other.name)
                    && match (&self.publisher, &other.publisher) {
                        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                        _ => true,
                    }
            }
        }
    }

    /// Stable lookup key: the content hash when present, else the folded
    /// name plus publisher.
    pub fn key(&self) -> String {
        match (&self.content_hash, &self.publisher) {
            (Some(hash), _) => format!("sha256:{}", hash),
            (None, Some(publisher)) => format!(
                "name:{}/{}",
                self.name.to_lowercase(),
                publisher.to_lowercase()
            ),
            (None, None) => format!("name:{}", self.name.to_lowercase()),
        }
    }
}

impl fmt::Display for ApplicationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(publisher) = &self.publisher {
            write!(f, " ({})", publisher)?;
        }
        if let Some(hash) = &self.content_hash {
            let short: String = hash.chars().take(12).collect();
            write!(f, " [{}]", short)?;
        }
        Ok(())
    }
}

/// One observed installation of an application on one endpoint.
///
/// Instances are never deleted. A path or version change produces a new
/// instance and marks the previous one as superseded so historical audit
/// records keep pointing at what actually ran.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationInstance {
    pub instance_id: InstanceId,
    pub identity: ApplicationIdentity,
    pub endpoint_id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub version: Option<String>,
    pub first_seen: DateTime<Utc>,
    #[serde(default)]
    pub superseded_by: Option<InstanceId>,
}

impl ApplicationInstance {
    pub fn new(
        identity: ApplicationIdentity,
        endpoint_id: impl Into<String>,
        path: impl Into<PathBuf>,
        version: Option<String>,
    ) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            identity,
            endpoint_id: endpoint_id.into(),
            path: path.into(),
            version,
            first_seen: Utc::now(),
            superseded_by: None,
        }
    }

    /// Mark this instance as replaced by `next`.
    pub fn supersede(&mut self, next: InstanceId) {
        self.superseded_by = Some(next);
    }

    pub fn is_current(&self) -> bool {
        self.superseded_by.is_none()
    }
}

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        };
        f.write_str(s)
    }
}

impl FromStr for Protocol {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => Err(RuleError::InvalidClause {
                clause: other.to_string(),
                reason: "unknown protocol (expected tcp, udp or icmp)".to_string(),
            }),
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// What a flow looks like to the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    /// Destination host name, when it was observed (SNI, DNS answer, proxy).
    #[serde(default)]
    pub domain: Option<String>,
    /// Rule domains whose resolved addresses include `remote_ip`.
    #[serde(default)]
    pub resolved_names: Vec<String>,
    pub remote_ip: IpAddr,
    pub protocol: Protocol,
    pub remote_port: u16,
}

/// The structural part of a rule: which flows it applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchClause {
    /// Exact host name, or `*.suffix` for any strict subdomain of `suffix`.
    Domain { pattern: String },
    /// Destination address inside a CIDR block.
    Network { cidr: IpNetwork },
    /// Protocol plus destination port range.
    ProtocolPorts { protocol: Protocol, ports: PortRange },
}

impl MatchClause {
    pub fn domain(pattern: impl Into<String>) -> Self {
        MatchClause::Domain {
            pattern: pattern.into(),
        }
    }

    /// Parse an operator-supplied target.
    ///
    /// Accepted forms: an IP address (`10.0.0.1`), a CIDR block
    /// (`10.0.0.0/8`), `proto:port` or `proto:lo-hi` (`tcp:443`,
    /// `udp:6000-7000`), or a domain pattern (`x.com`, `*.example.com`).
    pub fn parse_target(target: &str) -> Result<Self, RuleError> {
        let target = target.trim();
        let invalid = |reason: &str| RuleError::InvalidClause {
            clause: target.to_string(),
            reason: reason.to_string(),
        };

        if let Ok(ip) = target.parse::<IpAddr>() {
            return Ok(MatchClause::Network {
                cidr: IpNetwork::from(ip),
            });
        }
        if target.contains('/') {
            let cidr = IpNetwork::from_str(target).map_err(|e| invalid(&e.to_string()))?;
            return Ok(MatchClause::Network { cidr });
        }
        if let Some((proto, ports)) = target.split_once(':') {
            let protocol: Protocol = proto.parse()?;
            let ports = match ports.split_once('-') {
                Some((lo, hi)) => PortRange::new(
                    lo.parse().map_err(|_| invalid("bad port"))?,
                    hi.parse().map_err(|_| invalid("bad port"))?,
                ),
                None => PortRange::single(ports.parse().map_err(|_| invalid("bad port"))?),
            };
            let clause = MatchClause::ProtocolPorts { protocol, ports };
            clause.validate()?;
            return Ok(clause);
        }

        let clause = MatchClause::domain(target);
        clause.validate()?;
        Ok(clause)
    }

    /// Reject clauses that could never match, or that match more than intended.
    pub fn validate(&self) -> Result<(), RuleError> {
        let invalid = |reason: &str| RuleError::InvalidClause {
            clause: self.to_string(),
            reason: reason.to_string(),
        };
        match self {
            MatchClause::Domain { pattern } => {
                let body = pattern.strip_prefix("*.").unwrap_or(pattern);
                let body = body.trim_end_matches('.');
                if body.is_empty() {
                    return Err(invalid("empty domain pattern"));
                }
                if body.contains('*') {
                    return Err(invalid("only a single leading '*.' wildcard is allowed"));
                }
                if body.split('.').any(|label| label.is_empty()) {
                    return Err(invalid("empty label"));
                }
                if !body
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
                {
                    return Err(invalid("illegal character in domain pattern"));
                }
                Ok(())
            }
            MatchClause::Network { .. } => Ok(()),
            MatchClause::ProtocolPorts { protocol, ports } => {
                if ports.start > ports.end {
                    return Err(invalid("port range start is after its end"));
                }
                if *protocol != Protocol::Icmp && ports.start == 0 {
                    return Err(invalid("port 0 is not a destination port"));
                }
                Ok(())
            }
        }
    }

    /// Whether this clause structurally matches `flow`.
    pub fn matches(&self, flow: &FlowMatch) -> bool {
        match self {
            MatchClause::Domain { pattern } => flow
                .domain
                .iter()
                .chain(flow.resolved_names.iter())
                .any(|host| domain_matches(pattern, host)),
            MatchClause::Network { cidr } => cidr.contains(flow.remote_ip),
            MatchClause::ProtocolPorts { protocol, ports } => {
                *protocol == flow.protocol
                    && (*protocol == Protocol::Icmp || ports.contains(flow.remote_port))
            }
        }
    }
}

impl fmt::Display for MatchClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchClause::Domain { pattern } => write!(f, "{}", pattern),
            MatchClause::Network { cidr } => write!(f, "{}", cidr),
            MatchClause::ProtocolPorts { protocol, ports } => write!(f, "{}:{}", protocol, ports),
        }
    }
}

/// Glob/suffix host matching.
///
/// `*.example.com` matches `api.example.com` and `a.b.example.com`, but not
/// `example.com` itself and not `example.com.attacker.net`. Patterns without
/// a wildcard match the host exactly. Comparison is case-insensitive and
/// ignores a trailing root dot.
pub fn domain_matches(pattern: &str, host: &str) -> bool {
    let pattern = normalize_host(pattern);
    let host = normalize_host(host);
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            host.len() > suffix.len() + 1
                && host.ends_with(suffix)
                && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
        }
        None => host == pattern,
    }
}

fn normalize_host(s: &str) -> String {
    s.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Rule outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Deny,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => f.write_str("allow"),
            Action::Deny => f.write_str("deny"),
        }
    }
}

impl FromStr for Action {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(Action::Allow),
            "deny" | "block" => Ok(Action::Deny),
            other => Err(RuleError::InvalidClause {
                clause: other.to_string(),
                reason: "unknown action (expected allow or deny)".to_string(),
            }),
        }
    }
}

/// Lifecycle state of a rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    #[default]
    Active,
    Disabled,
}

/// Which applications a standalone rule targets.
///
/// Rules carried inside a [`PolicyTemplate`] or as assignment overrides get
/// their scope from the assignment and ignore their own selector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RuleSelector {
    /// Every instance of the application, on every endpoint.
    Identity { identity: ApplicationIdentity },
    /// One installed instance.
    Instance { instance_id: InstanceId },
    /// Every attributed flow.
    Global,
}

impl RuleSelector {
    /// Application-level match (Global is handled by its own tier).
    pub fn selects(&self, instance: &ApplicationInstance) -> bool {
        match self {
            RuleSelector::Identity { identity } => identity.same_application(&instance.identity),
            RuleSelector::Instance { instance_id } => *instance_id == instance.instance_id,
            RuleSelector::Global => false,
        }
    }
}

impl fmt::Display for RuleSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSelector::Identity { identity } => write!(f, "app {}", identity),
            RuleSelector::Instance { instance_id } => write!(f, "instance {}", instance_id),
            RuleSelector::Global => f.write_str("global"),
        }
    }
}

/// The atomic enforcement unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallRule {
    pub rule_id: RuleId,
    pub selector: RuleSelector,
    pub clause: MatchClause,
    pub action: Action,
    /// Higher wins within a tier.
    pub priority: i32,
    #[serde(default)]
    pub state: RuleState,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Rule-set version at which the rule was created; the tie-break key
    /// for "most recently created wins". Stamped by the Rule Store.
    #[serde(default)]
    pub created_seq: u64,
    /// Rule-set version of the last mutation of this rule.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub description: Option<String>,
}

impl FirewallRule {
    pub fn new(selector: RuleSelector, clause: MatchClause, action: Action, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            rule_id: Uuid::new_v4(),
            selector,
            clause,
            action,
            priority,
            state: RuleState::Active,
            created_at: now,
            modified_at: now,
            created_seq: 0,
            revision: 0,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == RuleState::Active
    }

    /// Structural validation, performed by the Rule Store before any write.
    pub fn validate(&self) -> Result<(), RuleError> {
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&self.priority) {
            return Err(RuleError::PriorityOutOfRange {
                priority: self.priority,
                min: PRIORITY_MIN,
                max: PRIORITY_MAX,
            });
        }
        self.clause.validate()
    }
}

/// A named, reusable ordered set of rules, not yet bound to an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyTemplate {
    pub template_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: Vec<FirewallRule>,
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl PolicyTemplate {
    pub fn new(name: impl Into<String>, rules: Vec<FirewallRule>) -> Self {
        let now = Utc::now();
        Self {
            template_id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            rules,
            revision: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::EmptyTemplateName);
        }
        self.rules.iter().try_for_each(FirewallRule::validate)
    }
}

/// Binds a template to one instance, optionally layering overrides on top.
///
/// Overrides are evaluated before any template rule, regardless of numeric
/// priority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyAssignment {
    pub assignment_id: Uuid,
    pub template_id: Uuid,
    pub instance_id: InstanceId,
    #[serde(default)]
    pub overrides: Vec<FirewallRule>,
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl PolicyAssignment {
    pub fn new(template_id: Uuid, instance_id: InstanceId) -> Self {
        let now = Utc::now();
        Self {
            assignment_id: Uuid::new_v4(),
            template_id,
            instance_id,
            overrides: Vec::new(),
            revision: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_overrides(mut self, overrides: Vec<FirewallRule>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        self.overrides.iter().try_for_each(FirewallRule::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(domain: Option<&str>, ip: &str, protocol: Protocol, port: u16) -> FlowMatch {
        FlowMatch {
            domain: domain.map(str::to_string),
            resolved_names: Vec::new(),
            remote_ip: ip.parse().unwrap(),
            protocol,
            remote_port: port,
        }
    }

    #[test]
    fn wildcard_matches_strict_subdomains_only() {
        assert!(domain_matches("*.example.com", "api.example.com"));
        assert!(domain_matches("*.example.com", "a.b.example.com"));
        assert!(!domain_matches("*.example.com", "example.com"));
        assert!(!domain_matches("*.example.com", "example.com.attacker.net"));
        assert!(!domain_matches("*.example.com", "evilexample.com"));
    }

    #[test]
    fn exact_domain_is_case_insensitive_and_ignores_root_dot() {
        assert!(domain_matches("X.com", "x.COM."));
        assert!(!domain_matches("x.com", "www.x.com"));
    }

    #[test]
    fn hash_is_authoritative_over_name() {
        let a = ApplicationIdentity::new("Firefox").with_content_hash("aa11");
        let b = ApplicationIdentity::new("Firefox").with_content_hash("bb22");
        let renamed = ApplicationIdentity::new("fx-nightly").with_content_hash("AA11");
        assert!(!a.same_application(&b));
        assert!(a.same_application(&renamed));
    }

    #[test]
    fn name_comparison_without_hash_respects_publisher() {
        let a = ApplicationIdentity::new("Firefox").with_publisher("Mozilla");
        let b = ApplicationIdentity::new("firefox");
        let c = ApplicationIdentity::new("Firefox").with_publisher("Impostor Inc");
        assert!(a.same_application(&b));
        assert!(!a.same_application(&c));
    }

    #[test]
    fn key_separates_publishers_when_unhashed() {
        let a = ApplicationIdentity::new("Foo").with_publisher("Acme");
        let b = ApplicationIdentity::new("foo").with_publisher("Globex");
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), ApplicationIdentity::new("FOO").with_publisher("ACME").key());
        assert_eq!(
            ApplicationIdentity::new("Foo").with_publisher("Acme").with_content_hash("AB12").key(),
            "sha256:ab12"
        );
    }

    #[test]
    fn display_shortens_any_hash_safely() {
        let id = ApplicationIdentity::new("Tool").with_content_hash("0123456789abcdef");
        assert_eq!(id.to_string(), "Tool [0123456789ab]");
        let odd = ApplicationIdentity::new("Tool").with_content_hash("ééééééééééééé");
        assert_eq!(odd.to_string(), "Tool [éééééééééééé]");
    }

    #[test]
    fn parse_target_forms() {
        assert_eq!(
            MatchClause::parse_target("10.1.2.3").unwrap(),
            MatchClause::Network {
                cidr: "10.1.2.3/32".parse().unwrap()
            }
        );
        assert!(matches!(
            MatchClause::parse_target("10.0.0.0/8").unwrap(),
            MatchClause::Network { .. }
        ));
        assert_eq!(
            MatchClause::parse_target("udp:6000-7000").unwrap(),
            MatchClause::ProtocolPorts {
                protocol: Protocol::Udp,
                ports: PortRange::new(6000, 7000)
            }
        );
        assert_eq!(
            MatchClause::parse_target("*.x.com").unwrap(),
            MatchClause::domain("*.x.com")
        );
    }

    #[test]
    fn malformed_clauses_are_rejected() {
        assert!(MatchClause::parse_target("tcp:9-1").is_err());
        assert!(MatchClause::parse_target("sctp:80").is_err());
        assert!(MatchClause::domain("*").validate().is_err());
        assert!(MatchClause::domain("a.*.com").validate().is_err());
        assert!(MatchClause::domain("bad host.com").validate().is_err());
        assert!(MatchClause::parse_target("300.1.1.1/8").is_err());
    }

    #[test]
    fn clause_matching() {
        let net = MatchClause::parse_target("10.0.0.0/8").unwrap();
        assert!(net.matches(&flow(None, "10.9.8.7", Protocol::Tcp, 443)));
        assert!(!net.matches(&flow(None, "11.0.0.1", Protocol::Tcp, 443)));

        let ports = MatchClause::parse_target("tcp:8000-8080").unwrap();
        assert!(ports.matches(&flow(None, "1.1.1.1", Protocol::Tcp, 8080)));
        assert!(!ports.matches(&flow(None, "1.1.1.1", Protocol::Udp, 8080)));

        let domain = MatchClause::domain("*.example.com");
        assert!(domain.matches(&flow(Some("api.example.com"), "1.1.1.1", Protocol::Tcp, 443)));
        assert!(!domain.matches(&flow(None, "1.1.1.1", Protocol::Tcp, 443)));
        let mut by_address = flow(None, "104.244.42.1", Protocol::Tcp, 443);
        assert!(!MatchClause::domain("x.com").matches(&by_address));
        by_address.resolved_names = vec!["x.com".to_string()];
        assert!(MatchClause::domain("x.com").matches(&by_address));
        assert!(!MatchClause::domain("y.com").matches(&by_address));
    }

    #[test]
    fn priority_bounds_are_enforced() {
        let rule = FirewallRule::new(
            RuleSelector::Global,
            MatchClause::domain("x.com"),
            Action::Deny,
            PRIORITY_MAX + 1,
        );
        assert!(matches!(
            rule.validate(),
            Err(RuleError::PriorityOutOfRange { .. })
        ));
    }

    #[test]
    fn clause_serializes_with_kind_tag() {
        let json = serde_json::to_value(MatchClause::domain("x.com")).unwrap();
        assert_eq!(json["kind"], "domain");
        assert_eq!(json["pattern"], "x.com");
    }
}
