// primitive.rs — Platform firewall primitives.
//
// The enforcer only speaks to the `FirewallPrimitive` trait. A primitive
// installs per-flow drop rules, removes them, lists what it has installed
// and tears down live connections.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::process::Command;
use std::sync::Mutex;

use aw_rules::Protocol;

use crate::error::AgentError;
use crate::flow::FlowKey;

/// Chain all agent rules live in; jumped to from OUTPUT.
pub const CHAIN: &str = "AW_AGENT";

/// Comment prefix marking rules owned by the agent.
pub const TAG_PREFIX: &str = "aw:";

/// A drop rule for one flow, tagged so it can be found and removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveRule {
    pub tag: String,
    pub key: FlowKey,
}

impl PrimitiveRule {
    pub fn new(tag: impl Into<String>, key: FlowKey) -> Self {
        Self {
            tag: tag.into(),
            key,
        }
    }

    fn comment(&self) -> String {
        format!("{}{}", TAG_PREFIX, self.tag)
    }
}

/// Capability interface over the platform packet filter.
///
/// Installation must take effect before the next packet of the flow.
pub trait FirewallPrimitive: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check that rules can actually be installed. Called once at startup.
    fn check_available(&self) -> Result<(), AgentError>;

    fn install(&self, rule: &PrimitiveRule) -> Result<(), AgentError>;

    fn remove(&self, rule: &PrimitiveRule) -> Result<(), AgentError>;

    /// Tags of every rule currently installed by the agent.
    fn list(&self) -> Result<Vec<String>, AgentError>;

    /// Tear down a live connection. Connectionless flows are a no-op.
    fn terminate(&self, key: &FlowKey) -> Result<(), AgentError>;
}

/// Linux netfilter through the `iptables`/`ip6tables` and `ss` binaries.
#[derive(Debug, Clone)]
pub struct IptablesPrimitive {
    iptables: String,
    ip6tables: String,
    ss: String,
}

impl Default for IptablesPrimitive {
    fn default() -> Self {
        Self {
            iptables: "iptables".to_string(),
            ip6tables: "ip6tables".to_string(),
            ss: "ss".to_string(),
        }
    }
}

impl IptablesPrimitive {
    pub fn new() -> Self {
        Self::default()
    }

    fn binary_for(&self, ip: IpAddr) -> &str {
        match ip {
            IpAddr::V4(_) => &self.iptables,
            IpAddr::V6(_) => &self.ip6tables,
        }
    }

    fn run(&self, bin: &str, args: &[String]) -> Result<String, String> {
        let output = Command::new(bin)
            .args(args)
            .output()
            .map_err(|e| format!("{}: {}", bin, e))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(format!(
                "{} {}: {}",
                bin,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    fn failed(&self, reason: String) -> AgentError {
        AgentError::PrimitiveFailed {
            primitive: self.name().to_string(),
            reason,
        }
    }

    fn ensure_chain(&self, bin: &str) -> Result<(), String> {
        if self.run(bin, &args(&["-w", "-S", CHAIN])).is_err() {
            self.run(bin, &args(&["-w", "-N", CHAIN]))?;
        }
        if self
            .run(bin, &args(&["-w", "-C", "OUTPUT", "-j", CHAIN]))
            .is_err()
        {
            self.run(bin, &args(&["-w", "-I", "OUTPUT", "1", "-j", CHAIN]))?;
        }
        Ok(())
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// `iptables` match arguments for one flow, after the `-A/-D CHAIN` part.
pub(crate) fn match_args(rule: &PrimitiveRule) -> Vec<String> {
    let key = &rule.key;
    let mut out = vec![
        "-p".to_string(),
        key.protocol.to_string(),
        "-d".to_string(),
        key.remote_ip.to_string(),
    ];
    if key.protocol != Protocol::Icmp {
        out.extend([
            "--dport".to_string(),
            key.remote_port.to_string(),
            "--sport".to_string(),
            key.local_port.to_string(),
        ]);
    }
    out.extend([
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        rule.comment(),
        "-j".to_string(),
        "DROP".to_string(),
    ]);
    out
}

impl FirewallPrimitive for IptablesPrimitive {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn check_available(&self) -> Result<(), AgentError> {
        let unavailable = |reason: String| AgentError::EnforcementUnavailable {
            primitive: self.name().to_string(),
            reason,
        };
        // SAFETY: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } != 0 {
            return Err(unavailable(
                "root privileges are required to install packet filter rules".to_string(),
            ));
        }
        self.ensure_chain(&self.iptables).map_err(unavailable)?;
        if let Err(e) = self.ensure_chain(&self.ip6tables) {
            tracing::warn!(error = %e, "IPv6 filtering unavailable; IPv6 flows are not enforced");
        }
        Ok(())
    }

    fn install(&self, rule: &PrimitiveRule) -> Result<(), AgentError> {
        let mut argv = args(&["-w", "-I", CHAIN, "1"]);
        argv.extend(match_args(rule));
        self.run(self.binary_for(rule.key.remote_ip), &argv)
            .map(|_| ())
            .map_err(|e| self.failed(e))
    }

    fn remove(&self, rule: &PrimitiveRule) -> Result<(), AgentError> {
        let mut argv = args(&["-w", "-D", CHAIN]);
        argv.extend(match_args(rule));
        self.run(self.binary_for(rule.key.remote_ip), &argv)
            .map(|_| ())
            .map_err(|e| self.failed(e))
    }

    fn list(&self) -> Result<Vec<String>, AgentError> {
        let mut tags = Vec::new();
        for bin in [&self.iptables, &self.ip6tables] {
            let Ok(listing) = self.run(bin, &args(&["-w", "-S", CHAIN])) else {
                continue;
            };
            tags.extend(parse_listing(&listing));
        }
        Ok(tags)
    }

    fn terminate(&self, key: &FlowKey) -> Result<(), AgentError> {
        if key.protocol != Protocol::Tcp {
            return Ok(());
        }
        let argv = vec![
            "-K".to_string(),
            "dst".to_string(),
            key.remote_ip.to_string(),
            "dport".to_string(),
            "=".to_string(),
            format!(":{}", key.remote_port),
            "sport".to_string(),
            "=".to_string(),
            format!(":{}", key.local_port),
        ];
        self.run(&self.ss, &argv)
            .map(|_| ())
            .map_err(|e| self.failed(e))
    }
}

/// Pull agent tags out of `iptables -S` output.
pub(crate) fn parse_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            while let Some(word) = words.next() {
                if word == "--comment" {
                    let comment = words.next()?.trim_matches('"');
                    return comment.strip_prefix(TAG_PREFIX).map(str::to_string);
                }
            }
            None
        })
        .collect()
}

/// In-process primitive. Records what would have been done.
#[derive(Debug, Default)]
pub struct MemoryPrimitive {
    unavailable: Option<String>,
    install_failure: Mutex<Option<String>>,
    rules: Mutex<BTreeMap<String, PrimitiveRule>>,
    terminated: Mutex<Vec<FlowKey>>,
}

impl MemoryPrimitive {
    pub fn new() -> Self {
        Self::default()
    }

    /// A primitive that reports itself unavailable, as on a host without privileges.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Make every later `install` fail with `reason`, or succeed again
    /// when `None`.
    pub fn fail_installs(&self, reason: Option<&str>) {
        if let Ok(mut failure) = self.install_failure.lock() {
            *failure = reason.map(str::to_string);
        }
    }

    pub fn installed(&self) -> Vec<PrimitiveRule> {
        self.rules
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn terminated(&self) -> Vec<FlowKey> {
        self.terminated
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn poisoned(&self) -> AgentError {
        AgentError::PrimitiveFailed {
            primitive: self.name().to_string(),
            reason: "state lock poisoned".to_string(),
        }
    }
}

impl FirewallPrimitive for MemoryPrimitive {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn check_available(&self) -> Result<(), AgentError> {
        match &self.unavailable {
            Some(reason) => Err(AgentError::EnforcementUnavailable {
                primitive: self.name().to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn install(&self, rule: &PrimitiveRule) -> Result<(), AgentError> {
        if let Some(reason) = self
            .install_failure
            .lock()
            .map_err(|_| self.poisoned())?
            .clone()
        {
            return Err(AgentError::PrimitiveFailed {
                primitive: self.name().to_string(),
                reason,
            });
        }
        self.rules
            .lock()
            .map_err(|_| self.poisoned())?
            .insert(rule.tag.clone(), rule.clone());
        Ok(())
    }

    fn remove(&self, rule: &PrimitiveRule) -> Result<(), AgentError> {
        self.rules
            .lock()
            .map_err(|_| self.poisoned())?
            .remove(&rule.tag);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, AgentError> {
        Ok(self
            .rules
            .lock()
            .map_err(|_| self.poisoned())?
            .keys()
            .cloned()
            .collect())
    }

    fn terminate(&self, key: &FlowKey) -> Result<(), AgentError> {
        self.terminated
            .lock()
            .map_err(|_| self.poisoned())?
            .push(*key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(protocol: Protocol) -> PrimitiveRule {
        PrimitiveRule::new(
            "flow-1",
            FlowKey {
                protocol,
                local_ip: "10.0.0.2".parse().unwrap(),
                local_port: 40000,
                remote_ip: "203.0.113.9".parse().unwrap(),
                remote_port: 443,
            },
        )
    }

    #[test]
    fn iptables_args_name_the_exact_flow() {
        let argv = match_args(&rule(Protocol::Tcp)).join(" ");
        assert_eq!(
            argv,
            "-p tcp -d 203.0.113.9 --dport 443 --sport 40000 -m comment --comment aw:flow-1 -j DROP"
        );
    }

    #[test]
    fn icmp_rules_have_no_ports() {
        let argv = match_args(&rule(Protocol::Icmp));
        assert!(!argv.contains(&"--dport".to_string()));
    }

    #[test]
    fn listing_extracts_only_agent_tags() {
        let listing = "-N AW_AGENT\n\
                       -A AW_AGENT -d 203.0.113.9/32 -p tcp -m tcp --dport 443 -m comment --comment aw:flow-1 -j DROP\n\
                       -A AW_AGENT -m comment --comment \"someone-else\" -j ACCEPT\n";
        assert_eq!(parse_listing(listing), vec!["flow-1".to_string()]);
    }

    #[test]
    fn memory_primitive_tracks_rules_and_terminations() {
        let primitive = MemoryPrimitive::new();
        primitive.check_available().unwrap();
        primitive.install(&rule(Protocol::Tcp)).unwrap();
        assert_eq!(primitive.list().unwrap(), vec!["flow-1".to_string()]);
        primitive.terminate(&rule(Protocol::Tcp).key).unwrap();
        assert_eq!(primitive.terminated().len(), 1);
        primitive.remove(&rule(Protocol::Tcp)).unwrap();
        assert!(primitive.installed().is_empty());
    }

    #[test]
    fn memory_primitive_can_refuse_installs() {
        let primitive = MemoryPrimitive::new();
        primitive.fail_installs(Some("table full"));
        assert!(matches!(
            primitive.install(&rule(Protocol::Tcp)),
            Err(AgentError::PrimitiveFailed { .. })
        ));
        primitive.fail_installs(None);
        primitive.install(&rule(Protocol::Tcp)).unwrap();
        assert_eq!(primitive.installed().len(), 1);
    }

    #[test]
    fn unavailable_memory_primitive_reports_unavailable() {
        let primitive = MemoryPrimitive::unavailable("no privilege");
        assert!(matches!(
            primitive.check_available(),
            Err(AgentError::EnforcementUnavailable { .. })
        ));
    }
}
